use crate::error::{Error, Result};
use crate::limits::LimitTable;
use crate::logging::LogLevel;
use crate::pool::{PoolOptions, WaitPolicy};
use crate::rotating::RotateOptions;
use crate::usage::LoggerOptions;
use crate::util::clock::Clock;
use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_PROVIDER: &str = "cerebras";
const DEFAULT_MODEL: &str = "llama3.1-8b";
const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_COHERE_TIER: &str = "free";

#[derive(Debug, Clone)]
pub struct Config {
    pub provider: String,
    pub model: String,

    /// `memory`、`sqlite:///path`、`jsonl://dir`
    pub db_url: String,
    pub data_dir: String,

    pub debug: String,

    pub limits_file: Option<PathBuf>,
    pub cohere_tier: String,

    pub cooldown_secs: u64,
    pub wait_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub max_retries: usize,
    pub estimated_tokens: u64,

    pub log_batch_size: usize,
    pub log_flush_interval_ms: u64,
    pub log_max_write_attempts: u32,

    pub history_lookback_secs: u64,
    pub reservation_ttl_secs: u64,
    pub retention_days: u32,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "KEYCYCLE_PROVIDER")]
    keycycle_provider: Option<String>,
    #[serde(alias = "KEYCYCLE_MODEL")]
    keycycle_model: Option<String>,

    #[serde(alias = "DB_URL")]
    db_url: Option<String>,
    #[serde(alias = "DATA_DIR")]
    data_dir: Option<String>,

    #[serde(alias = "DEBUG")]
    debug: Option<String>,

    #[serde(alias = "LIMITS_FILE")]
    limits_file: Option<String>,
    #[serde(alias = "COHERE_TIER")]
    cohere_tier: Option<String>,

    #[serde(alias = "COOLDOWN_SECS")]
    cooldown_secs: Option<u64>,
    #[serde(alias = "WAIT_TIMEOUT_MS")]
    wait_timeout_ms: Option<u64>,
    #[serde(alias = "POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,
    #[serde(alias = "MAX_RETRIES")]
    max_retries: Option<usize>,
    #[serde(alias = "ESTIMATED_TOKENS")]
    estimated_tokens: Option<u64>,

    #[serde(alias = "LOG_BATCH_SIZE")]
    log_batch_size: Option<usize>,
    #[serde(alias = "LOG_FLUSH_INTERVAL_MS")]
    log_flush_interval_ms: Option<u64>,
    #[serde(alias = "LOG_MAX_WRITE_ATTEMPTS")]
    log_max_write_attempts: Option<u32>,

    #[serde(alias = "HISTORY_LOOKBACK_SECS")]
    history_lookback_secs: Option<u64>,
    #[serde(alias = "RESERVATION_TTL_SECS")]
    reservation_ttl_secs: Option<u64>,
    #[serde(alias = "RETENTION_DAYS")]
    retention_days: Option<u32>,
}

impl Config {
    /// 任何一个变量格式不对都是配置错误，不会静默回落到默认值。
    pub fn load() -> Result<Self> {
        // .env 只补充缺失的变量，不覆盖已有的
        let _ = dotenvy::dotenv();

        let mut cfg = Self::from_figment(&Figment::from(Env::raw()))?;

        // 命令行覆盖：-debug <level> / -provider <name> / -model <id>
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-debug" | "--debug" => {
                    if let Some(v) = args.next() {
                        cfg.debug = v;
                    }
                }
                "-provider" | "--provider" => {
                    if let Some(v) = args.next() {
                        cfg.provider = v.trim().to_lowercase();
                    }
                }
                "-model" | "--model" => {
                    if let Some(v) = args.next() {
                        cfg.model = v;
                    }
                }
                _ => {}
            }
        }

        Ok(cfg)
    }

    fn from_figment(figment: &Figment) -> Result<Self> {
        let raw = figment
            .extract::<RawEnv>()
            .map_err(|e| Error::config(format!("环境变量解析失败: {e}")))?;
        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: RawEnv) -> Self {
        let data_dir = non_empty(raw.data_dir).unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());
        let db_url = non_empty(raw.db_url).unwrap_or_else(|| {
            format!("jsonl://{}", PathBuf::from(&data_dir).join("usage").display())
        });

        Self {
            provider: non_empty(raw.keycycle_provider)
                .map(|p| p.to_lowercase())
                .unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
            model: non_empty(raw.keycycle_model).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            db_url,
            data_dir,
            debug: raw.debug.unwrap_or_else(|| "low".to_string()),
            limits_file: non_empty(raw.limits_file).map(PathBuf::from),
            cohere_tier: non_empty(raw.cohere_tier)
                .unwrap_or_else(|| DEFAULT_COHERE_TIER.to_string()),
            cooldown_secs: raw.cooldown_secs.unwrap_or(30),
            wait_timeout_ms: raw.wait_timeout_ms.unwrap_or(10_000),
            poll_interval_ms: raw.poll_interval_ms.unwrap_or(500),
            max_retries: raw.max_retries.unwrap_or(5),
            estimated_tokens: raw.estimated_tokens.unwrap_or(1000),
            log_batch_size: raw.log_batch_size.unwrap_or(64),
            log_flush_interval_ms: raw.log_flush_interval_ms.unwrap_or(1000),
            log_max_write_attempts: raw.log_max_write_attempts.unwrap_or(3),
            history_lookback_secs: raw.history_lookback_secs.unwrap_or(86_400),
            reservation_ttl_secs: raw.reservation_ttl_secs.unwrap_or(600),
            retention_days: raw.retention_days.unwrap_or(7),
        }
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::parse(&self.debug)
    }

    /// 内置配额表，再叠加 `LIMITS_FILE`（如果配置了）。
    pub fn limit_table(&self) -> Result<LimitTable> {
        let mut table = LimitTable::builtin(&self.cohere_tier);
        if let Some(path) = &self.limits_file {
            table.overlay_toml_file(path)?;
        }
        Ok(table)
    }

    pub fn logger_options(&self) -> LoggerOptions {
        LoggerOptions {
            batch_size: self.log_batch_size,
            flush_interval: Duration::from_millis(self.log_flush_interval_ms),
            max_write_attempts: self.log_max_write_attempts,
        }
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            wait: self.wait_timeout_ms > 0,
            timeout: Duration::from_millis(self.wait_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn rotate_options(&self) -> RotateOptions {
        RotateOptions {
            max_retries: self.max_retries,
            estimated_tokens: self.estimated_tokens,
            wait: self.wait_policy(),
        }
    }

    pub fn pool_options(&self, clock: Arc<dyn Clock>) -> Result<PoolOptions> {
        Ok(PoolOptions {
            provider: self.provider.clone(),
            limits: self.limit_table()?,
            overrides: Vec::new(),
            cooldown: Duration::from_secs(self.cooldown_secs),
            history_lookback: Duration::from_secs(self.history_lookback_secs),
            reservation_ttl: Duration::from_secs(self.reservation_ttl_secs),
            logger: self.logger_options(),
            clock,
        })
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// 从环境变量读取某个 provider 的 key 列表：`NUM_<P>` 给出数量，`<P>_API_KEY_1..=N` 给出各个 key。
pub fn load_api_keys(provider: &str) -> Result<Vec<String>> {
    load_api_keys_with(provider, |name| std::env::var(name).ok())
}

pub fn load_api_keys_with<F>(provider: &str, lookup: F) -> Result<Vec<String>>
where
    F: Fn(&str) -> Option<String>,
{
    let p = provider.trim().to_uppercase();
    if p.is_empty() {
        return Err(Error::config("provider 不能为空"));
    }

    let num_var = format!("NUM_{p}");
    let raw = lookup(&num_var).ok_or_else(|| Error::config(format!("缺少环境变量 {num_var}")))?;
    let n: usize = raw
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{num_var} 不是合法的数字: {raw:?}")))?;
    if n == 0 {
        return Err(Error::config(format!("{num_var} 必须大于 0")));
    }

    let mut keys = Vec::with_capacity(n);
    for i in 1..=n {
        let var = format!("{p}_API_KEY_{i}");
        let key = lookup(&var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::config(format!("缺少环境变量 {var}")))?;
        keys.push(key);
    }
    Ok(keys)
}
