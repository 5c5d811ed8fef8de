use crate::credential::KeyIdentifier;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 统计窗口。最长窗口（天）同时决定内存里保留多久的事件。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    Minute,
    Hour,
    Day,
}

impl Window {
    pub const ALL: [Window; 3] = [Window::Minute, Window::Hour, Window::Day];
    pub const LONGEST: Window = Window::Day;

    pub const fn seconds(self) -> i64 {
        match self {
            Window::Minute => 60,
            Window::Hour => 60 * 60,
            Window::Day => 24 * 60 * 60,
        }
    }

    pub fn duration(self) -> chrono::Duration {
        chrono::Duration::seconds(self.seconds())
    }
}

/// 单个模型（或 provider 全局）的配额描述。`None` 表示该窗口不限。
///
/// 约定上 day ≥ hour ≥ minute，但这里不做强制。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    pub requests_per_minute: Option<u64>,
    pub requests_per_hour: Option<u64>,
    pub requests_per_day: Option<u64>,
    pub tokens_per_minute: Option<u64>,
    pub tokens_per_hour: Option<u64>,
    pub tokens_per_day: Option<u64>,
}

impl RateLimits {
    /// 找不到任何配置时使用的保守限额。
    pub const FALLBACK: RateLimits = RateLimits::requests(10, 100, 1000);

    pub const fn unlimited() -> Self {
        Self {
            requests_per_minute: None,
            requests_per_hour: None,
            requests_per_day: None,
            tokens_per_minute: None,
            tokens_per_hour: None,
            tokens_per_day: None,
        }
    }

    /// 只限制请求数（分钟/小时/天）。
    pub const fn requests(rpm: u64, rph: u64, rpd: u64) -> Self {
        Self {
            requests_per_minute: Some(rpm),
            requests_per_hour: Some(rph),
            requests_per_day: Some(rpd),
            tokens_per_minute: None,
            tokens_per_hour: None,
            tokens_per_day: None,
        }
    }

    pub fn tokens(
        mut self,
        tpm: impl Into<Option<u64>>,
        tph: impl Into<Option<u64>>,
        tpd: impl Into<Option<u64>>,
    ) -> Self {
        self.tokens_per_minute = tpm.into();
        self.tokens_per_hour = tph.into();
        self.tokens_per_day = tpd.into();
        self
    }

    pub fn request_limit(&self, w: Window) -> Option<u64> {
        match w {
            Window::Minute => self.requests_per_minute,
            Window::Hour => self.requests_per_hour,
            Window::Day => self.requests_per_day,
        }
    }

    pub fn token_limit(&self, w: Window) -> Option<u64> {
        match w {
            Window::Minute => self.tokens_per_minute,
            Window::Hour => self.tokens_per_hour,
            Window::Day => self.tokens_per_day,
        }
    }

    /// 配额必须是正整数；0 只会让所有请求被拒绝，视为配置错误。
    pub fn validate(&self) -> Result<(), String> {
        for w in Window::ALL {
            if self.request_limit(w) == Some(0) {
                return Err(format!("requests per {w:?} 不能为 0"));
            }
            if self.token_limit(w) == Some(0) {
                return Err(format!("tokens per {w:?} 不能为 0"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    /// 每个模型单独计额。
    #[default]
    PerModel,
    /// 整个 provider 共享一份额度。
    Global,
}

/// 选择使用哪一份 RateLimits 以及哪个账本桶。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackingKey {
    pub provider: String,
    pub model: Option<String>,
}

impl TrackingKey {
    pub fn new(provider: &str, model_id: &str, strategy: RateLimitStrategy) -> Self {
        let model = match strategy {
            RateLimitStrategy::PerModel => Some(model_id.to_string()),
            RateLimitStrategy::Global => None,
        };
        Self {
            provider: provider.to_string(),
            model,
        }
    }
}

impl fmt::Display for TrackingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.model {
            Some(m) => write!(f, "{}/{}", self.provider, m),
            None => write!(f, "{}/*", self.provider),
        }
    }
}

/// 针对单个 key 的额度覆盖：`model` 为空时对该 key 的所有模型生效。
#[derive(Debug, Clone)]
pub struct KeyLimitOverride {
    pub key: KeyIdentifier,
    pub model: Option<String>,
    pub limits: RateLimits,
}

impl KeyLimitOverride {
    pub fn matches_model(&self, model_id: &str) -> bool {
        self.model.as_deref().is_none_or(|m| m == model_id)
    }
}
