use crate::error::Error;
use crate::limits::types::{RateLimitStrategy, RateLimits, TrackingKey};
use figment::Figment;
use figment::providers::{Format, Toml};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// provider 级别的“通配”模型名。
pub const DEFAULT_MODEL_KEY: &str = "default";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderLimits {
    pub strategy: RateLimitStrategy,
    pub models: HashMap<String, RateLimits>,
}

/// 各 provider / 模型的配额表，构造后作为配置传入 `CredentialPool`。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LimitTable {
    providers: HashMap<String, ProviderLimits>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTable {
    #[serde(default)]
    providers: HashMap<String, RawProvider>,
}

#[derive(Debug, Default, Deserialize)]
struct RawProvider {
    strategy: Option<RateLimitStrategy>,
    #[serde(default)]
    models: HashMap<String, RateLimits>,
}

impl LimitTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析顺序：精确 (provider, model) → (provider, "default") → 保守兜底。
    pub fn resolve(&self, provider: &str, model_id: &str) -> RateLimits {
        let Some(p) = self.providers.get(&normalize(provider)) else {
            return RateLimits::FALLBACK;
        };
        p.models
            .get(model_id)
            .or_else(|| p.models.get(DEFAULT_MODEL_KEY))
            .copied()
            .unwrap_or(RateLimits::FALLBACK)
    }

    pub fn strategy(&self, provider: &str) -> RateLimitStrategy {
        self.providers
            .get(&normalize(provider))
            .map(|p| p.strategy)
            .unwrap_or_default()
    }

    pub fn tracking_key(&self, provider: &str, model_id: &str) -> TrackingKey {
        TrackingKey::new(&normalize(provider), model_id, self.strategy(provider))
    }

    pub fn set_strategy(&mut self, provider: &str, strategy: RateLimitStrategy) {
        self.providers.entry(normalize(provider)).or_default().strategy = strategy;
    }

    pub fn insert(&mut self, provider: &str, model_id: &str, limits: RateLimits) {
        self.providers
            .entry(normalize(provider))
            .or_default()
            .models
            .insert(model_id.to_string(), limits);
    }

    pub fn with(mut self, provider: &str, model_id: &str, limits: RateLimits) -> Self {
        self.insert(provider, model_id, limits);
        self
    }

    pub fn provider(&self, provider: &str) -> Option<&ProviderLimits> {
        self.providers.get(&normalize(provider))
    }

    /// 从 TOML 文件叠加配置：同名模型覆盖，strategy 仅在文件中出现时替换。
    ///
    /// ```toml
    /// [providers.groq]
    /// strategy = "per_model"
    /// [providers.groq.models."llama-3.1-8b-instant"]
    /// requests_per_minute = 30
    /// tokens_per_minute = 6000
    /// ```
    pub fn overlay_toml_file(&mut self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::config(format!(
                "限额配置文件不存在: {}",
                path.display()
            )));
        }
        let raw: RawTable = Figment::new()
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| Error::config(format!("解析限额配置失败: {e}")))?;
        self.apply(raw)
    }

    pub fn overlay_toml_str(&mut self, content: &str) -> Result<(), Error> {
        let raw: RawTable = Figment::new()
            .merge(Toml::string(content))
            .extract()
            .map_err(|e| Error::config(format!("解析限额配置失败: {e}")))?;
        self.apply(raw)
    }

    fn apply(&mut self, raw: RawTable) -> Result<(), Error> {
        for (name, rp) in raw.providers {
            for (model, limits) in &rp.models {
                limits
                    .validate()
                    .map_err(|e| Error::config(format!("{name}/{model}: {e}")))?;
            }
            let entry = self.providers.entry(normalize(&name)).or_default();
            if let Some(s) = rp.strategy {
                entry.strategy = s;
            }
            entry.models.extend(rp.models);
        }
        Ok(())
    }

    /// 内置的各 provider 免费档限额。
    pub fn builtin(cohere_tier: &str) -> Self {
        let mut t = Self::new();

        t.set_strategy("cerebras", RateLimitStrategy::PerModel);
        for m in [
            "gpt-oss-120b",
            "llama3.1-8b",
            "llama-3.3-70b",
            "qwen-3-32b",
            "qwen-3-235b-a22b-instruct-2507",
        ] {
            t.insert(
                "cerebras",
                m,
                RateLimits::requests(30, 900, 14_400).tokens(60_000, 1_000_000, 1_000_000),
            );
        }
        for m in ["zai-glm-4.6", "zai-glm-4.7"] {
            t.insert(
                "cerebras",
                m,
                RateLimits::requests(10, 100, 100).tokens(150_000, 1_000_000, 1_000_000),
            );
        }

        t.set_strategy("groq", RateLimitStrategy::PerModel);
        let groq: [(&str, RateLimits); 20] = [
            (
                "allam-2-7b",
                RateLimits::requests(30, 1800, 7000).tokens(6000, 360_000, 500_000),
            ),
            (
                "canopylabs/orpheus-arabic-saudi",
                RateLimits::requests(10, 100, 1200).tokens(3600, None, None),
            ),
            (
                "canopylabs/orpheus-v1-english",
                RateLimits::requests(10, 100, 1200).tokens(3600, None, None),
            ),
            (
                "groq/compound",
                RateLimits::requests(30, 250, 250).tokens(70_000, None, None),
            ),
            (
                "groq/compound-mini",
                RateLimits::requests(30, 250, 250).tokens(70_000, None, None),
            ),
            (
                "llama-3.1-8b-instant",
                RateLimits::requests(30, 1800, 14_400).tokens(6000, 360_000, 500_000),
            ),
            (
                "llama-3.3-70b-versatile",
                RateLimits::requests(30, 1000, 1000).tokens(12_000, 720_000, 100_000),
            ),
            (
                "meta-llama/llama-4-maverick-17b-128e-instruct",
                RateLimits::requests(30, 1000, 1000).tokens(6000, 360_000, 500_000),
            ),
            (
                "meta-llama/llama-4-scout-17b-16e-instruct",
                RateLimits::requests(30, 1000, 1000).tokens(30_000, 1_800_000, 500_000),
            ),
            (
                "meta-llama/llama-guard-4-12b",
                RateLimits::requests(30, 1800, 14_400).tokens(15_000, 900_000, 500_000),
            ),
            (
                "meta-llama/llama-prompt-guard-2-22m",
                RateLimits::requests(30, 1800, 14_400).tokens(15_000, 900_000, 500_000),
            ),
            (
                "meta-llama/llama-prompt-guard-2-86m",
                RateLimits::requests(30, 1800, 14_400).tokens(15_000, 900_000, 500_000),
            ),
            (
                "moonshotai/kimi-k2-instruct",
                RateLimits::requests(60, 1000, 1000).tokens(10_000, 600_000, 300_000),
            ),
            (
                "moonshotai/kimi-k2-instruct-0905",
                RateLimits::requests(60, 1000, 1000).tokens(10_000, 600_000, 300_000),
            ),
            (
                "openai/gpt-oss-120b",
                RateLimits::requests(30, 1000, 1000).tokens(8000, 480_000, 200_000),
            ),
            (
                "openai/gpt-oss-20b",
                RateLimits::requests(30, 1000, 1000).tokens(8000, 480_000, 200_000),
            ),
            (
                "openai/gpt-oss-safeguard-20b",
                RateLimits::requests(30, 1000, 1000).tokens(8000, 480_000, 200_000),
            ),
            (
                "qwen/qwen3-32b",
                RateLimits::requests(60, 1000, 1000).tokens(6000, 360_000, 500_000),
            ),
            ("whisper-large-v3", RateLimits::requests(20, 2000, 2000)),
            ("whisper-large-v3-turbo", RateLimits::requests(20, 2000, 2000)),
        ];
        for (m, l) in groq {
            t.insert("groq", m, l);
        }
        for m in ["playai-tts", "playai-tts-arabic"] {
            t.insert(
                "groq",
                m,
                RateLimits::requests(10, 100, 100).tokens(1200, 72_000, 3600),
            );
        }

        t.set_strategy("gemini", RateLimitStrategy::PerModel);
        t.insert(
            "gemini",
            "gemini-2.5-flash",
            RateLimits::requests(5, 300, 20).tokens(250_000, 15_000_000, None),
        );
        t.insert(
            "gemini",
            "gemini-2.5-flash-lite",
            RateLimits::requests(10, 600, 20).tokens(250_000, 15_000_000, None),
        );
        t.insert(
            "gemini",
            "gemini-2.5-flash-tts",
            RateLimits::requests(3, 180, 10).tokens(10_000, 600_000, None),
        );
        t.insert(
            "gemini",
            "gemini-robotics-er-1.5-preview",
            RateLimits::requests(10, 600, 250).tokens(250_000, 15_000_000, None),
        );
        for m in ["gemma-3-12b", "gemma-3-1b", "gemma-3-27b", "gemma-3-2b", "gemma-3-4b"] {
            t.insert(
                "gemini",
                m,
                RateLimits::requests(30, 1800, 14_400).tokens(15_000, 900_000, None),
            );
        }

        t.set_strategy("openrouter", RateLimitStrategy::Global);
        t.insert("openrouter", DEFAULT_MODEL_KEY, RateLimits::requests(20, 50, 50));

        t.set_strategy("cohere", RateLimitStrategy::PerModel);
        t.insert("cohere", DEFAULT_MODEL_KEY, cohere_tier_limits(cohere_tier));

        t
    }
}

/// Cohere 所有模型共用一档额度；未知档位按 free 处理。
pub fn cohere_tier_limits(tier: &str) -> RateLimits {
    match tier.trim().to_lowercase().as_str() {
        "pro" => RateLimits::requests(500, 30_000, 1_440_000),
        "enterprise" => RateLimits::requests(1000, 60_000, 2_880_000),
        _ => RateLimits::requests(20, 1200, 72_000),
    }
}

fn normalize(provider: &str) -> String {
    provider.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::types::Window;

    #[test]
    fn resolve_prefers_exact_then_default_then_fallback() {
        let t = LimitTable::builtin("free");

        let exact = t.resolve("groq", "llama-3.1-8b-instant");
        assert_eq!(exact.requests_per_day, Some(14_400));

        let default = t.resolve("openrouter", "qwen/qwen3-coder:free");
        assert_eq!(default, RateLimits::requests(20, 50, 50));

        // groq 没有 default 条目，未知模型直接走兜底
        assert_eq!(t.resolve("groq", "no-such-model"), RateLimits::FALLBACK);
        assert_eq!(t.resolve("unknown", "x"), RateLimits::FALLBACK);
    }

    #[test]
    fn strategy_defaults_to_per_model() {
        let t = LimitTable::builtin("free");
        assert_eq!(t.strategy("openrouter"), RateLimitStrategy::Global);
        assert_eq!(t.strategy("GROQ"), RateLimitStrategy::PerModel);
        assert_eq!(t.strategy("nobody"), RateLimitStrategy::PerModel);
        assert_eq!(t.tracking_key("OpenRouter", "m").model, None);
    }

    #[test]
    fn cohere_tier_selects_limits() {
        let pro = LimitTable::builtin("PRO").resolve("cohere", "command-r");
        assert_eq!(pro.requests_per_minute, Some(500));
        let unknown = LimitTable::builtin("gold").resolve("cohere", "command-r");
        assert_eq!(unknown.requests_per_minute, Some(20));
    }

    #[test]
    fn toml_overlay_merges_models_and_strategy() {
        let mut t = LimitTable::builtin("free");
        t.overlay_toml_str(
            r#"
            [providers.groq]
            strategy = "global"
            [providers.groq.models.default]
            requests_per_minute = 3

            [providers.acme.models."m-1"]
            requests_per_minute = 1
            tokens_per_day = 500
            "#,
        )
        .expect("overlay");

        assert_eq!(t.strategy("groq"), RateLimitStrategy::Global);
        // 旧条目保留
        assert_eq!(
            t.resolve("groq", "llama-3.1-8b-instant").requests_per_minute,
            Some(30)
        );
        assert_eq!(t.resolve("groq", "other").requests_per_minute, Some(3));

        let acme = t.resolve("acme", "m-1");
        assert_eq!(acme.request_limit(Window::Minute), Some(1));
        assert_eq!(acme.token_limit(Window::Day), Some(500));
        assert_eq!(acme.request_limit(Window::Hour), None);
    }

    #[test]
    fn toml_overlay_rejects_zero_limits() {
        let mut t = LimitTable::new();
        let err = t
            .overlay_toml_str("[providers.x.models.m]\nrequests_per_minute = 0\n")
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
