//! 配额描述与解析。
//!
//! 配额表是显式配置：由调用方构造（内置表 + 可选 TOML 覆盖）后交给 `CredentialPool`。

mod table;
mod types;

pub use table::{DEFAULT_MODEL_KEY, LimitTable, ProviderLimits, cohere_tier_limits};
pub use types::{KeyLimitOverride, RateLimitStrategy, RateLimits, TrackingKey, Window};
