use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 一次已结算调用的持久化记录，只追加不修改。
///
/// 凭据只以展示后缀出现，secret 不会落盘。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub provider: String,
    pub model_id: String,
    pub credential_suffix: String,
    pub token_count: u64,
    pub timestamp: DateTime<Utc>,
}

impl UsageEvent {
    pub fn new(
        provider: &str,
        model_id: &str,
        credential_suffix: &str,
        token_count: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            provider: provider.to_string(),
            model_id: model_id.to_string(),
            credential_suffix: credential_suffix.to_string(),
            token_count,
            timestamp,
        }
    }

    pub fn matches(&self, provider: &str, suffix: Option<&str>, since: DateTime<Utc>) -> bool {
        self.provider == provider
            && suffix.is_none_or(|s| s == self.credential_suffix)
            && self.timestamp >= since
    }
}
