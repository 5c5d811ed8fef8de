use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("没有可用的 API key: {provider}/{model}")]
    NoAvailableKey { provider: String, model: String },

    #[error("等待可用 API key 超时: {provider}/{model}（{waited:?}）")]
    Timeout {
        provider: String,
        model: String,
        waited: Duration,
    },

    #[error("未找到指定的 key: {0}")]
    KeyNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn no_available_key(provider: &str, model: &str) -> Self {
        Self::NoAvailableKey {
            provider: provider.to_string(),
            model: model.to_string(),
        }
    }

    pub fn timeout(provider: &str, model: &str, waited: Duration) -> Self {
        Self::Timeout {
            provider: provider.to_string(),
            model: model.to_string(),
            waited,
        }
    }

    pub fn key_not_found(identifier: impl Into<String>) -> Self {
        Self::KeyNotFound(identifier.into())
    }

    /// 额度耗尽类的终态失败（无 key / 超时）。
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::NoAvailableKey { .. } | Self::Timeout { .. })
    }
}
