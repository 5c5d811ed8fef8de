use crate::error::{Error, Result};
use crate::pool::handle::KeyUsageHandle;
use crate::pool::manager::CredentialPool;
use std::time::Duration;

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// 没有可用 key 时是否等待，以及等多久、多久重试一次。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub wait: bool,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl WaitPolicy {
    pub const NO_WAIT: WaitPolicy = WaitPolicy {
        wait: false,
        timeout: Duration::ZERO,
        poll_interval: DEFAULT_POLL_INTERVAL,
    };

    fn poll(&self) -> Duration {
        self.poll_interval.max(Duration::from_millis(1))
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            wait: true,
            timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl CredentialPool {
    /// 按策略轮询 `acquire`，直到拿到 key 或超时。
    pub async fn acquire_with(
        &self,
        model_id: &str,
        estimated_tokens: u64,
        policy: WaitPolicy,
    ) -> Result<KeyUsageHandle> {
        if let Some(h) = self.acquire(model_id, estimated_tokens) {
            return Ok(h);
        }
        if !policy.wait {
            return Err(Error::no_available_key(self.provider(), model_id));
        }

        let started = tokio::time::Instant::now();
        let deadline = started + policy.timeout;
        tracing::debug!(provider = %self.provider(), model = model_id, "没有可用的 key，开始等待");
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(Error::timeout(self.provider(), model_id, started.elapsed()));
            }
            tokio::time::sleep(policy.poll().min(deadline - now)).await;
            if let Some(h) = self.acquire(model_id, estimated_tokens) {
                return Ok(h);
            }
        }
    }

    /// `acquire_with` 的同步版本，在当前线程上睡眠等待。
    pub fn acquire_blocking(
        &self,
        model_id: &str,
        estimated_tokens: u64,
        policy: WaitPolicy,
    ) -> Result<KeyUsageHandle> {
        if let Some(h) = self.acquire(model_id, estimated_tokens) {
            return Ok(h);
        }
        if !policy.wait {
            return Err(Error::no_available_key(self.provider(), model_id));
        }

        let started = std::time::Instant::now();
        let deadline = started + policy.timeout;
        loop {
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(Error::timeout(self.provider(), model_id, started.elapsed()));
            }
            std::thread::sleep(policy.poll().min(deadline - now));
            if let Some(h) = self.acquire(model_id, estimated_tokens) {
                return Ok(h);
            }
        }
    }
}
