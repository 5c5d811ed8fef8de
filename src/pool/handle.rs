use crate::credential::Credential;
use crate::ledger::ReservationId;
use crate::limits::TrackingKey;
use crate::pool::manager::Shared;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// 一次准入的凭证：持有 secret、tracking key 和预留的估算额度。
///
/// 用完后交给 `CredentialPool::record_usage` 结算；未结算就丢弃时自动归还预留。
pub struct KeyUsageHandle {
    pub(crate) shared: Arc<Shared>,
    index: usize,
    suffix: String,
    secret: Arc<str>,
    tracking_key: TrackingKey,
    model_id: String,
    reservation: ReservationId,
    estimated_tokens: u64,
    settled: AtomicBool,
}

impl KeyUsageHandle {
    pub(crate) fn new(
        shared: Arc<Shared>,
        credential: &Credential,
        tracking_key: TrackingKey,
        model_id: &str,
        reservation: ReservationId,
        estimated_tokens: u64,
    ) -> Self {
        Self {
            shared,
            index: credential.index(),
            suffix: credential.suffix().to_string(),
            secret: credential.secret().clone(),
            tracking_key,
            model_id: model_id.to_string(),
            reservation,
            estimated_tokens,
            settled: AtomicBool::new(false),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.secret
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn label(&self) -> String {
        format!("Key #{} (..{})", self.index + 1, self.suffix)
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn tracking_key(&self) -> &TrackingKey {
        &self.tracking_key
    }

    pub fn estimated_tokens(&self) -> u64 {
        self.estimated_tokens
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// 远端拒绝时调用：按池的默认时长冷却这个 key。
    pub fn trigger_cooldown(&self) {
        self.trigger_cooldown_for(self.shared.default_cooldown);
    }

    /// 远端给出了明确的重试时间时用它。
    pub fn trigger_cooldown_for(&self, duration: Duration) {
        self.shared.trigger_cooldown(self.index, duration);
    }

    pub(crate) fn reservation(&self) -> ReservationId {
        self.reservation
    }

    /// 第一次调用返回 true。
    pub(crate) fn mark_settled(&self) -> bool {
        !self.settled.swap(true, Ordering::AcqRel)
    }
}

impl Drop for KeyUsageHandle {
    fn drop(&mut self) {
        if self.mark_settled() {
            self.shared
                .release(self.index, &self.tracking_key, self.reservation);
        }
    }
}

impl fmt::Debug for KeyUsageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyUsageHandle")
            .field("index", &self.index)
            .field("suffix", &self.suffix)
            .field("tracking_key", &self.tracking_key)
            .field("estimated_tokens", &self.estimated_tokens)
            .field("settled", &self.is_settled())
            .finish_non_exhaustive()
    }
}
