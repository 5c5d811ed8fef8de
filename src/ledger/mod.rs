//! 用量账本：按 (凭据, tracking key) 维护时间窗口内的计数，以及“预留 → 结算”协议。
//!
//! 账本本身不加锁，由 `CredentialPool` 的单把锁保证准入/结算/裁剪的线性化。

mod entry;
mod snapshot;

pub use entry::{LedgerEntry, LimitHit, ReservationId};
pub use snapshot::UsageSnapshot;

use crate::limits::{RateLimits, TrackingKey};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// 结算结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// 记入了实际用量。
    Recorded,
    /// 实际用量为 0：只释放预留，不计费。
    Released,
    /// 预留已不存在（重复结算/已回收），什么也没做。
    Noop,
}

#[derive(Debug)]
pub struct UsageLedger {
    entries: HashMap<(usize, TrackingKey), LedgerEntry>,
    next_id: ReservationId,
    reservation_ttl: chrono::Duration,
}

impl UsageLedger {
    pub fn new(reservation_ttl: chrono::Duration) -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
            reservation_ttl,
        }
    }

    /// 裁剪 + 余量检查 + 预留，作为一个原子步骤（调用方持锁）。
    pub fn admit(
        &mut self,
        credential: usize,
        key: &TrackingKey,
        limits: &RateLimits,
        estimate: u64,
        model: &str,
        now: DateTime<Utc>,
    ) -> Result<ReservationId, LimitHit> {
        let ttl = self.reservation_ttl;
        let entry = self.entries.entry((credential, key.clone())).or_default();
        let reclaimed = entry.prune(now, ttl);
        if reclaimed > 0 {
            tracing::warn!(key_index = credential, tracking = %key, reclaimed, "回收超时未结算的预留");
        }
        if let Some(hit) = entry.check(limits, estimate, now) {
            return Err(hit);
        }
        let id = self.next_id;
        self.next_id += 1;
        entry.reserve(id, estimate, Arc::from(model), now);
        Ok(id)
    }

    pub fn settle(
        &mut self,
        credential: usize,
        key: &TrackingKey,
        id: ReservationId,
        actual: u64,
        now: DateTime<Utc>,
    ) -> Settlement {
        let Some(entry) = self.entries.get_mut(&(credential, key.clone())) else {
            return Settlement::Noop;
        };
        match entry.settle(id, actual, now) {
            Some(true) => Settlement::Recorded,
            Some(false) => Settlement::Released,
            None => Settlement::Noop,
        }
    }

    pub fn release(&mut self, credential: usize, key: &TrackingKey, id: ReservationId) -> bool {
        self.entries
            .get_mut(&(credential, key.clone()))
            .is_some_and(|e| e.release(id))
    }

    pub fn is_pending(&self, credential: usize, key: &TrackingKey, id: ReservationId) -> bool {
        self.entries
            .get(&(credential, key.clone()))
            .is_some_and(|e| e.has_reservation(id))
    }

    pub fn hydrate(
        &mut self,
        credential: usize,
        key: TrackingKey,
        model: &str,
        at: DateTime<Utc>,
        tokens: u64,
        now: DateTime<Utc>,
    ) {
        self.entries
            .entry((credential, key))
            .or_default()
            .hydrate(Arc::from(model), at, tokens, now);
    }

    /// 裁剪全部账本，返回回收的预留数。
    pub fn prune_all(&mut self, now: DateTime<Utc>) -> usize {
        let ttl = self.reservation_ttl;
        self.entries.values_mut().map(|e| e.prune(now, ttl)).sum()
    }

    /// 汇总满足 `filter` 的账本；`model` 进一步按模型过滤。
    pub fn snapshot<F>(&self, now: DateTime<Utc>, model: Option<&str>, filter: F) -> UsageSnapshot
    where
        F: Fn(usize, &TrackingKey) -> bool,
    {
        let mut total = UsageSnapshot::default();
        for ((idx, key), entry) in &self.entries {
            if filter(*idx, key) {
                total += entry.snapshot(now, model);
            }
        }
        total
    }

    /// 某个凭据上出现过的模型。
    pub fn models_for(&self, credential: usize) -> BTreeSet<String> {
        self.entries
            .iter()
            .filter(|((idx, _), _)| *idx == credential)
            .flat_map(|(_, e)| e.models())
            .collect()
    }

    /// 用过某个模型的凭据下标。
    pub fn credentials_for_model(&self, model: &str) -> BTreeSet<usize> {
        self.entries
            .iter()
            .filter(|(_, e)| e.models().contains(model))
            .map(|((idx, _), _)| *idx)
            .collect()
    }

    pub fn pending_total(&self) -> usize {
        self.entries.values().map(LedgerEntry::pending_len).sum()
    }
}

impl Default for UsageLedger {
    fn default() -> Self {
        Self::new(chrono::Duration::minutes(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::RateLimitStrategy;

    #[test]
    fn conservation_over_mixed_estimates() {
        let now = Utc::now();
        let key = TrackingKey::new("p", "m", RateLimitStrategy::PerModel);
        let mut ledger = UsageLedger::default();
        let limits = RateLimits::unlimited();

        let pairs = [(1000u64, 12u64), (5, 900), (300, 300), (1, 77)];
        let mut ids = Vec::new();
        for (est, _) in pairs {
            ids.push(ledger.admit(0, &key, &limits, est, "m", now).expect("admit"));
        }
        for (id, (_, actual)) in ids.iter().zip(pairs) {
            assert_eq!(ledger.settle(0, &key, *id, actual, now), Settlement::Recorded);
        }

        let s = ledger.snapshot(now, None, |_, _| true);
        assert_eq!(s.total_tokens, 12 + 900 + 300 + 77);
        assert_eq!(s.total_requests, 4);
        assert_eq!(ledger.pending_total(), 0);
    }

    #[test]
    fn prune_all_reclaims_without_new_admission() {
        let now = Utc::now();
        let key = TrackingKey::new("p", "m", RateLimitStrategy::PerModel);
        let mut ledger = UsageLedger::new(chrono::Duration::minutes(10));
        let id = ledger
            .admit(0, &key, &RateLimits::unlimited(), 50, "m", now)
            .expect("admit");

        let later = now + chrono::Duration::minutes(11);
        assert_eq!(ledger.snapshot(later, None, |_, _| true).total_requests, 1);
        assert_eq!(ledger.prune_all(later), 1);
        assert!(!ledger.is_pending(0, &key, id));
        assert!(ledger.snapshot(later, None, |_, _| true).is_empty());
    }

    #[test]
    fn settle_twice_is_noop() {
        let now = Utc::now();
        let key = TrackingKey::new("p", "m", RateLimitStrategy::PerModel);
        let mut ledger = UsageLedger::default();
        let id = ledger
            .admit(0, &key, &RateLimits::unlimited(), 10, "m", now)
            .expect("admit");
        assert!(ledger.is_pending(0, &key, id));
        assert_eq!(ledger.settle(0, &key, id, 10, now), Settlement::Recorded);
        assert_eq!(ledger.settle(0, &key, id, 10, now), Settlement::Noop);
        assert_eq!(ledger.snapshot(now, None, |_, _| true).total_tokens, 10);
    }

    #[test]
    fn buckets_are_separate_per_tracking_key() {
        let now = Utc::now();
        let a = TrackingKey::new("p", "a", RateLimitStrategy::PerModel);
        let b = TrackingKey::new("p", "b", RateLimitStrategy::PerModel);
        let limits = RateLimits {
            requests_per_minute: Some(1),
            ..RateLimits::unlimited()
        };
        let mut ledger = UsageLedger::default();

        assert!(ledger.admit(0, &a, &limits, 1, "a", now).is_ok());
        assert!(ledger.admit(0, &a, &limits, 1, "a", now).is_err());
        assert!(ledger.admit(0, &b, &limits, 1, "b", now).is_ok());
        assert!(ledger.admit(1, &a, &limits, 1, "a", now).is_ok());

        assert_eq!(ledger.credentials_for_model("a").len(), 2);
        assert_eq!(ledger.models_for(0).len(), 2);
    }
}
