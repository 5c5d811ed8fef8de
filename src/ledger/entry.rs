use crate::ledger::snapshot::UsageSnapshot;
use crate::limits::{RateLimits, Window};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

pub type ReservationId = u64;

/// 一条已结算的用量（request_delta 恒为 1）。
#[derive(Debug, Clone)]
struct Record {
    at: DateTime<Utc>,
    tokens: u64,
    model: Arc<str>,
}

/// 准入时预留、尚未结算的额度。
#[derive(Debug, Clone)]
struct Reservation {
    at: DateTime<Utc>,
    tokens: u64,
    model: Arc<str>,
}

/// 准入被拒时命中的窗口，用于日志。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitHit {
    pub window: Window,
    pub on_tokens: bool,
    pub used: u64,
    pub limit: u64,
}

/// 单个 (凭据, tracking key) 的账本。
///
/// `records` 只保留最近一天；被裁掉的记录按模型累加进 `archived`，保证累计值不丢。
#[derive(Debug, Default)]
pub struct LedgerEntry {
    records: VecDeque<Record>,
    pending: BTreeMap<ReservationId, Reservation>,
    archived: HashMap<Arc<str>, (u64, u64)>,
}

impl LedgerEntry {
    /// 裁掉一天以前的记录，回收超过 `reservation_ttl` 仍未结算的预留，返回回收数量。
    pub fn prune(&mut self, now: DateTime<Utc>, reservation_ttl: chrono::Duration) -> usize {
        let cutoff = now - Window::LONGEST.duration();
        while let Some(front) = self.records.front() {
            if front.at > cutoff {
                break;
            }
            if let Some(r) = self.records.pop_front() {
                self.archive(&r.model, r.tokens);
            }
        }

        let stale_before = now - reservation_ttl;
        let before = self.pending.len();
        self.pending.retain(|_, r| r.at > stale_before);
        before - self.pending.len()
    }

    /// 检查余量；全部窗口都放得下时返回 `None`。
    ///
    /// 请求窗口要求 `used + 1 <= limit`，token 窗口要求 `used + estimate <= limit`；
    /// 未配置的窗口永远放行。
    pub fn check(&self, limits: &RateLimits, estimate: u64, now: DateTime<Utc>) -> Option<LimitHit> {
        let usage = self.window_usage(now, None);
        for (w, (requests, tokens)) in Window::ALL.into_iter().zip(usage) {
            if let Some(limit) = limits.request_limit(w)
                && requests.saturating_add(1) > limit
            {
                return Some(LimitHit {
                    window: w,
                    on_tokens: false,
                    used: requests,
                    limit,
                });
            }
            if let Some(limit) = limits.token_limit(w)
                && tokens.saturating_add(estimate) > limit
            {
                return Some(LimitHit {
                    window: w,
                    on_tokens: true,
                    used: tokens,
                    limit,
                });
            }
        }
        None
    }

    pub fn reserve(&mut self, id: ReservationId, estimate: u64, model: Arc<str>, now: DateTime<Utc>) {
        self.pending.insert(
            id,
            Reservation {
                at: now,
                tokens: estimate,
                model,
            },
        );
    }

    /// 预留转为实际用量。返回 `None` 表示该预留已不存在（重复结算或已回收）。
    ///
    /// `actual == 0` 的调用不会计费，只释放预留。
    pub fn settle(&mut self, id: ReservationId, actual: u64, now: DateTime<Utc>) -> Option<bool> {
        let r = self.pending.remove(&id)?;
        if actual == 0 {
            return Some(false);
        }
        self.records.push_back(Record {
            at: now,
            tokens: actual,
            model: r.model,
        });
        Some(true)
    }

    pub fn release(&mut self, id: ReservationId) -> bool {
        self.pending.remove(&id).is_some()
    }

    pub fn has_reservation(&self, id: ReservationId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// 从持久化历史回放一条记录；调用方需按时间升序回放。
    pub fn hydrate(&mut self, model: Arc<str>, at: DateTime<Utc>, tokens: u64, now: DateTime<Utc>) {
        if at <= now - Window::LONGEST.duration() {
            self.archive(&model, tokens);
            return;
        }
        self.records.push_back(Record { at, tokens, model });
    }

    /// 按模型过滤（`None` 为全部）的快照。
    pub fn snapshot(&self, now: DateTime<Utc>, model: Option<&str>) -> UsageSnapshot {
        let mut s = UsageSnapshot::default();
        for (w, (requests, tokens)) in Window::ALL.into_iter().zip(self.window_usage(now, model)) {
            s.add_window(w, requests, tokens);
        }

        let matches = |m: &str| model.is_none_or(|want| want == m);
        for (m, (requests, tokens)) in &self.archived {
            if matches(m) {
                s.total_requests += requests;
                s.total_tokens += tokens;
            }
        }
        for r in self.records.iter().filter(|r| matches(&r.model)) {
            s.total_requests += 1;
            s.total_tokens += r.tokens;
        }
        for r in self.pending.values().filter(|r| matches(&r.model)) {
            s.total_requests += 1;
            s.total_tokens += r.tokens;
        }
        s
    }

    pub fn models(&self) -> BTreeSet<String> {
        self.archived
            .keys()
            .chain(self.records.iter().map(|r| &r.model))
            .chain(self.pending.values().map(|r| &r.model))
            .map(|m| m.to_string())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.pending.is_empty() && self.archived.is_empty()
    }

    /// 三个窗口（分/时/天）内的 (请求数, token 数)，包含预留。
    fn window_usage(&self, now: DateTime<Utc>, model: Option<&str>) -> [(u64, u64); 3] {
        let mut out = [(0u64, 0u64); 3];
        let settled = self.records.iter().map(|r| (r.at, r.tokens, &r.model));
        let pending = self.pending.values().map(|r| (r.at, r.tokens, &r.model));
        for (at, tokens, m) in settled.chain(pending) {
            if model.is_some_and(|want| want != m.as_ref()) {
                continue;
            }
            for (slot, w) in out.iter_mut().zip(Window::ALL) {
                if at > now - w.duration() {
                    slot.0 += 1;
                    slot.1 = slot.1.saturating_add(tokens);
                }
            }
        }
        out
    }

    fn archive(&mut self, model: &Arc<str>, tokens: u64) {
        let slot = self.archived.entry(model.clone()).or_default();
        slot.0 += 1;
        slot.1 = slot.1.saturating_add(tokens);
    }
}
