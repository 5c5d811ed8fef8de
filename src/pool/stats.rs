use crate::credential::KeyIdentifier;
use crate::error::Result;
use crate::ledger::UsageSnapshot;
use crate::pool::manager::{CredentialPool, PoolState};
use crate::usage::LoggerStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyStats {
    pub index: usize,
    pub suffix: String,
    pub cooling: bool,
    pub cooldown_remaining_secs: Option<u64>,
    pub usage: UsageSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlobalStats {
    pub provider: String,
    pub total: UsageSnapshot,
    pub keys: Vec<KeyStats>,
    pub logger: LoggerStats,
}

/// 单个 key 的汇总及按模型拆分。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyDetailStats {
    pub index: usize,
    pub suffix: String,
    pub total: UsageSnapshot,
    pub breakdown: BTreeMap<String, UsageSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelStats {
    pub model_id: String,
    pub total: UsageSnapshot,
    /// 只包含用过这个模型的 key。
    pub keys: Vec<KeyStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GranularStats {
    pub index: usize,
    pub suffix: String,
    pub model_id: String,
    pub usage: UsageSnapshot,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HistoryTotals {
    pub requests: u64,
    pub tokens: u64,
}

/// 持久化历史上的统计（不限于内存窗口）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    pub index: usize,
    pub suffix: String,
    pub lookback_secs: u64,
    pub total: HistoryTotals,
    pub by_model: BTreeMap<String, HistoryTotals>,
}

fn key_stats(state: &PoolState, idx: usize, model: Option<&str>, now: DateTime<Utc>) -> KeyStats {
    let suffix = state
        .credentials
        .get(idx)
        .map(|c| c.suffix().to_string())
        .unwrap_or_default();
    KeyStats {
        index: idx,
        suffix,
        cooling: state.cooldowns.is_cooling(idx, now),
        cooldown_remaining_secs: state.cooldowns.remaining(idx, now).map(|d| d.as_secs()),
        usage: state.ledger.snapshot(now, model, |i, _| i == idx),
    }
}

impl CredentialPool {
    pub fn get_global_stats(&self) -> GlobalStats {
        let now = self.shared.clock.now();
        let state = self.lock_pruned(now);
        let keys: Vec<KeyStats> = (0..state.credentials.len())
            .map(|i| key_stats(&state, i, None, now))
            .collect();
        let mut total = UsageSnapshot::default();
        for k in &keys {
            total += k.usage;
        }
        drop(state);

        GlobalStats {
            provider: self.shared.provider.clone(),
            total,
            keys,
            logger: self.shared.logger.stats(),
        }
    }

    /// `identifier` 可以是下标，也可以是 secret 的完整值或尾部片段。
    pub fn get_key_stats(&self, identifier: impl Into<KeyIdentifier>) -> Result<KeyDetailStats> {
        let idx = self.resolve_index(&identifier.into())?;
        let now = self.shared.clock.now();
        let state = self.lock_pruned(now);

        let breakdown = state
            .ledger
            .models_for(idx)
            .into_iter()
            .map(|m| {
                let s = state.ledger.snapshot(now, Some(&m), |i, _| i == idx);
                (m, s)
            })
            .collect();
        Ok(KeyDetailStats {
            index: idx,
            suffix: state.credentials[idx].suffix().to_string(),
            total: state.ledger.snapshot(now, None, |i, _| i == idx),
            breakdown,
        })
    }

    pub fn get_model_stats(&self, model_id: &str) -> ModelStats {
        let now = self.shared.clock.now();
        let state = self.lock_pruned(now);
        let keys: Vec<KeyStats> = state
            .ledger
            .credentials_for_model(model_id)
            .into_iter()
            .map(|i| key_stats(&state, i, Some(model_id), now))
            .collect();
        let mut total = UsageSnapshot::default();
        for k in &keys {
            total += k.usage;
        }
        ModelStats {
            model_id: model_id.to_string(),
            total,
            keys,
        }
    }

    pub fn get_granular_stats(
        &self,
        identifier: impl Into<KeyIdentifier>,
        model_id: &str,
    ) -> Result<GranularStats> {
        let idx = self.resolve_index(&identifier.into())?;
        let now = self.shared.clock.now();
        let state = self.lock_pruned(now);
        Ok(GranularStats {
            index: idx,
            suffix: state.credentials[idx].suffix().to_string(),
            model_id: model_id.to_string(),
            usage: state.ledger.snapshot(now, Some(model_id), |i, _| i == idx),
        })
    }

    /// 从存储读取某个 key 在 `lookback` 内的历史；先等写入队列清空，结果包含刚结算的调用。
    pub async fn history_stats(
        &self,
        identifier: impl Into<KeyIdentifier>,
        lookback: Duration,
    ) -> Result<HistoryStats> {
        let idx = self.resolve_index(&identifier.into())?;
        let suffix = self.shared.state.lock().credentials[idx].suffix().to_string();

        self.shared.logger.flush().await;

        let now = self.shared.clock.now();
        let since = chrono::Duration::from_std(lookback)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let events = self
            .shared
            .store
            .load_history(&self.shared.provider, &suffix, since)
            .await?;

        let mut total = HistoryTotals::default();
        let mut by_model: BTreeMap<String, HistoryTotals> = BTreeMap::new();
        for e in events {
            total.requests += 1;
            total.tokens = total.tokens.saturating_add(e.token_count);
            let m = by_model.entry(e.model_id).or_default();
            m.requests += 1;
            m.tokens = m.tokens.saturating_add(e.token_count);
        }

        Ok(HistoryStats {
            index: idx,
            suffix,
            lookback_secs: lookback.as_secs(),
            total,
            by_model,
        })
    }
}
