use chrono::{DateTime, Utc};
use std::time::Duration;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// 每个凭据的冷却状态：AVAILABLE → COOLING(until) → AVAILABLE。
///
/// 不需要后台任务清理；是否可用在准入时按当前时间惰性判断。
#[derive(Debug, Clone, Default)]
pub struct CooldownTracker {
    until: Vec<Option<DateTime<Utc>>>,
}

impl CooldownTracker {
    pub fn new(len: usize) -> Self {
        Self {
            until: vec![None; len],
        }
    }

    /// 从 `now` 起冷却 `duration`，覆盖之前的冷却时间。
    pub fn trigger(
        &mut self,
        index: usize,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Option<DateTime<Utc>> {
        let slot = self.until.get_mut(index)?;
        let d = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
        let until = now.checked_add_signed(d).unwrap_or(DateTime::<Utc>::MAX_UTC);
        *slot = Some(until);
        Some(until)
    }

    pub fn is_cooling(&self, index: usize, now: DateTime<Utc>) -> bool {
        self.cooldown_until(index).is_some_and(|t| t > now)
    }

    pub fn cooldown_until(&self, index: usize) -> Option<DateTime<Utc>> {
        self.until.get(index).copied().flatten()
    }

    pub fn remaining(&self, index: usize, now: DateTime<Utc>) -> Option<Duration> {
        let until = self.cooldown_until(index)?;
        (until - now).to_std().ok().filter(|d| !d.is_zero())
    }

    pub fn cooling_count(&self, now: DateTime<Utc>) -> usize {
        self.until.iter().flatten().filter(|t| **t > now).count()
    }
}
