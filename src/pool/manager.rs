use crate::credential::{CooldownTracker, Credential, DEFAULT_COOLDOWN, KeyIdentifier};
use crate::error::{Error, Result};
use crate::ledger::{Settlement, UsageLedger};
use crate::limits::{KeyLimitOverride, LimitTable, RateLimits, TrackingKey};
use crate::pool::handle::KeyUsageHandle;
use crate::usage::{LoggerOptions, LoggerStats, UsageEvent, UsageLogger, UsageStore};
use crate::util::clock::{Clock, SystemClock};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub const DEFAULT_HISTORY_LOOKBACK: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_RESERVATION_TTL: Duration = Duration::from_secs(10 * 60);

/// 构造 `CredentialPool` 的参数。
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub provider: String,
    pub limits: LimitTable,
    pub overrides: Vec<KeyLimitOverride>,
    pub cooldown: Duration,
    /// 启动时从存储回放多久的历史。
    pub history_lookback: Duration,
    /// 超过这个时间仍未结算的预留会被回收。
    pub reservation_ttl: Duration,
    pub logger: LoggerOptions,
    pub clock: Arc<dyn Clock>,
}

impl PoolOptions {
    pub fn new(provider: &str) -> Self {
        Self {
            provider: provider.trim().to_lowercase(),
            limits: LimitTable::new(),
            overrides: Vec::new(),
            cooldown: DEFAULT_COOLDOWN,
            history_lookback: DEFAULT_HISTORY_LOOKBACK,
            reservation_ttl: DEFAULT_RESERVATION_TTL,
            logger: LoggerOptions::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_limits(mut self, limits: LimitTable) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_override(mut self, o: KeyLimitOverride) -> Self {
        self.overrides.push(o);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_logger(mut self, logger: LoggerOptions) -> Self {
        self.logger = logger;
        self
    }
}

#[derive(Debug)]
pub(crate) struct PoolState {
    pub(crate) credentials: Vec<Credential>,
    pub(crate) cursor: usize,
    pub(crate) cooldowns: CooldownTracker,
    pub(crate) ledger: UsageLedger,
}

#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) provider: String,
    pub(crate) state: Mutex<PoolState>,
    pub(crate) limits: ArcSwap<LimitTable>,
    pub(crate) overrides: Vec<KeyLimitOverride>,
    pub(crate) default_cooldown: Duration,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) store: Arc<dyn UsageStore>,
    pub(crate) logger: UsageLogger,
    stopped: AtomicBool,
}

impl Shared {
    /// key 专属覆盖优先：先找指定了模型的，再找对全部模型生效的。
    fn effective_limits(&self, c: &Credential, model_id: &str, base: &RateLimits) -> RateLimits {
        let mut all_models = None;
        for o in self
            .overrides
            .iter()
            .filter(|o| o.key.matches(c) && o.matches_model(model_id))
        {
            if o.model.is_some() {
                return o.limits;
            }
            all_models.get_or_insert(o.limits);
        }
        all_models.unwrap_or(*base)
    }

    pub(crate) fn trigger_cooldown(&self, index: usize, duration: Duration) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let Some(until) = state.cooldowns.trigger(index, now, duration) else {
            return;
        };
        let suffix = state
            .credentials
            .get(index)
            .map(|c| c.suffix().to_string())
            .unwrap_or_default();
        drop(state);
        tracing::warn!(
            provider = %self.provider,
            key = %suffix,
            until = %until.format("%H:%M:%S"),
            "key 进入冷却 {}s",
            duration.as_secs()
        );
    }

    pub(crate) fn release(&self, index: usize, key: &TrackingKey, reservation: u64) {
        let released = self.state.lock().ledger.release(index, key, reservation);
        if released {
            tracing::debug!(key_index = index, tracking = %key, "未结算的句柄被释放，归还预留额度");
        }
    }
}

/// 一组可互换凭据的准入控制与计量。
///
/// 所有账本/游标操作在同一把锁内完成，锁内不做任何 I/O；持久化只通过 `UsageLogger` 的队列交接。
#[derive(Debug, Clone)]
pub struct CredentialPool {
    pub(crate) shared: Arc<Shared>,
}

impl CredentialPool {
    /// 构造并从存储回放最近的历史；回放完成前不会有任何准入。
    ///
    /// 存储读取失败只记录日志，池以空计数启动。
    pub async fn new(
        secrets: Vec<String>,
        store: Arc<dyn UsageStore>,
        opts: PoolOptions,
    ) -> Result<Self> {
        if opts.provider.is_empty() {
            return Err(Error::config("provider 不能为空"));
        }
        if secrets.is_empty() {
            return Err(Error::config(format!("{} 没有配置任何 API key", opts.provider)));
        }
        let mut credentials = Vec::with_capacity(secrets.len());
        for (i, s) in secrets.iter().enumerate() {
            let s = s.trim();
            if s.is_empty() {
                return Err(Error::config(format!("第 {} 个 API key 为空", i + 1)));
            }
            credentials.push(Credential::new(i, s));
        }
        for o in &opts.overrides {
            o.limits.validate().map_err(Error::config)?;
            if !credentials.iter().any(|c| o.key.matches(c)) {
                tracing::warn!(key = %o.key, "额度覆盖没有匹配到任何 key，已忽略");
            }
        }

        let ttl = chrono::Duration::from_std(opts.reservation_ttl)
            .map_err(|_| Error::config("reservation_ttl 过大"))?;
        let mut ledger = UsageLedger::new(ttl);
        hydrate(&mut ledger, &credentials, store.as_ref(), &opts).await;

        let logger = UsageLogger::spawn(store.clone(), opts.logger);
        let n = credentials.len();
        tracing::info!(provider = %opts.provider, keys = n, "凭据池已就绪");

        Ok(Self {
            shared: Arc::new(Shared {
                provider: opts.provider,
                state: Mutex::new(PoolState {
                    credentials,
                    cursor: 0,
                    cooldowns: CooldownTracker::new(n),
                    ledger,
                }),
                limits: ArcSwap::from_pointee(opts.limits),
                overrides: opts.overrides,
                default_cooldown: opts.cooldown,
                clock: opts.clock,
                store,
                logger,
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn provider(&self) -> &str {
        &self.shared.provider
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limits(&self) -> Arc<LimitTable> {
        self.shared.limits.load_full()
    }

    /// 原子替换配额表；已发出的句柄不受影响。
    pub fn reload_limits(&self, table: LimitTable) {
        self.shared.limits.store(Arc::new(table));
        tracing::info!(provider = %self.shared.provider, "配额表已更新");
    }

    /// 按配额表解析后的限额取 key。
    pub fn acquire(&self, model_id: &str, estimated_tokens: u64) -> Option<KeyUsageHandle> {
        let limits = self.shared.limits.load().resolve(&self.shared.provider, model_id);
        self.get_credential(model_id, &limits, estimated_tokens)
    }

    /// 从游标开始环形扫描，跳过冷却中的 key，第一个能放下本次调用的 key 预留额度并返回句柄。
    ///
    /// 永不阻塞；没有可用 key 时返回 `None`。
    pub fn get_credential(
        &self,
        model_id: &str,
        limits: &RateLimits,
        estimated_tokens: u64,
    ) -> Option<KeyUsageHandle> {
        let shared = &self.shared;
        let key = shared.limits.load().tracking_key(&shared.provider, model_id);
        let now = shared.clock.now();

        let mut guard = shared.state.lock();
        let state = &mut *guard;
        let n = state.credentials.len();
        for offset in 0..n {
            let idx = (state.cursor + offset) % n;
            if state.cooldowns.is_cooling(idx, now) {
                tracing::debug!(key_index = idx, "key 冷却中，跳过");
                continue;
            }
            let c = &state.credentials[idx];
            let effective = shared.effective_limits(c, model_id, limits);
            match state
                .ledger
                .admit(idx, &key, &effective, estimated_tokens, model_id, now)
            {
                Ok(reservation) => {
                    state.cursor = (idx + 1) % n;
                    tracing::debug!(
                        key = %c.suffix(),
                        tracking = %key,
                        estimated_tokens,
                        "已分配 key"
                    );
                    return Some(KeyUsageHandle::new(
                        shared.clone(),
                        c,
                        key,
                        model_id,
                        reservation,
                        estimated_tokens,
                    ));
                }
                Err(hit) => {
                    tracing::debug!(
                        key = %c.suffix(),
                        window = ?hit.window,
                        on_tokens = hit.on_tokens,
                        used = hit.used,
                        limit = hit.limit,
                        "key 额度不足，跳过"
                    );
                }
            }
        }
        tracing::debug!(
            provider = %shared.provider,
            tracking = %key,
            keys = n,
            cooling = state.cooldowns.cooling_count(now),
            "没有可用的 key"
        );
        None
    }

    /// 游标前进一位，不发放句柄。
    pub fn force_rotate_index(&self) {
        let mut state = self.shared.state.lock();
        let n = state.credentials.len();
        state.cursor = (state.cursor + 1) % n;
    }

    /// 结算句柄：预留转为实际用量并写入持久化队列。同一个句柄只结算一次。
    pub fn record_usage(&self, handle: &KeyUsageHandle, actual_tokens: u64) -> Settlement {
        if !Arc::ptr_eq(&handle.shared, &self.shared) {
            tracing::warn!(key = %handle.suffix(), "句柄不属于这个凭据池，忽略");
            return Settlement::Noop;
        }
        if !handle.mark_settled() {
            return Settlement::Noop;
        }

        let now = self.shared.clock.now();
        let outcome = self.shared.state.lock().ledger.settle(
            handle.index(),
            handle.tracking_key(),
            handle.reservation(),
            actual_tokens,
            now,
        );
        match outcome {
            Settlement::Recorded => {
                tracing::debug!(
                    key = %handle.suffix(),
                    estimated = handle.estimated_tokens(),
                    actual = actual_tokens,
                    "用量已结算"
                );
                self.shared.logger.log(UsageEvent::new(
                    &self.shared.provider,
                    handle.model_id(),
                    handle.suffix(),
                    actual_tokens,
                    now,
                ));
            }
            Settlement::Released => {
                tracing::debug!(key = %handle.suffix(), "实际用量为 0，只释放预留");
            }
            Settlement::Noop => {
                tracing::warn!(key = %handle.suffix(), "预留已被回收，本次用量未计入");
            }
        }
        outcome
    }

    /// 让某个 key 冷却（默认时长），用于没有句柄时的外部信号。
    pub fn trigger_cooldown(&self, identifier: impl Into<KeyIdentifier>) -> Result<()> {
        let index = self.resolve_index(&identifier.into())?;
        self.shared
            .trigger_cooldown(index, self.shared.default_cooldown);
        Ok(())
    }

    pub fn logger_stats(&self) -> LoggerStats {
        self.shared.logger.stats()
    }

    /// 等待后台队列写完。
    pub async fn flush(&self) {
        self.shared.logger.flush().await;
    }

    /// 排空写入队列并关闭存储。可重复调用。
    pub async fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.logger.stop().await;
        if let Err(e) = self.shared.store.close().await {
            tracing::error!(provider = %self.shared.provider, "关闭 usage 存储失败: {e:#}");
        }
        let stats = self.shared.logger.stats();
        tracing::info!(
            provider = %self.shared.provider,
            persisted = stats.persisted,
            dropped = stats.dropped,
            "凭据池已停止"
        );
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// 取锁并先裁剪全部账本，统计里不会出现已超时的预留。
    pub(crate) fn lock_pruned(&self, now: DateTime<Utc>) -> MutexGuard<'_, PoolState> {
        let mut state = self.shared.state.lock();
        let reclaimed = state.ledger.prune_all(now);
        if reclaimed > 0 {
            tracing::warn!(provider = %self.shared.provider, reclaimed, "回收超时未结算的预留");
        }
        state
    }

    pub(crate) fn resolve_index(&self, identifier: &KeyIdentifier) -> Result<usize> {
        let state = self.shared.state.lock();
        state
            .credentials
            .iter()
            .find(|c| identifier.matches(c))
            .map(Credential::index)
            .ok_or_else(|| Error::key_not_found(identifier.to_string()))
    }
}

async fn hydrate(
    ledger: &mut UsageLedger,
    credentials: &[Credential],
    store: &dyn UsageStore,
    opts: &PoolOptions,
) {
    let now = opts.clock.now();
    let lookback = chrono::Duration::from_std(opts.history_lookback).unwrap_or(chrono::Duration::MAX);
    let since = now.checked_sub_signed(lookback).unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

    let events = match store.load_provider_history(&opts.provider, since).await {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(provider = %opts.provider, "读取历史用量失败，以空计数启动: {e:#}");
            return;
        }
    };

    // 后缀相同的 key 无法区分，归到第一个
    let mut by_suffix: HashMap<&str, usize> = HashMap::new();
    for c in credentials {
        by_suffix.entry(c.suffix()).or_insert(c.index());
    }

    let mut restored = 0usize;
    for e in events {
        let Some(&idx) = by_suffix.get(e.credential_suffix.as_str()) else {
            continue;
        };
        let key = opts.limits.tracking_key(&opts.provider, &e.model_id);
        ledger.hydrate(idx, key, &e.model_id, e.timestamp, e.token_count, now);
        restored += 1;
    }
    if restored > 0 {
        tracing::info!(provider = %opts.provider, events = restored, "已回放历史用量");
    }
}
