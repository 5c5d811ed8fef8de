//! 凭据池：轮转游标、冷却、账本与持久化队列的编排。

mod handle;
mod manager;
mod stats;
mod wait;

pub use handle::KeyUsageHandle;
pub use manager::{CredentialPool, DEFAULT_HISTORY_LOOKBACK, DEFAULT_RESERVATION_TTL, PoolOptions};
pub use stats::{
    GlobalStats, GranularStats, HistoryStats, HistoryTotals, KeyDetailStats, KeyStats, ModelStats,
};
pub use wait::{DEFAULT_POLL_INTERVAL, DEFAULT_WAIT_TIMEOUT, WaitPolicy};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::KeyIdentifier;
    use crate::error::Error;
    use crate::ledger::Settlement;
    use crate::limits::{KeyLimitOverride, LimitTable, RateLimitStrategy, RateLimits};
    use crate::usage::{MemoryUsageStore, UsageStore};
    use crate::util::clock::ManualClock;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;
    use std::time::Duration;

    const PROVIDER: &str = "testprov";
    const MODEL: &str = "test-model";

    fn secrets(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("sk-test-key-{i}-tail{i:04}")).collect()
    }

    fn rpm(n: u64) -> RateLimits {
        RateLimits {
            requests_per_minute: Some(n),
            ..RateLimits::unlimited()
        }
    }

    async fn pool_with(
        n: usize,
        limits: RateLimits,
        clock: &ManualClock,
        store: Arc<MemoryUsageStore>,
    ) -> CredentialPool {
        let table = LimitTable::new().with(PROVIDER, MODEL, limits);
        let opts = PoolOptions::new(PROVIDER)
            .with_limits(table)
            .with_clock(Arc::new(clock.clone()));
        CredentialPool::new(secrets(n), store, opts)
            .await
            .expect("pool")
    }

    fn take(pool: &CredentialPool) -> Option<usize> {
        let h = pool.acquire(MODEL, 10)?;
        let idx = h.index();
        pool.record_usage(&h, 10);
        Some(idx)
    }

    #[tokio::test]
    async fn construction_rejects_empty_key_list() {
        let store = Arc::new(MemoryUsageStore::new());
        let err = CredentialPool::new(Vec::new(), store.clone(), PoolOptions::new(PROVIDER))
            .await
            .expect_err("empty keys");
        assert!(matches!(err, Error::Config(_)));

        let err = CredentialPool::new(vec!["  ".into()], store, PoolOptions::new(PROVIDER))
            .await
            .expect_err("blank key");
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn round_robin_visits_every_key_in_order() {
        let clock = ManualClock::default();
        let pool = pool_with(3, RateLimits::unlimited(), &clock, Arc::default()).await;
        let order: Vec<usize> = (0..6).filter_map(|_| take(&pool)).collect();
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2]);
        pool.stop().await;
    }

    #[tokio::test]
    async fn force_rotate_skips_one_position() {
        let clock = ManualClock::default();
        let pool = pool_with(3, RateLimits::unlimited(), &clock, Arc::default()).await;
        assert_eq!(take(&pool), Some(0));
        pool.force_rotate_index();
        assert_eq!(take(&pool), Some(2));
        assert_eq!(take(&pool), Some(0));
        pool.stop().await;
    }

    #[tokio::test]
    async fn rpm_two_rejects_third_until_window_passes() {
        let clock = ManualClock::default();
        let pool = pool_with(1, rpm(2), &clock, Arc::default()).await;
        assert_eq!(take(&pool), Some(0));
        assert_eq!(take(&pool), Some(0));
        assert_eq!(take(&pool), None);

        clock.advance(ChronoDuration::seconds(59));
        assert_eq!(take(&pool), None);
        clock.advance(ChronoDuration::seconds(1));
        assert_eq!(take(&pool), Some(0));
        pool.stop().await;
    }

    #[tokio::test]
    async fn three_keys_one_rpm_each() {
        let clock = ManualClock::default();
        let pool = pool_with(3, rpm(1), &clock, Arc::default()).await;
        let order: Vec<Option<usize>> = (0..4).map(|_| take(&pool)).collect();
        assert_eq!(order, vec![Some(0), Some(1), Some(2), None]);
        pool.stop().await;
    }

    #[tokio::test]
    async fn cooling_key_is_skipped_for_exactly_the_cooldown() {
        let clock = ManualClock::default();
        let pool = pool_with(2, RateLimits::unlimited(), &clock, Arc::default()).await;

        let h = pool.acquire(MODEL, 1).expect("key 0");
        assert_eq!(h.index(), 0);
        h.trigger_cooldown();
        pool.record_usage(&h, 1);

        for _ in 0..3 {
            assert_eq!(take(&pool), Some(1));
        }
        let stats = pool.get_global_stats();
        assert!(stats.keys[0].cooling);
        assert_eq!(stats.keys[0].cooldown_remaining_secs, Some(30));

        clock.advance(ChronoDuration::seconds(29));
        assert_eq!(take(&pool), Some(1));
        assert_eq!(take(&pool), Some(1));
        clock.advance(ChronoDuration::seconds(1));
        assert_eq!(take(&pool), Some(0));
        pool.stop().await;
    }

    #[tokio::test]
    async fn every_key_cooling_means_no_key() {
        let clock = ManualClock::default();
        let pool = pool_with(2, RateLimits::unlimited(), &clock, Arc::default()).await;
        pool.trigger_cooldown(0usize).expect("key 0");
        pool.trigger_cooldown("tail0001").expect("key 1");
        assert!(pool.acquire(MODEL, 1).is_none());
        assert!(matches!(
            pool.trigger_cooldown("nope-nope"),
            Err(Error::KeyNotFound(_))
        ));
        pool.stop().await;
    }

    #[tokio::test]
    async fn double_settlement_is_a_noop() {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryUsageStore::new());
        let pool = pool_with(1, RateLimits::unlimited(), &clock, store.clone()).await;

        let h = pool.acquire(MODEL, 100).expect("key");
        assert_eq!(pool.record_usage(&h, 42), Settlement::Recorded);
        assert_eq!(pool.record_usage(&h, 42), Settlement::Noop);
        assert!(h.is_settled());
        drop(h);

        pool.flush().await;
        assert_eq!(store.len(), 1);
        let s = pool.get_key_stats(0usize).expect("stats").total;
        assert_eq!((s.total_requests, s.total_tokens), (1, 42));
        pool.stop().await;
    }

    #[tokio::test]
    async fn zero_token_settlement_only_releases() {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryUsageStore::new());
        let pool = pool_with(1, rpm(1), &clock, store.clone()).await;

        let h = pool.acquire(MODEL, 100).expect("key");
        assert_eq!(pool.record_usage(&h, 0), Settlement::Released);
        assert!(pool.acquire(MODEL, 1).is_some());

        pool.stop().await;
        assert!(store.is_empty());
        assert!(pool.get_global_stats().total.is_empty());
    }

    #[tokio::test]
    async fn settled_tokens_replace_estimate() {
        let clock = ManualClock::default();
        let pool = pool_with(2, RateLimits::unlimited(), &clock, Arc::default()).await;

        let a = pool.acquire(MODEL, 1000).expect("a");
        let b = pool.acquire(MODEL, 1).expect("b");
        // 预留中的估算值也计入窗口
        assert_eq!(pool.get_global_stats().total.tpm, 1001);

        pool.record_usage(&a, 10);
        pool.record_usage(&b, 500);
        let total = pool.get_global_stats().total;
        assert_eq!(total.tpm, 510);
        assert_eq!(total.total_tokens, 510);
        assert_eq!(total.total_requests, 2);
        pool.stop().await;
    }

    #[tokio::test]
    async fn token_budget_is_enforced_with_estimate() {
        let clock = ManualClock::default();
        let limits = RateLimits::unlimited().tokens(1000, None, None);
        let pool = pool_with(1, limits, &clock, Arc::default()).await;

        let h = pool.acquire(MODEL, 900).expect("fits");
        assert!(pool.acquire(MODEL, 200).is_none());
        pool.record_usage(&h, 100);
        assert!(pool.acquire(MODEL, 200).is_some());
        pool.stop().await;
    }

    #[tokio::test]
    async fn dropped_handle_returns_its_reservation() {
        let clock = ManualClock::default();
        let pool = pool_with(1, rpm(1), &clock, Arc::default()).await;

        let h = pool.acquire(MODEL, 10).expect("key");
        assert!(pool.acquire(MODEL, 10).is_none());
        drop(h);
        assert!(pool.acquire(MODEL, 10).is_some());
        pool.stop().await;
    }

    #[tokio::test]
    async fn stale_reservation_is_reclaimed_after_ttl() {
        let clock = ManualClock::default();
        let pool = pool_with(1, RateLimits::requests(100, 1, 100), &clock, Arc::default()).await;

        let h = pool.acquire(MODEL, 10).expect("key");
        clock.advance(ChronoDuration::minutes(5));
        assert!(pool.acquire(MODEL, 10).is_none());
        clock.advance(ChronoDuration::minutes(5));
        let h2 = pool.acquire(MODEL, 10).expect("reclaimed");

        // 被回收后的结算不再计费
        assert_eq!(pool.record_usage(&h, 10), Settlement::Noop);
        pool.record_usage(&h2, 10);
        assert_eq!(pool.get_global_stats().total.total_requests, 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn stats_drop_stale_reservations_without_new_admission() {
        let clock = ManualClock::default();
        let pool = pool_with(2, RateLimits::unlimited(), &clock, Arc::default()).await;

        // 永远不结算也不析构的句柄
        std::mem::forget(pool.acquire(MODEL, 40).expect("key"));
        assert_eq!(pool.get_global_stats().total.total_tokens, 40);

        clock.advance(ChronoDuration::minutes(11));
        let stats = pool.get_global_stats();
        assert!(stats.total.is_empty());
        assert!(pool.get_key_stats(0usize).expect("stats").total.is_empty());
        pool.stop().await;
    }

    #[tokio::test]
    async fn usage_survives_restart() {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryUsageStore::new());

        let pool = pool_with(1, rpm(2), &clock, store.clone()).await;
        assert_eq!(take(&pool), Some(0));
        assert_eq!(take(&pool), Some(0));
        pool.stop().await;
        assert_eq!(store.len(), 2);

        clock.advance(ChronoDuration::seconds(10));
        let restarted = pool_with(1, rpm(2), &clock, store.clone()).await;
        assert_eq!(take(&restarted), None);
        let s = restarted.get_key_stats(0usize).expect("stats").total;
        assert_eq!((s.rpm, s.tpm, s.total_requests), (2, 20, 2));

        clock.advance(ChronoDuration::seconds(50));
        assert_eq!(take(&restarted), Some(0));
        restarted.stop().await;
    }

    #[tokio::test]
    async fn old_history_feeds_totals_not_windows() {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryUsageStore::new());
        let two_days_ago = crate::util::clock::Clock::now(&clock) - ChronoDuration::days(2);
        store
            .append(&crate::usage::UsageEvent::new(
                PROVIDER,
                MODEL,
                "tail0000",
                77,
                two_days_ago,
            ))
            .await
            .expect("append");

        let table = LimitTable::new().with(PROVIDER, MODEL, rpm(1));
        let opts = PoolOptions {
            history_lookback: Duration::from_secs(7 * 24 * 3600),
            ..PoolOptions::new(PROVIDER)
                .with_limits(table)
                .with_clock(Arc::new(clock.clone()))
        };
        let pool = CredentialPool::new(secrets(1), store, opts).await.expect("pool");
        let s = pool.get_key_stats(0usize).expect("stats").total;
        assert_eq!((s.rpd, s.total_tokens), (0, 77));
        assert!(pool.acquire(MODEL, 1).is_some());
        pool.stop().await;
    }

    #[tokio::test]
    async fn global_strategy_shares_one_budget_across_models() {
        let clock = ManualClock::default();
        let mut table = LimitTable::new().with(PROVIDER, "default", rpm(1));
        table.set_strategy(PROVIDER, RateLimitStrategy::Global);
        let opts = PoolOptions::new(PROVIDER)
            .with_limits(table)
            .with_clock(Arc::new(clock.clone()));
        let pool = CredentialPool::new(secrets(1), Arc::new(MemoryUsageStore::new()), opts)
            .await
            .expect("pool");

        let h = pool.acquire("model-a", 1).expect("a");
        pool.record_usage(&h, 1);
        assert!(pool.acquire("model-b", 1).is_none());

        let model_a = pool.get_model_stats("model-a");
        assert_eq!(model_a.total.rpm, 1);
        assert_eq!(pool.get_model_stats("model-b").keys.len(), 0);
        pool.stop().await;
    }

    #[tokio::test]
    async fn per_model_buckets_are_independent() {
        let clock = ManualClock::default();
        let table = LimitTable::new().with(PROVIDER, "default", rpm(1));
        let opts = PoolOptions::new(PROVIDER)
            .with_limits(table)
            .with_clock(Arc::new(clock.clone()));
        let pool = CredentialPool::new(secrets(1), Arc::new(MemoryUsageStore::new()), opts)
            .await
            .expect("pool");

        assert!(pool.acquire("model-a", 1).is_some_and(|h| {
            pool.record_usage(&h, 1);
            true
        }));
        assert!(pool.acquire("model-b", 1).is_some());
        pool.stop().await;
    }

    #[tokio::test]
    async fn key_override_beats_table_limits() {
        let clock = ManualClock::default();
        let table = LimitTable::new().with(PROVIDER, MODEL, rpm(1));
        let opts = PoolOptions::new(PROVIDER)
            .with_limits(table)
            .with_clock(Arc::new(clock.clone()))
            .with_override(KeyLimitOverride {
                key: KeyIdentifier::from("tail0001"),
                model: Some(MODEL.to_string()),
                limits: rpm(3),
            })
            .with_override(KeyLimitOverride {
                key: KeyIdentifier::from(1usize),
                model: None,
                limits: rpm(100),
            });
        let pool = CredentialPool::new(secrets(2), Arc::new(MemoryUsageStore::new()), opts)
            .await
            .expect("pool");

        let order: Vec<Option<usize>> = (0..5).map(|_| take(&pool)).collect();
        assert_eq!(order, vec![Some(0), Some(1), Some(1), Some(1), None]);
        pool.stop().await;
    }

    #[tokio::test]
    async fn explicit_limits_bypass_the_table() {
        let clock = ManualClock::default();
        let pool = pool_with(1, rpm(1), &clock, Arc::default()).await;
        let h = pool.get_credential(MODEL, &rpm(5), 1).expect("1");
        pool.record_usage(&h, 1);
        assert!(pool.get_credential(MODEL, &rpm(5), 1).is_some());
        assert!(pool.acquire(MODEL, 1).is_none());
        pool.stop().await;
    }

    #[tokio::test]
    async fn reload_limits_applies_to_next_admission() {
        let clock = ManualClock::default();
        let pool = pool_with(1, rpm(1), &clock, Arc::default()).await;
        assert_eq!(take(&pool), Some(0));
        assert_eq!(take(&pool), None);

        pool.reload_limits(LimitTable::new().with(PROVIDER, MODEL, rpm(5)));
        assert_eq!(take(&pool), Some(0));
        pool.stop().await;
    }

    #[tokio::test]
    async fn wait_policy_outcomes() {
        let clock = ManualClock::default();
        let pool = pool_with(1, rpm(1), &clock, Arc::default()).await;
        let held = pool.acquire(MODEL, 1).expect("key");

        let err = pool
            .acquire_with(MODEL, 1, WaitPolicy::NO_WAIT)
            .await
            .expect_err("no wait");
        assert!(matches!(err, Error::NoAvailableKey { .. }));

        let short = WaitPolicy {
            wait: true,
            timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
        };
        let err = pool.acquire_with(MODEL, 1, short).await.expect_err("timeout");
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(err.is_exhausted());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(held);
        });
        let h = pool
            .acquire_with(MODEL, 1, WaitPolicy {
                timeout: Duration::from_secs(2),
                ..short
            })
            .await
            .expect("freed by drop");
        assert_eq!(h.index(), 0);
        pool.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocking_wait_times_out_then_succeeds() {
        let clock = ManualClock::default();
        let pool = pool_with(1, rpm(1), &clock, Arc::default()).await;
        let held = pool.acquire(MODEL, 1).expect("key");

        let short = WaitPolicy {
            wait: true,
            timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
        };
        let started = std::time::Instant::now();
        let err = pool.acquire_blocking(MODEL, 1, short).expect_err("timeout");
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(50));

        let err = pool
            .acquire_blocking(MODEL, 1, WaitPolicy::NO_WAIT)
            .expect_err("no wait");
        assert!(matches!(err, Error::NoAvailableKey { .. }));

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            drop(held);
        });
        let h = pool
            .acquire_blocking(MODEL, 1, WaitPolicy {
                timeout: Duration::from_secs(2),
                ..short
            })
            .expect("freed by drop");
        assert_eq!(h.index(), 0);
        releaser.join().expect("releaser");
        drop(h);
        pool.stop().await;
    }

    #[tokio::test]
    async fn stats_views_agree() {
        let clock = ManualClock::default();
        let pool = pool_with(2, RateLimits::unlimited(), &clock, Arc::default()).await;
        for (model, tokens) in [("a", 5u64), ("b", 7), ("a", 11)] {
            let h = pool.acquire(model, 1).expect("key");
            pool.record_usage(&h, tokens);
        }

        let global = pool.get_global_stats();
        assert_eq!(global.provider, PROVIDER);
        assert_eq!(global.total.total_tokens, 23);
        assert_eq!(global.keys.len(), 2);

        // a → key0, b → key1, a → key0
        let k0 = pool.get_key_stats("tail0000").expect("key 0");
        assert_eq!(k0.total.total_tokens, 16);
        assert_eq!(k0.breakdown.keys().collect::<Vec<_>>(), vec!["a"]);

        let a = pool.get_model_stats("a");
        assert_eq!(a.total.total_requests, 2);
        assert_eq!(a.keys.len(), 1);

        let g = pool.get_granular_stats(1usize, "b").expect("granular");
        assert_eq!(g.usage.total_tokens, 7);
        assert_eq!(pool.get_granular_stats(1usize, "a").expect("granular").usage.total_requests, 0);

        assert!(matches!(pool.get_key_stats(9usize), Err(Error::KeyNotFound(_))));
        pool.stop().await;
    }

    #[tokio::test]
    async fn history_stats_include_unflushed_events() {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryUsageStore::new());
        let pool = pool_with(1, RateLimits::unlimited(), &clock, store).await;
        for t in [3u64, 4] {
            let h = pool.acquire(MODEL, 1).expect("key");
            pool.record_usage(&h, t);
        }

        let h = pool
            .history_stats(0usize, Duration::from_secs(3600))
            .await
            .expect("history");
        assert_eq!(h.total.requests, 2);
        assert_eq!(h.total.tokens, 7);
        assert_eq!(h.by_model[MODEL].tokens, 7);
        pool.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_flushes() {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryUsageStore::new());
        let pool = pool_with(1, RateLimits::unlimited(), &clock, store.clone()).await;
        take(&pool);
        pool.stop().await;
        pool.stop().await;
        assert!(pool.is_stopped());
        assert_eq!(store.len(), 1);
        assert_eq!(pool.logger_stats().persisted, 1);
    }

    #[tokio::test]
    async fn concurrent_acquisition_never_exceeds_limit() {
        let clock = ManualClock::default();
        let pool = pool_with(4, rpm(5), &clock, Arc::default()).await;

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let mut got = 0u32;
                for _ in 0..10 {
                    if let Some(h) = pool.acquire(MODEL, 1) {
                        pool.record_usage(&h, 1);
                        got += 1;
                    }
                    tokio::task::yield_now().await;
                }
                got
            }));
        }
        let mut total = 0;
        for t in tasks {
            total += t.await.expect("task");
        }
        assert_eq!(total, 20);
        for k in pool.get_global_stats().keys {
            assert_eq!(k.usage.rpm, 5);
        }
        pool.stop().await;
    }
}
