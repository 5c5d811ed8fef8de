use crate::usage::store::{PartialWrite, UsageStore};
use crate::usage::types::UsageEvent;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior, interval_at};

pub const DEFAULT_BATCH_SIZE: usize = 64;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_WRITE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct LoggerOptions {
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// 同一批次最多写几次；全部失败后丢弃并计数。
    pub max_write_attempts: u32,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_write_attempts: DEFAULT_MAX_WRITE_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoggerStats {
    pub logged: u64,
    pub persisted: u64,
    pub dropped: u64,
    pub failed_writes: u64,
}

impl LoggerStats {
    /// 已入队但还没有落盘（也没有被丢弃）的事件数。
    pub fn pending(&self) -> u64 {
        self.logged
            .saturating_sub(self.persisted.saturating_add(self.dropped))
    }
}

#[derive(Debug, Default)]
struct Counters {
    logged: AtomicU64,
    persisted: AtomicU64,
    dropped: AtomicU64,
    failed_writes: AtomicU64,
}

enum Command {
    Event(UsageEvent),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// 异步用量写入器：`log` 只入队，单个后台任务按数量或时间攒批写入存储。
///
/// 写入失败不会影响调用方，内存里的计数仍然是准的。
#[derive(Debug)]
pub struct UsageLogger {
    tx: mpsc::UnboundedSender<Command>,
    counters: Arc<Counters>,
    stopped: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Event(e) => f.debug_tuple("Event").field(e).finish(),
            Command::Flush(_) => f.write_str("Flush"),
            Command::Shutdown(_) => f.write_str("Shutdown"),
        }
    }
}

impl UsageLogger {
    /// 启动后台任务；必须在 tokio runtime 内调用。
    pub fn spawn(store: Arc<dyn UsageStore>, opts: LoggerOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let worker = Worker {
            store,
            batch: Vec::new(),
            attempts: 0,
            failing: 0,
            opts: LoggerOptions {
                batch_size: opts.batch_size.max(1),
                flush_interval: opts.flush_interval.max(Duration::from_millis(1)),
                max_write_attempts: opts.max_write_attempts.max(1),
            },
            counters: counters.clone(),
        };
        let handle = tokio::spawn(worker.run(rx));

        Self {
            tx,
            counters,
            stopped: AtomicBool::new(false),
            worker: Mutex::new(Some(handle)),
        }
    }

    /// 入队后立即返回，永不阻塞。
    pub fn log(&self, event: UsageEvent) {
        self.counters.logged.fetch_add(1, Ordering::Relaxed);
        if self.stopped.load(Ordering::Acquire) || self.tx.send(Command::Event(event)).is_err() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("usage logger 已停止，事件被丢弃");
        }
    }

    /// 等待此前入队的事件全部处理完（写入成功或重试耗尽后丢弃）。
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// 排空队列、写完最后一批再返回。重复调用是 no-op。
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!("usage logger 后台任务异常退出: {e}");
        }
    }

    pub fn stats(&self) -> LoggerStats {
        LoggerStats {
            logged: self.counters.logged.load(Ordering::Relaxed),
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed_writes: self.counters.failed_writes.load(Ordering::Relaxed),
        }
    }
}

struct Worker {
    store: Arc<dyn UsageStore>,
    batch: Vec<UsageEvent>,
    attempts: u32,
    /// 正在重试的批次前缀长度。
    failing: usize,
    opts: LoggerOptions,
    counters: Arc<Counters>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let period = self.opts.flush_interval;
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 存储写入失败后不再按批次大小触发，只等下次 tick 重试。
        let mut flush_blocked = false;

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Event(e)) => {
                        self.batch.push(e);
                        if !flush_blocked && self.batch.len() >= self.opts.batch_size {
                            flush_blocked = self.flush_once().await;
                        }
                    }
                    Some(Command::Flush(ack)) => {
                        self.flush_all().await;
                        flush_blocked = false;
                        let _ = ack.send(());
                    }
                    Some(Command::Shutdown(ack)) => {
                        self.shutdown(&mut rx).await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.flush_all().await;
                        break;
                    }
                },
                _ = tick.tick() => {
                    flush_blocked = self.flush_once().await;
                }
            }
        }
    }

    /// 写一次当前批次。返回 true 表示需要稍后重试。
    ///
    /// 失败时只重试尚未落盘的事件；重试耗尽只丢弃首次失败时已在批次里的那部分，
    /// 之后到达的事件重新计数。
    async fn flush_once(&mut self) -> bool {
        if self.batch.is_empty() {
            self.attempts = 0;
            self.failing = 0;
            return false;
        }

        match self.store.append_batch(&self.batch).await {
            Ok(()) => {
                let n = self.batch.len() as u64;
                self.counters.persisted.fetch_add(n, Ordering::Relaxed);
                tracing::debug!(events = n, "usage 批次已写入");
                self.batch.clear();
                self.attempts = 0;
                self.failing = 0;
                false
            }
            Err(e) => {
                let written = PartialWrite::written_in(&e).min(self.batch.len());
                if written > 0 {
                    self.batch.drain(..written);
                    self.counters
                        .persisted
                        .fetch_add(written as u64, Ordering::Relaxed);
                    // 有进展就重新计数，剩下的事件都刚被尝试过一次
                    self.failing = 0;
                }
                self.counters.failed_writes.fetch_add(1, Ordering::Relaxed);
                if self.failing == 0 {
                    self.attempts = 0;
                    self.failing = self.batch.len();
                }
                self.attempts += 1;

                if self.attempts >= self.opts.max_write_attempts {
                    let n = self.failing;
                    self.batch.drain(..n);
                    self.counters.dropped.fetch_add(n as u64, Ordering::Relaxed);
                    tracing::error!(
                        events = n,
                        attempts = self.attempts,
                        "usage 批次写入失败，已丢弃: {e:#}"
                    );
                    self.attempts = 0;
                    self.failing = 0;
                    false
                } else {
                    tracing::warn!(
                        attempt = self.attempts,
                        written,
                        "usage 批次写入失败，稍后重试: {e:#}"
                    );
                    true
                }
            }
        }
    }

    async fn flush_all(&mut self) {
        while !self.batch.is_empty() {
            self.flush_once().await;
        }
    }

    async fn shutdown(&mut self, rx: &mut mpsc::UnboundedReceiver<Command>) {
        rx.close();
        let mut acks = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                Command::Event(e) => self.batch.push(e),
                Command::Flush(ack) | Command::Shutdown(ack) => acks.push(ack),
            }
        }
        self.flush_all().await;
        for ack in acks {
            let _ = ack.send(());
        }
    }
}
