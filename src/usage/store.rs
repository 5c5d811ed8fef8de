use crate::usage::jsonl::JsonlUsageStore;
use crate::usage::sqlite::SqliteUsageStore;
use crate::usage::types::UsageEvent;
use anyhow::{Context, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;

/// 批次写入中途失败：前 `written` 个事件已完整落盘，重试时只需提交剩下的部分。
///
/// 不能整批原子写入的后端用它包装错误，写入器据此避免重复写入。
#[derive(Debug, thiserror::Error)]
#[error("写入 {written} 个事件后失败: {reason}")]
pub struct PartialWrite {
    pub written: usize,
    pub reason: String,
}

impl PartialWrite {
    pub fn new(written: usize, err: impl std::fmt::Display) -> anyhow::Error {
        anyhow::Error::new(Self {
            written,
            reason: format!("{err:#}"),
        })
    }

    /// 从错误里取出已写入的事件数；普通错误视为一个都没写。
    pub fn written_in(err: &anyhow::Error) -> usize {
        err.downcast_ref::<Self>().map_or(0, |p| p.written)
    }
}

/// 用量事件的持久化后端。
///
/// 读接口返回的事件按时间升序排列；`since` 为包含边界。
/// `append_batch` 失败时要么什么都没写，要么返回 [`PartialWrite`] 说明写到了哪里。
#[async_trait]
pub trait UsageStore: Send + Sync + Debug {
    async fn append_batch(&self, events: &[UsageEvent]) -> anyhow::Result<()>;

    async fn append(&self, event: &UsageEvent) -> anyhow::Result<()> {
        self.append_batch(std::slice::from_ref(event)).await
    }

    async fn load_history(
        &self,
        provider: &str,
        credential_suffix: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<UsageEvent>>;

    async fn load_provider_history(
        &self,
        provider: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<UsageEvent>>;

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 进程内存储：不跨重启，但同一个实例可在多个池之间共享。
#[derive(Debug, Default)]
pub struct MemoryUsageStore {
    events: Mutex<Vec<UsageEvent>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    fn select(&self, provider: &str, suffix: Option<&str>, since: DateTime<Utc>) -> Vec<UsageEvent> {
        let mut out: Vec<UsageEvent> = self
            .events
            .lock()
            .iter()
            .filter(|e| e.matches(provider, suffix, since))
            .cloned()
            .collect();
        out.sort_by_key(|e| e.timestamp);
        out
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn append_batch(&self, events: &[UsageEvent]) -> anyhow::Result<()> {
        self.events.lock().extend_from_slice(events);
        Ok(())
    }

    async fn load_history(
        &self,
        provider: &str,
        credential_suffix: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<UsageEvent>> {
        Ok(self.select(provider, Some(credential_suffix), since))
    }

    async fn load_provider_history(
        &self,
        provider: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<UsageEvent>> {
        Ok(self.select(provider, None, since))
    }
}

/// 按 URL 打开存储：`memory`、`sqlite:///path/to/usage.db`、`jsonl://dir`。
pub async fn open_store(url: &str) -> anyhow::Result<Arc<dyn UsageStore>> {
    let url = url.trim();
    if url.is_empty() || url.eq_ignore_ascii_case("memory") {
        return Ok(Arc::new(MemoryUsageStore::new()));
    }
    if let Some(path) = url.strip_prefix("sqlite://") {
        if path.is_empty() {
            bail!("sqlite 地址缺少路径: {url}");
        }
        let store = SqliteUsageStore::open(path)
            .with_context(|| format!("打开 sqlite 存储失败: {path}"))?;
        return Ok(Arc::new(store));
    }
    if let Some(dir) = url.strip_prefix("jsonl://") {
        if dir.is_empty() {
            bail!("jsonl 地址缺少目录: {url}");
        }
        let store = JsonlUsageStore::open(dir).await?;
        return Ok(Arc::new(store));
    }
    bail!("不支持的存储地址: {url}")
}
