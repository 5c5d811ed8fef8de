use crate::usage::store::UsageStore;
use crate::usage::types::UsageEvent;
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Arc;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS usage_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    provider TEXT NOT NULL,
    model_id TEXT NOT NULL,
    credential_suffix TEXT NOT NULL,
    token_count INTEGER NOT NULL,
    timestamp_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_usage_lookup
    ON usage_events (provider, credential_suffix, timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_usage_time
    ON usage_events (provider, timestamp_ms);
";

/// SQLite 后端。rusqlite 是同步 API，所有访问都放到 `spawn_blocking` 里。
///
/// 多个进程可以指向同一个文件；冲突语义是最后写入者为准。
#[derive(Debug, Clone)]
pub struct SqliteUsageStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteUsageStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("创建数据库目录失败: {parent:?}"))?;
        }
        let conn = Connection::open(path).with_context(|| format!("打开数据库失败: {path:?}"))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        // 内存库不支持 WAL，返回值忽略即可
        let _: Option<String> = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .ok();
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA).context("初始化 usage_events 表失败")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut *guard)
        })
        .await
        .map_err(|e| anyhow!("sqlite 任务异常退出: {e}"))?
    }

    async fn query(
        &self,
        provider: &str,
        suffix: Option<&str>,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<UsageEvent>> {
        let provider = provider.to_string();
        let suffix = suffix.map(str::to_string);
        let since_ms = since.timestamp_millis();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT provider, model_id, credential_suffix, token_count, timestamp_ms
                 FROM usage_events
                 WHERE provider = ?1 AND (?2 IS NULL OR credential_suffix = ?2) AND timestamp_ms >= ?3
                 ORDER BY timestamp_ms ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![provider, suffix, since_ms], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (provider, model_id, credential_suffix, tokens, ts) = row?;
                let Some(timestamp) = DateTime::<Utc>::from_timestamp_millis(ts) else {
                    continue;
                };
                out.push(UsageEvent {
                    provider,
                    model_id,
                    credential_suffix,
                    token_count: u64::try_from(tokens).unwrap_or(0),
                    timestamp,
                });
            }
            Ok(out)
        })
        .await
    }
}

#[async_trait]
impl UsageStore for SqliteUsageStore {
    async fn append_batch(&self, events: &[UsageEvent]) -> anyhow::Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let events = events.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO usage_events (provider, model_id, credential_suffix, token_count, timestamp_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for e in &events {
                    let tokens = i64::try_from(e.token_count).unwrap_or(i64::MAX);
                    stmt.execute(params![
                        e.provider,
                        e.model_id,
                        e.credential_suffix,
                        tokens,
                        e.timestamp.timestamp_millis()
                    ])?;
                }
            }
            tx.commit().context("提交 usage 批次失败")?;
            Ok(())
        })
        .await
    }

    async fn load_history(
        &self,
        provider: &str,
        credential_suffix: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<UsageEvent>> {
        self.query(provider, Some(credential_suffix), since).await
    }

    async fn load_provider_history(
        &self,
        provider: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<UsageEvent>> {
        self.query(provider, None, since).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch("PRAGMA optimize")?;
            Ok(())
        })
        .await
    }
}
