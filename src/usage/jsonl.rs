use crate::usage::store::{PartialWrite, UsageStore};
use crate::usage::types::UsageEvent;
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// 按天分片的 JSONL 存储：`<dir>/YYYY-MM-DD.jsonl`，每行一个事件。
///
/// 事件写入其时间戳所在日期的分片，按 lookback 读取时只需要扫描相关日期。
#[derive(Debug)]
pub struct JsonlUsageStore {
    dir: PathBuf,
    writer: Mutex<WriterState>,
}

#[derive(Debug, Default)]
struct WriterState {
    date: String,
    file: Option<tokio::fs::File>,
}

impl JsonlUsageStore {
    pub async fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("创建 usage 目录失败: {dir:?}"))?;
        Ok(Self {
            dir,
            writer: Mutex::new(WriterState::default()),
        })
    }

    async fn ensure_writer<'a>(
        &self,
        state: &'a mut WriterState,
        date: &str,
    ) -> anyhow::Result<&'a mut tokio::fs::File> {
        if state.date != date || state.file.is_none() {
            state.file = None;
            state.date.clear();

            let path = self.dir.join(format!("{date}.jsonl"));
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .with_context(|| format!("打开数据文件失败: {path:?}"))?;
            state.date = date.to_string();
            state.file = Some(file);
        }
        state.file.as_mut().ok_or_else(|| anyhow!("writer 未初始化"))
    }

    /// 追加一段同一天的事件。写到一半失败时截断回写入前的长度，不留下半行。
    async fn write_run(
        &self,
        state: &mut WriterState,
        date: &str,
        buf: &[u8],
    ) -> anyhow::Result<()> {
        let file = self.ensure_writer(state, date).await?;
        let start = file.metadata().await.context("读取数据文件长度失败")?.len();
        let mut result = file.write_all(buf).await;
        if result.is_ok() {
            result = file.flush().await;
        }
        if let Err(e) = result {
            if let Err(te) = file.set_len(start).await {
                tracing::warn!("回滚数据文件失败: {te}");
            }
            state.file = None;
            state.date.clear();
            return Err(anyhow::Error::new(e).context(format!("写入 {date} 分片失败")));
        }
        Ok(())
    }

    async fn scan(
        &self,
        provider: &str,
        suffix: Option<&str>,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<UsageEvent>> {
        // 持有 writer 锁，避免读到写了一半的批次
        let _writer = self.writer.lock().await;

        let first_day = since.date_naive();
        let mut shards: Vec<(NaiveDate, PathBuf)> = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(de) = dir.next_entry().await? {
            if !de.file_type().await?.is_file() {
                continue;
            }
            let name = de.file_name().to_string_lossy().to_string();
            let Some(date) = shard_date(&name) else {
                continue;
            };
            if date >= first_day {
                shards.push((date, de.path()));
            }
        }
        shards.sort();

        let mut out = Vec::new();
        for (_, path) in shards {
            let content = tokio::fs::read(&path)
                .await
                .with_context(|| format!("读取数据文件失败: {path:?}"))?;
            for line in content.split(|&b| b == b'\n') {
                if line.is_empty() {
                    continue;
                }
                let e: UsageEvent = match sonic_rs::from_slice(line) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if e.matches(provider, suffix, since) {
                    out.push(e);
                }
            }
        }
        out.sort_by_key(|e| e.timestamp);
        Ok(out)
    }
}

#[async_trait]
impl UsageStore for JsonlUsageStore {
    async fn append_batch(&self, events: &[UsageEvent]) -> anyhow::Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        // 保持入参顺序，按连续的同一天切段，这样失败时已写入的总是一个前缀
        let mut runs: Vec<(String, Vec<u8>, usize)> = Vec::new();
        for e in events {
            let date = e.timestamp.format(DATE_FORMAT).to_string();
            let json = sonic_rs::to_vec(e).context("序列化 usage event 失败")?;
            match runs.last_mut() {
                Some((d, buf, n)) if *d == date => {
                    buf.extend_from_slice(&json);
                    buf.push(b'\n');
                    *n += 1;
                }
                _ => {
                    let mut buf = json;
                    buf.push(b'\n');
                    runs.push((date, buf, 1));
                }
            }
        }

        let mut writer = self.writer.lock().await;
        let mut written = 0usize;
        for (date, buf, n) in runs {
            if let Err(e) = self.write_run(&mut *writer, &date, &buf).await {
                return Err(PartialWrite::new(written, e));
            }
            written += n;
        }
        Ok(())
    }

    async fn load_history(
        &self,
        provider: &str,
        credential_suffix: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<UsageEvent>> {
        self.scan(provider, Some(credential_suffix), since).await
    }

    async fn load_provider_history(
        &self,
        provider: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<UsageEvent>> {
        self.scan(provider, None, since).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        if let Some(mut file) = writer.file.take() {
            file.sync_all().await.context("同步数据文件失败")?;
        }
        writer.date.clear();
        Ok(())
    }
}

fn shard_date(name: &str) -> Option<NaiveDate> {
    let date = name.strip_suffix(".jsonl")?;
    if date.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(date, DATE_FORMAT).ok()
}

/// 删除超过保留天数的分片，返回删除的文件数。今天和昨天的分片总是保留。
pub async fn cleanup_usage_files(
    dir: impl AsRef<Path>,
    retention_days: u32,
    today: NaiveDate,
) -> anyhow::Result<usize> {
    let min_age_to_delete_days: i64 = retention_days.max(2).into();

    let mut entries = match tokio::fs::read_dir(dir.as_ref()).await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut deleted = 0usize;
    while let Some(de) = entries.next_entry().await? {
        if !de.file_type().await?.is_file() {
            continue;
        }
        let name = de.file_name().to_string_lossy().to_string();
        let Some(file_date) = shard_date(&name) else {
            continue;
        };
        if (today - file_date).num_days() < min_age_to_delete_days {
            continue;
        }

        match tokio::fs::remove_file(de.path()).await {
            Ok(_) => deleted += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(deleted)
}
