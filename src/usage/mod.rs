//! 用量事件的持久化：存储后端与异步批量写入器。

mod jsonl;
mod logger;
mod sqlite;
mod store;
mod types;

pub use jsonl::{JsonlUsageStore, cleanup_usage_files};
pub use logger::{
    DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_WRITE_ATTEMPTS, LoggerOptions,
    LoggerStats, UsageLogger,
};
pub use sqlite::SqliteUsageStore;
pub use store::{MemoryUsageStore, PartialWrite, UsageStore, open_store};
pub use types::UsageEvent;
