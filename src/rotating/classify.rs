use std::sync::Arc;

/// 判定远端错误是否属于限流。可替换，用于适配不同 SDK 的错误文案。
pub type Classifier = Arc<dyn Fn(&str) -> bool + Send + Sync>;

const RATE_LIMIT_MARKERS: [&str; 4] = ["429", "too many requests", "rate limit", "resource exhausted"];

/// 默认的启发式判定：错误文本（不区分大小写）包含任一限流特征。
pub fn is_rate_limit_error(message: &str) -> bool {
    let m = message.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|k| m.contains(k))
        || m.contains("resource_exhausted")
        || m.contains("ratelimit")
}

pub fn default_classifier() -> Classifier {
    Arc::new(is_rate_limit_error)
}
