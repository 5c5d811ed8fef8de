use std::fmt;
use std::sync::Arc;

/// 展示用后缀长度（日志/统计/持久化里只出现这部分）。
pub const SUFFIX_LEN: usize = 8;

/// 取 secret 末尾 `SUFFIX_LEN` 个字符；不足时返回整个值。
pub fn key_suffix(secret: &str) -> String {
    let n = secret.chars().count();
    secret.chars().skip(n.saturating_sub(SUFFIX_LEN)).collect()
}

/// 池中的一个凭据。secret 只通过句柄交给调用方。
#[derive(Clone)]
pub struct Credential {
    index: usize,
    secret: Arc<str>,
    suffix: String,
}

impl Credential {
    pub fn new(index: usize, secret: &str) -> Self {
        Self {
            index,
            secret: Arc::from(secret),
            suffix: key_suffix(secret),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub(crate) fn secret(&self) -> &Arc<str> {
        &self.secret
    }

    /// 人类可读的标签，例如 `Key #1 (..abcd1234)`。
    pub fn label(&self) -> String {
        format!("Key #{} (..{})", self.index + 1, self.suffix)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("index", &self.index)
            .field("suffix", &self.suffix)
            .finish_non_exhaustive()
    }
}

/// 查询统计时定位 key：下标，或 secret 的完整值/可区分的尾部片段。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyIdentifier {
    Index(usize),
    Text(String),
}

impl KeyIdentifier {
    pub fn matches(&self, c: &Credential) -> bool {
        match self {
            KeyIdentifier::Index(i) => *i == c.index,
            KeyIdentifier::Text(s) => {
                let s = s.trim().trim_start_matches("..");
                !s.is_empty() && (c.secret.as_ref() == s || c.secret.ends_with(s))
            }
        }
    }
}

impl fmt::Display for KeyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyIdentifier::Index(i) => write!(f, "#{i}"),
            // 可能是完整 secret，只打印尾部
            KeyIdentifier::Text(s) => write!(f, "..{}", key_suffix(s)),
        }
    }
}

impl From<usize> for KeyIdentifier {
    fn from(i: usize) -> Self {
        KeyIdentifier::Index(i)
    }
}

impl From<&str> for KeyIdentifier {
    fn from(s: &str) -> Self {
        KeyIdentifier::Text(s.to_string())
    }
}

impl From<String> for KeyIdentifier {
    fn from(s: String) -> Self {
        KeyIdentifier::Text(s)
    }
}
