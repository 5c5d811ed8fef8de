//! 调用方侧的轮转重试装饰器。

mod classify;
mod client;

pub use classify::{Classifier, default_classifier, is_rate_limit_error};
pub use client::{
    BlockingInvoke, DEFAULT_ESTIMATED_TOKENS, DEFAULT_MAX_RETRIES, Invoke, RotateError,
    RotateOptions, RotatingClient, StreamInvoke, StreamSession, TokenUsage,
};
