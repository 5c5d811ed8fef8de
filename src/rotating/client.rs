use crate::error::Error;
use crate::ledger::Settlement;
use crate::pool::{CredentialPool, KeyUsageHandle, WaitPolicy};
use crate::rotating::classify::{Classifier, default_classifier};
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

pub const DEFAULT_MAX_RETRIES: usize = 5;
pub const DEFAULT_ESTIMATED_TOKENS: u64 = 1000;

/// 响应里的实际 token 用量，成功后用于结算。
pub trait TokenUsage {
    fn total_tokens(&self) -> u64;
}

/// 异步调用能力：拿一个 api key 发一次请求。
pub trait Invoke: Send + Sync {
    type Request: Send + Sync + ?Sized;
    type Response: TokenUsage + Send;
    type Error: fmt::Display + Send;

    fn invoke(
        &self,
        api_key: &str,
        model_id: &str,
        request: &Self::Request,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send;
}

/// 同步调用能力。
pub trait BlockingInvoke {
    type Request: ?Sized;
    type Response: TokenUsage;
    type Error: fmt::Display;

    fn invoke_blocking(
        &self,
        api_key: &str,
        model_id: &str,
        request: &Self::Request,
    ) -> Result<Self::Response, Self::Error>;
}

/// 流式调用能力：只在打开流时判定限流，流的总用量由调用方在结束后上报。
pub trait StreamInvoke: Send + Sync {
    type Request: Send + Sync + ?Sized;
    type Stream: Send;
    type Error: fmt::Display + Send;

    fn open_stream(
        &self,
        api_key: &str,
        model_id: &str,
        request: &Self::Request,
    ) -> impl Future<Output = Result<Self::Stream, Self::Error>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum RotateError<E> {
    /// 池里拿不到 key（无可用 / 等待超时）。
    #[error(transparent)]
    NoKey(#[from] Error),
    /// 远端错误：非限流错误，或重试次数用完后的最后一次限流错误。
    #[error("远端调用失败: {0}")]
    Remote(E),
}

#[derive(Debug, Clone, Copy)]
pub struct RotateOptions {
    pub max_retries: usize,
    pub estimated_tokens: u64,
    pub wait: WaitPolicy,
}

impl Default for RotateOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            estimated_tokens: DEFAULT_ESTIMATED_TOKENS,
            wait: WaitPolicy::default(),
        }
    }
}

/// 给任意调用能力加上 key 轮转：限流时冷却当前 key、游标前进并换 key 重试，成功后自动结算用量。
///
/// 重试次数上限为 `min(max_retries, pool_size - 1)`。
pub struct RotatingClient<C> {
    inner: C,
    pool: CredentialPool,
    options: RotateOptions,
    classify: Classifier,
}

impl<C: fmt::Debug> fmt::Debug for RotatingClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotatingClient")
            .field("inner", &self.inner)
            .field("provider", &self.pool.provider())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<C> RotatingClient<C> {
    pub fn new(inner: C, pool: CredentialPool) -> Self {
        Self {
            inner,
            pool,
            options: RotateOptions::default(),
            classify: default_classifier(),
        }
    }

    pub fn with_options(mut self, options: RotateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_classifier<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.classify = std::sync::Arc::new(f);
        self
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    fn max_attempts(&self) -> usize {
        1 + self
            .options
            .max_retries
            .min(self.pool.len().saturating_sub(1))
    }

    /// 限流错误会冷却当前 key 并前移游标，返回 true；其他错误原样交还调用方。
    fn should_rotate(&self, handle: KeyUsageHandle, message: &str, attempt: usize) -> bool {
        if !(self.classify)(message) {
            return false;
        }
        tracing::warn!(
            provider = %self.pool.provider(),
            key = %handle.suffix(),
            attempt = attempt + 1,
            max_attempts = self.max_attempts(),
            "远端限流，切换 key: {message}"
        );
        handle.trigger_cooldown();
        self.pool.force_rotate_index();
        true
    }
}

impl<C: Invoke> RotatingClient<C> {
    pub async fn call(
        &self,
        model_id: &str,
        request: &C::Request,
    ) -> Result<C::Response, RotateError<C::Error>> {
        let attempts = self.max_attempts();
        let mut attempt = 0;
        loop {
            let handle = self
                .pool
                .acquire_with(model_id, self.options.estimated_tokens, self.options.wait)
                .await?;
            let result = self.inner.invoke(handle.api_key(), model_id, request).await;
            match result {
                Ok(resp) => {
                    self.pool.record_usage(&handle, resp.total_tokens());
                    return Ok(resp);
                }
                Err(e) => {
                    let message = e.to_string();
                    let rotated = self.should_rotate(handle, &message, attempt);
                    if !rotated || attempt + 1 >= attempts {
                        return Err(RotateError::Remote(e));
                    }
                }
            }
            attempt += 1;
        }
    }
}

impl<C: BlockingInvoke> RotatingClient<C> {
    pub fn call_blocking(
        &self,
        model_id: &str,
        request: &C::Request,
    ) -> Result<C::Response, RotateError<C::Error>> {
        let attempts = self.max_attempts();
        let mut attempt = 0;
        loop {
            let handle = self.pool.acquire_blocking(
                model_id,
                self.options.estimated_tokens,
                self.options.wait,
            )?;
            let result = self.inner.invoke_blocking(handle.api_key(), model_id, request);
            match result {
                Ok(resp) => {
                    self.pool.record_usage(&handle, resp.total_tokens());
                    return Ok(resp);
                }
                Err(e) => {
                    let message = e.to_string();
                    let rotated = self.should_rotate(handle, &message, attempt);
                    if !rotated || attempt + 1 >= attempts {
                        return Err(RotateError::Remote(e));
                    }
                }
            }
            attempt += 1;
        }
    }
}

impl<C: StreamInvoke> RotatingClient<C> {
    pub async fn open_stream(
        &self,
        model_id: &str,
        request: &C::Request,
    ) -> Result<StreamSession<C::Stream>, RotateError<C::Error>> {
        let attempts = self.max_attempts();
        let mut attempt = 0;
        loop {
            let handle = self
                .pool
                .acquire_with(model_id, self.options.estimated_tokens, self.options.wait)
                .await?;
            let result = self.inner.open_stream(handle.api_key(), model_id, request).await;
            match result {
                Ok(stream) => {
                    return Ok(StreamSession {
                        stream,
                        handle,
                        pool: self.pool.clone(),
                    });
                }
                Err(e) => {
                    let message = e.to_string();
                    let rotated = self.should_rotate(handle, &message, attempt);
                    if !rotated || attempt + 1 >= attempts {
                        return Err(RotateError::Remote(e));
                    }
                }
            }
            attempt += 1;
        }
    }
}

/// 打开的流和它占用的 key。读完后调用 `finish` 上报总用量；直接丢弃则归还预留。
#[derive(Debug)]
pub struct StreamSession<S> {
    stream: S,
    handle: KeyUsageHandle,
    pool: CredentialPool,
}

impl<S> StreamSession<S> {
    pub fn handle(&self) -> &KeyUsageHandle {
        &self.handle
    }

    pub fn finish(self, total_tokens: u64) -> Settlement {
        self.pool.record_usage(&self.handle, total_tokens)
    }
}

impl<S: Stream + Unpin> Stream for StreamSession<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.stream.size_hint()
    }
}
