//! 带重试的后端包装
//!
//! 只在流开始之前重试：stream_chat 返回 Err 且错误可重试时，按线性退避
//! （`delay × 第几次重试`）再次发起；流一旦开始，之后的错误交给调用方处理。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::LlmSection;
use crate::llm::{ChatRequest, ChunkStream, CompletionBackend, LlmError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_millis(1000),
        }
    }
}

impl RetryConfig {
    pub fn from_llm(config: &LlmSection) -> Self {
        Self {
            max_retries: config.max_retries,
            delay: config.retry_delay(),
        }
    }

    /// 第 `attempt` 次重试前的等待（从 1 开始）
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.delay.checked_mul(attempt).unwrap_or(Duration::MAX)
    }
}

pub struct RetryingBackend {
    inner: Arc<dyn CompletionBackend>,
    config: RetryConfig,
}

impl RetryingBackend {
    pub fn new(inner: Arc<dyn CompletionBackend>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl CompletionBackend for RetryingBackend {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChunkStream, LlmError> {
        let mut attempt = 0;
        loop {
            match self.inner.stream_chat(request).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let wait = self.config.backoff(attempt);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        max_retries = self.config.max_retries,
                        wait_ms = wait.as_millis() as u64,
                        "LLM request failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
