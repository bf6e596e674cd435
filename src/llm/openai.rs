//! OpenAI 兼容 chat completion 客户端（流式）
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（api_base 可配置）：DeepSeek、OpenAI、自建代理等。
//! 请求体与增量帧在本 crate 的 `ChatRequest` / `ChatChunk` 与 async_openai 类型之间转换；
//! 首帧之前的失败作为 `Err` 返回（供 RetryingBackend 判断是否重试），之后的失败在流中产出。
//! 单次调用的超时覆盖建立连接与整个流读取。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{CreateChatCompletionRequest, CreateChatCompletionStreamResponse};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::StreamExt;

use crate::config::LlmSection;
use crate::llm::traits::{ChunkChoice, ChunkDelta, FunctionDelta};
use crate::llm::{ChatChunk, ChatRequest, ChunkStream, CompletionBackend, LlmError, ToolCallDelta};

/// OpenAI 兼容客户端：持有 async_openai Client、端点与单次调用超时
#[derive(Clone)]
pub struct OpenAiCompatClient {
    client: Client<OpenAIConfig>,
    endpoint: String,
    timeout: Duration,
}

impl OpenAiCompatClient {
    pub fn new(
        http: reqwest::Client,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        let config = OpenAIConfig::new()
            .with_api_base(endpoint.clone())
            .with_api_key(api_key.into());
        Self {
            client: Client::with_config(config).with_http_client(http),
            endpoint,
            timeout,
        }
    }

    /// 按 [llm] 配置构建；无可用端点时返回 Config 错误
    pub fn from_config(http: reqwest::Client, config: &LlmSection) -> Result<Self, LlmError> {
        let endpoint = config.endpoint().ok_or_else(|| {
            LlmError::Config(format!(
                "no base_url configured for provider '{}'",
                config.provider
            ))
        })?;
        Ok(Self::new(http, endpoint, config.api_key.clone(), config.timeout()))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// 请求体按 OpenAI 线上格式转换为 async_openai 请求
fn to_openai_request(request: &ChatRequest) -> Result<CreateChatCompletionRequest, LlmError> {
    let mut request = request.clone();
    request.stream = true;
    serde_json::to_value(&request)
        .and_then(serde_json::from_value)
        .map_err(|e| LlmError::Config(format!("invalid chat request: {e}")))
}

fn to_chunk(response: CreateChatCompletionStreamResponse) -> ChatChunk {
    let choices = response
        .choices
        .into_iter()
        .map(|choice| ChunkChoice {
            delta: ChunkDelta {
                content: choice.delta.content,
                tool_calls: choice
                    .delta
                    .tool_calls
                    .unwrap_or_default()
                    .into_iter()
                    .map(|call| ToolCallDelta {
                        index: call.index as usize,
                        id: call.id,
                        function: call.function.map(|f| FunctionDelta {
                            name: f.name,
                            arguments: f.arguments,
                        }),
                    })
                    .collect(),
            },
            finish_reason: choice
                .finish_reason
                .and_then(|r| serde_json::to_value(r).ok())
                .and_then(|v| v.as_str().map(str::to_string)),
        })
        .collect();
    ChatChunk { choices }
}

/// async_openai 错误归类到 LlmError，保证 `is_retryable` 对 HTTP 状态码仍然有效。
/// 流式请求的非 2xx 响应只以错误文本的形式出现，状态码从文本里取。
fn classify(err: OpenAIError, timeout: Duration) -> LlmError {
    match err {
        OpenAIError::Reqwest(e) if e.is_timeout() => LlmError::Timeout(timeout),
        OpenAIError::Reqwest(e) => match e.status() {
            Some(status) => LlmError::Status {
                status: status.as_u16(),
                body: e.to_string(),
            },
            None => LlmError::Network(e.to_string()),
        },
        e @ OpenAIError::ApiError(_) => LlmError::Api(e.to_string()),
        OpenAIError::InvalidArgument(msg) => LlmError::Config(msg),
        e @ OpenAIError::JSONDeserialize(..) => LlmError::Stream(e.to_string()),
        other => {
            let text = other.to_string();
            match status_in(&text) {
                Some(status) => LlmError::Status { status, body: text },
                None => LlmError::Network(text),
            }
        }
    }
}

/// 取 "status code: 503 ..." 之后的第一个三位数
fn status_in(text: &str) -> Option<u16> {
    let lower = text.to_ascii_lowercase();
    let at = lower.find("status code")?;
    lower[at..]
        .split(|c: char| !c.is_ascii_digit())
        .find(|s| s.len() == 3)
        .and_then(|s| s.parse().ok())
        .filter(|status| (100..600).contains(status))
}

#[async_trait]
impl CompletionBackend for OpenAiCompatClient {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChunkStream, LlmError> {
        let timeout = self.timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        let openai_request = to_openai_request(request)?;

        tracing::debug!(
            endpoint = %self.endpoint,
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "LLM: sending request"
        );

        let mut stream = match tokio::time::timeout_at(
            deadline,
            self.client.chat().create_stream(openai_request),
        )
        .await
        {
            Err(_) => return Err(LlmError::Timeout(timeout)),
            Ok(Err(e)) => return Err(classify(e, timeout)),
            Ok(Ok(stream)) => stream,
        };

        // 连接与状态错误在首帧上才暴露
        let first = match tokio::time::timeout_at(deadline, stream.next()).await {
            Err(_) => return Err(LlmError::Timeout(timeout)),
            Ok(None) => None,
            Ok(Some(Err(e))) => return Err(classify(e, timeout)),
            Ok(Some(Ok(response))) => Some(to_chunk(response)),
        };

        Ok(Box::pin(async_stream::stream! {
            if let Some(chunk) = first {
                yield Ok(chunk);
            } else {
                return;
            }
            loop {
                let next = match tokio::time::timeout_at(deadline, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        yield Err(LlmError::Timeout(timeout));
                        return;
                    }
                };
                match next {
                    None => break,
                    Some(Ok(response)) => yield Ok(to_chunk(response)),
                    Some(Err(e)) => {
                        yield Err(LlmError::Stream(e.to_string()));
                        return;
                    }
                }
            }
        }))
    }
}
