//! LLM 后端抽象
//!
//! 所有后端（OpenAI 兼容 HTTP / 重试包装 / 测试脚本）实现 CompletionBackend：
//! stream_chat 发出一次流式 chat completion，返回增量 chunk 流（文本 delta 与 tool_call delta）。

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 发给后端的单条消息（OpenAI chat 格式）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ChatToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// assistant 消息中的完整工具调用
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: ChatFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

fn function_kind() -> String {
    "function".to_string()
}

/// 暴露给模型的工具定义
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ChatToolFunction,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ChatTool {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            kind: function_kind(),
            function: ChatToolFunction {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// 一次流式 chat completion 请求体
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ChatTool>,
    pub stream: bool,
    pub temperature: f32,
}

/// 流式响应的一帧
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallDelta>,
}

/// tool_call 增量：同一调用的多帧以 index 关联，id 与 name 通常只在首帧出现
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

impl ChatChunk {
    /// 仅含文本增量的 chunk
    pub fn text(delta: impl Into<String>) -> Self {
        Self::with_delta(ChunkDelta {
            content: Some(delta.into()),
            tool_calls: Vec::new(),
        })
    }

    /// 仅含一个 tool_call 增量的 chunk
    pub fn tool_call(index: usize, id: Option<&str>, name: Option<&str>, arguments: Option<&str>) -> Self {
        Self::with_delta(ChunkDelta {
            content: None,
            tool_calls: vec![ToolCallDelta {
                index,
                id: id.map(String::from),
                function: Some(FunctionDelta {
                    name: name.map(String::from),
                    arguments: arguments.map(String::from),
                }),
            }],
        })
    }

    fn with_delta(delta: ChunkDelta) -> Self {
        Self {
            choices: vec![ChunkChoice {
                delta,
                finish_reason: None,
            }],
        }
    }

    /// 第一个 choice 的 delta
    pub fn delta(&self) -> Option<&ChunkDelta> {
        self.choices.first().map(|c| &c.delta)
    }
}

/// LLM 调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("network error: {0}")]
    Network(String),

    #[error("LLM API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("LLM request timed out after {0:?}")]
    Timeout(Duration),

    #[error("stream error: {0}")]
    Stream(String),

    /// 服务端以错误对象拒绝请求（模型不存在、参数非法等）
    #[error("LLM API error: {0}")]
    Api(String),

    #[error("LLM configuration error: {0}")]
    Config(String),
}

impl LlmError {
    /// 网络错误、408、429 与 5xx 可重试；超时不重试（已耗尽调用预算）
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Network(_) => true,
            LlmError::Status { status, .. } => matches!(*status, 408 | 429 | 500..=599),
            LlmError::Timeout(_)
            | LlmError::Stream(_)
            | LlmError::Api(_)
            | LlmError::Config(_) => false,
        }
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, LlmError>> + Send>>;

/// 流式 chat completion 后端
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// 发出请求；返回 Ok 即表示流已开始，之后的错误在流中产生
    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChunkStream, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_deserializes_tool_call_delta() {
        let raw = r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":1,"id":"call_1","type":"function","function":{"name":"lookup","arguments":"{\"q\""}}]}}]}"#;
        let chunk: ChatChunk = serde_json::from_str(raw).unwrap();
        let delta = chunk.delta().unwrap();
        assert!(delta.content.is_none());
        assert_eq!(delta.tool_calls[0].index, 1);
        assert_eq!(delta.tool_calls[0].id.as_deref(), Some("call_1"));
        let f = delta.tool_calls[0].function.as_ref().unwrap();
        assert_eq!(f.name.as_deref(), Some("lookup"));
        assert_eq!(f.arguments.as_deref(), Some("{\"q\""));
    }

    #[test]
    fn test_request_omits_empty_tools() {
        let req = ChatRequest {
            model: "m".into(),
            messages: vec![ChatMessage::user("hi")],
            tools: Vec::new(),
            stream: true,
            temperature: 0.7,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert!(v.get("tools").is_none());
        assert_eq!(v["messages"][0]["role"], "user");
        assert!(v["messages"][0].get("tool_call_id").is_none());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(LlmError::Network("reset".into()).is_retryable());
        assert!(LlmError::Status { status: 429, body: String::new() }.is_retryable());
        assert!(LlmError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(LlmError::Status { status: 408, body: String::new() }.is_retryable());
        assert!(!LlmError::Status { status: 401, body: String::new() }.is_retryable());
        assert!(!LlmError::Stream("bad".into()).is_retryable());
        assert!(!LlmError::Timeout(Duration::from_secs(1)).is_retryable());
    }
}
