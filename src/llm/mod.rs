//! LLM 层：流式后端抽象与实现（OpenAI 兼容 HTTP / 重试包装 / 脚本化 Mock）

pub mod mock;
pub mod openai;
pub mod retry;
pub mod traits;

pub use mock::{Scripted, ScriptedBackend};
pub use openai::OpenAiCompatClient;
pub use retry::{RetryConfig, RetryingBackend};
pub use traits::{
    ChatChunk, ChatFunctionCall, ChatMessage, ChatRequest, ChatTool, ChatToolCall, ChunkStream,
    CompletionBackend, LlmError, ToolCallDelta,
};
