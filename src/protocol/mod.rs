//! 协议层：AG-UI 事件、Run 输入与入站行流解析

pub mod events;
pub mod input;
pub mod sse;

pub use events::Event;
pub use input::{
    generate_message_id, FunctionCall, Message, Role, RunRequest, ToolCallDirective, ToolSpec,
};
pub use sse::{SseLine, SseLineStream};
