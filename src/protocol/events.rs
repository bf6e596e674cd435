//! AG-UI 事件模型
//!
//! 一次 run 的输出是一条全序的 `Event` 序列：以 `RUN_STARTED` 开始，以 `RUN_FINISHED` 或
//! `RUN_ERROR` 之一结束。序列化使用 `type` 判别字段与 AG-UI 线上名称（`TEXT_MESSAGE_CHUNK` 等），
//! 字段名为 camelCase。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 流上的单个事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    RunStarted { thread_id: String, run_id: String },

    #[serde(rename_all = "camelCase")]
    TextMessageStart {
        message_id: String,
        #[serde(default = "assistant_role")]
        role: String,
    },

    #[serde(rename_all = "camelCase")]
    TextMessageChunk { message_id: String, delta: String },

    #[serde(rename_all = "camelCase")]
    TextMessageEnd { message_id: String },

    #[serde(rename_all = "camelCase")]
    ToolCallStart {
        tool_call_id: String,
        tool_call_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_message_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    ToolCallArgs { tool_call_id: String, delta: String },

    #[serde(rename_all = "camelCase")]
    ToolCallEnd { tool_call_id: String },

    #[serde(rename_all = "camelCase")]
    ToolCallResult {
        message_id: String,
        tool_call_id: String,
        content: String,
        #[serde(default = "tool_role")]
        role: String,
    },

    /// 扩展事件：surface 协议载荷、MCP UI 资源等
    Custom { name: String, value: Value },

    #[serde(rename_all = "camelCase")]
    RunFinished { thread_id: String, run_id: String },

    RunError {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

fn assistant_role() -> String {
    "assistant".to_string()
}

fn tool_role() -> String {
    "tool".to_string()
}

impl Event {
    pub fn run_started(thread_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Event::RunStarted {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
        }
    }

    pub fn run_finished(thread_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Event::RunFinished {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
        }
    }

    pub fn run_error(message: impl Into<String>) -> Self {
        Event::RunError {
            message: message.into(),
            code: None,
        }
    }

    pub fn run_error_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Event::RunError {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    pub fn text_chunk(message_id: impl Into<String>, delta: impl Into<String>) -> Self {
        Event::TextMessageChunk {
            message_id: message_id.into(),
            delta: delta.into(),
        }
    }

    pub fn custom(name: impl Into<String>, value: Value) -> Self {
        Event::Custom {
            name: name.into(),
            value,
        }
    }

    /// AG-UI 线上类型名
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::RunStarted { .. } => "RUN_STARTED",
            Event::TextMessageStart { .. } => "TEXT_MESSAGE_START",
            Event::TextMessageChunk { .. } => "TEXT_MESSAGE_CHUNK",
            Event::TextMessageEnd { .. } => "TEXT_MESSAGE_END",
            Event::ToolCallStart { .. } => "TOOL_CALL_START",
            Event::ToolCallArgs { .. } => "TOOL_CALL_ARGS",
            Event::ToolCallEnd { .. } => "TOOL_CALL_END",
            Event::ToolCallResult { .. } => "TOOL_CALL_RESULT",
            Event::Custom { .. } => "CUSTOM",
            Event::RunFinished { .. } => "RUN_FINISHED",
            Event::RunError { .. } => "RUN_ERROR",
        }
    }

    /// RUN_FINISHED / RUN_ERROR
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::RunFinished { .. } | Event::RunError { .. })
    }

    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            Event::ToolCallStart { tool_call_id, .. }
            | Event::ToolCallArgs { tool_call_id, .. }
            | Event::ToolCallEnd { tool_call_id }
            | Event::ToolCallResult { tool_call_id, .. } => Some(tool_call_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_names_and_camel_case_fields() {
        let ev = Event::ToolCallStart {
            tool_call_id: "call_1".into(),
            tool_call_name: "weather".into(),
            parent_message_id: Some("msg_1".into()),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(
            v,
            json!({
                "type": "TOOL_CALL_START",
                "toolCallId": "call_1",
                "toolCallName": "weather",
                "parentMessageId": "msg_1"
            })
        );

        let v = serde_json::to_value(Event::run_started("t1", "r1")).unwrap();
        assert_eq!(v, json!({"type": "RUN_STARTED", "threadId": "t1", "runId": "r1"}));
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let v = serde_json::to_value(Event::run_error("boom")).unwrap();
        assert_eq!(v, json!({"type": "RUN_ERROR", "message": "boom"}));
    }

    #[test]
    fn test_deserialize_authored_event() {
        let ev: Event = serde_json::from_value(json!({
            "type": "TEXT_MESSAGE_CHUNK",
            "messageId": "m1",
            "delta": "Hello"
        }))
        .unwrap();
        assert_eq!(ev, Event::text_chunk("m1", "Hello"));
        assert_eq!(ev.event_type(), "TEXT_MESSAGE_CHUNK");
        assert!(!ev.is_terminal());
    }

    #[test]
    fn test_terminal_classification() {
        assert!(Event::run_finished("t", "r").is_terminal());
        assert!(Event::run_error("x").is_terminal());
        assert!(!Event::run_started("t", "r").is_terminal());
    }
}
