//! Run 请求（AG-UI `RunAgentInput`）
//!
//! 客户端每次提交完整的对话历史；`threadId` / `runId` 缺省时由网关生成。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::GatewayError;

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
    Developer,
}

/// 助手消息中携带的工具调用指令（OpenAI function-call 形态）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDirective {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

fn function_kind() -> String {
    "function".to_string()
}

/// 对话消息；顺序即时间顺序
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default = "generate_message_id")]
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDirective>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: generate_message_id(),
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }
}

/// 客户端声明的前端工具
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// 一次 run 的输入，run 期间不可变
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub context: Vec<Value>,
    #[serde(default)]
    pub forwarded_props: Value,
    #[serde(default)]
    pub state: Value,
}

impl RunRequest {
    pub fn new(thread_id: impl Into<String>, run_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            messages,
            tools: Vec::new(),
            context: Vec::new(),
            forwarded_props: Value::Null,
            state: Value::Null,
        }
    }

    /// 补齐缺省 id 并校验请求；失败时返回 `InvalidRequest`，此时尚未产生任何事件
    pub fn normalize(mut self) -> Result<Self, GatewayError> {
        if self.thread_id.trim().is_empty() {
            self.thread_id = format!("thread_{}", uuid::Uuid::new_v4());
        }
        if self.run_id.trim().is_empty() {
            self.run_id = format!("run_{}", uuid::Uuid::new_v4());
        }
        if let Some(tool) = self.tools.iter().find(|t| t.name.trim().is_empty()) {
            return Err(GatewayError::InvalidRequest(format!(
                "tool name must not be empty (description: {:?})",
                tool.description
            )));
        }
        for msg in &self.messages {
            if msg.role == Role::Tool && msg.tool_call_id.as_deref().map_or(true, str::is_empty) {
                return Err(GatewayError::InvalidRequest(format!(
                    "tool message {} is missing toolCallId",
                    msg.id
                )));
            }
        }
        Ok(self)
    }

    /// 最近一条用户消息的文本
    pub fn latest_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    /// 读取 `forwardedProps` 中的字符串字段
    pub fn forwarded_str(&self, key: &str) -> Option<&str> {
        self.forwarded_props
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn forwarded_value(&self, key: &str) -> Option<&Value> {
        self.forwarded_props.get(key).filter(|v| !v.is_null())
    }
}

pub fn generate_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_camel_case_input() {
        let req: RunRequest = serde_json::from_value(json!({
            "threadId": "t1",
            "runId": "r1",
            "messages": [
                {"id": "m1", "role": "user", "content": "hi"},
                {"id": "m2", "role": "assistant", "content": "",
                 "toolCalls": [{"id": "c1", "type": "function",
                                "function": {"name": "weather", "arguments": "{}"}}]},
                {"id": "m3", "role": "tool", "content": "sunny", "toolCallId": "c1"}
            ],
            "forwardedProps": {"scenarioId": "tool-call"}
        }))
        .unwrap();
        assert_eq!(req.messages.len(), 3);
        assert_eq!(req.forwarded_str("scenarioId"), Some("tool-call"));
        assert_eq!(req.latest_user_text(), Some("hi"));
        let calls = req.messages[1].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "weather");
    }

    #[test]
    fn test_normalize_generates_missing_ids() {
        let req: RunRequest = serde_json::from_value(json!({"messages": []})).unwrap();
        let req = req.normalize().unwrap();
        assert!(req.thread_id.starts_with("thread_"));
        assert!(req.run_id.starts_with("run_"));
    }

    #[test]
    fn test_normalize_rejects_orphan_tool_message() {
        let req = RunRequest::new(
            "t",
            "r",
            vec![Message::new(Role::Tool, "result without call id")],
        );
        assert!(matches!(req.normalize(), Err(GatewayError::InvalidRequest(_))));
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        let res: Result<Message, _> = serde_json::from_value(json!({"role": "robot"}));
        assert!(res.is_err());
    }
}
