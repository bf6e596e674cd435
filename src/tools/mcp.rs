//! MCP 客户端（streamable HTTP 上的 JSON-RPC 2.0）
//!
//! 会话建立：首个请求必须是 `initialize`（不带 `mcp-session-id`），服务端在响应头中返回会话 id，
//! 之后所有请求都携带该头。响应既可能是普通 JSON，也可能是一帧 `text/event-stream`。
//! 工具调用失败且看起来可以通过重连修复时（会话失效、连接断开等），重连一次后重试。

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::McpSection;
use crate::protocol::sse::parse_line;
use crate::tools::{sanitize_tool_name, Tool, ToolOutput, ToolRegistry};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
const SESSION_HEADER: &str = "mcp-session-id";
const DEFAULT_TOOL_RESULT: &str = "Tool executed successfully";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum McpError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("MCP client not connected: {0}")]
    NotConnected(String),

    #[error("MCP request timed out after {0:?}")]
    Timeout(Duration),
}

impl McpError {
    /// 可能通过重连修复的错误
    pub fn is_recoverable(&self) -> bool {
        match self {
            McpError::Http { status, .. } => matches!(status, 400 | 401 | 403 | 404),
            McpError::Network(_) | McpError::NotConnected(_) => true,
            McpError::Rpc { message, .. } => message.to_lowercase().contains("session"),
            McpError::Protocol(_) | McpError::Timeout(_) => false,
        }
    }
}

/// `tools/list` 返回的工具描述
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_input_schema")]
    pub input_schema: Value,
}

fn default_input_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

impl McpToolInfo {
    /// 给 LLM 的描述：有 title 时置于描述前
    pub fn llm_description(&self) -> String {
        let desc = self
            .description
            .clone()
            .unwrap_or_else(|| format!("Tool: {}", self.name));
        match &self.title {
            Some(title) if !desc.starts_with(title.as_str()) => format!("{title}. {desc}"),
            _ => desc,
        }
    }
}

/// `tools/call` 结果
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McpCallResult {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default)]
    pub is_error: bool,
}

impl McpCallResult {
    /// 文本部分以换行拼接（为空时用默认文案），resource 部分作为 UI 资源
    pub fn into_output(self) -> ToolOutput {
        let texts: Vec<&str> = self
            .content
            .iter()
            .filter(|c| c["type"] == "text")
            .filter_map(|c| c["text"].as_str())
            .collect();
        let text = if texts.is_empty() {
            DEFAULT_TOOL_RESULT.to_string()
        } else {
            texts.join("\n")
        };
        let resources = self
            .content
            .iter()
            .filter(|c| c["type"] == "resource")
            .cloned()
            .collect();
        ToolOutput { text, resources }
    }
}

#[derive(Debug, Default)]
struct McpState {
    session_id: Option<String>,
    connected: bool,
    tools: Vec<McpToolInfo>,
}

/// MCP 服务端连接
#[derive(Debug)]
pub struct McpClient {
    http: reqwest::Client,
    url: String,
    server_id: String,
    request_timeout: Duration,
    state: RwLock<McpState>,
    next_id: AtomicU64,
}

impl McpClient {
    pub fn new(http: reqwest::Client, config: &McpSection) -> Self {
        Self {
            http,
            url: config.server_url.clone(),
            server_id: config.server_id.clone(),
            request_timeout: config.tool_call_timeout(),
            state: RwLock::new(McpState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn server_url(&self) -> &str {
        &self.url
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.connected
    }

    pub async fn tools(&self) -> Vec<McpToolInfo> {
        self.state.read().await.tools.clone()
    }

    pub async fn tool_count(&self) -> usize {
        self.state.read().await.tools.len()
    }

    /// initialize → notifications/initialized → tools/list
    pub async fn connect(&self) -> Result<(), McpError> {
        if self.is_connected().await {
            return Ok(());
        }

        self.state.write().await.session_id = None;
        let init = self
            .rpc(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await?;
        tracing::debug!(server_id = %self.server_id, server_info = %init["serverInfo"], "MCP initialized");

        self.notify("notifications/initialized").await?;
        self.state.write().await.connected = true;
        let tools = self.refresh_tools().await?;
        tracing::info!(
            server_id = %self.server_id,
            url = %self.url,
            tool_count = tools.len(),
            "MCP client connected"
        );
        Ok(())
    }

    /// 在 `timeout` 内连接；失败只记日志，返回是否成功
    pub async fn connect_with_timeout(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.connect()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(server_id = %self.server_id, error = %e, "MCP connect failed");
                false
            }
            Err(_) => {
                tracing::warn!(server_id = %self.server_id, ?timeout, "MCP connect timed out");
                false
            }
        }
    }

    pub async fn refresh_tools(&self) -> Result<Vec<McpToolInfo>, McpError> {
        let result = self.rpc("tools/list", json!({})).await?;
        let tools: Vec<McpToolInfo> = serde_json::from_value(result["tools"].clone())
            .map_err(|e| McpError::Protocol(format!("invalid tools/list result: {e}")))?;
        self.state.write().await.tools = tools.clone();
        Ok(tools)
    }

    /// 调用工具；可恢复错误时重连一次再试
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<McpCallResult, McpError> {
        match self.call_tool_once(name, arguments.clone()).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_recoverable() => {
                tracing::warn!(
                    server_id = %self.server_id,
                    tool = name,
                    error = %e,
                    "MCP tool call failed, reconnecting and retrying once"
                );
                self.disconnect().await;
                self.connect().await?;
                self.call_tool_once(name, arguments).await
            }
            Err(e) => Err(e),
        }
    }

    async fn call_tool_once(&self, name: &str, arguments: Value) -> Result<McpCallResult, McpError> {
        if !self.is_connected().await {
            return Err(McpError::NotConnected(self.server_id.clone()));
        }
        let result = self
            .rpc("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("invalid tools/call result: {e}")))
    }

    /// 断开并清空会话；有会话 id 时尽力通知服务端（HTTP DELETE）
    pub async fn disconnect(&self) {
        let session_id = {
            let mut state = self.state.write().await;
            state.connected = false;
            state.session_id.take()
        };
        if let Some(sid) = session_id {
            let res = self
                .http
                .delete(&self.url)
                .header(SESSION_HEADER, sid)
                .timeout(Duration::from_secs(2))
                .send()
                .await;
            if let Err(e) = res {
                tracing::debug!(error = %e, "MCP session delete failed");
            }
        }
    }

    async fn notify(&self, method: &str) -> Result<(), McpError> {
        let body = json!({"jsonrpc": "2.0", "method": method});
        self.post(&body).await.map(|_| ())
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        let text = self.post(&body).await?;
        let message = extract_message(&text, id)?;

        if let Some(err) = message.get("error") {
            return Err(McpError::Rpc {
                code: err["code"].as_i64().unwrap_or(0),
                message: err["message"].as_str().unwrap_or_default().to_string(),
            });
        }
        Ok(message.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn post(&self, body: &Value) -> Result<String, McpError> {
        let session_id = self.state.read().await.session_id.clone();
        let mut req = self
            .http
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .timeout(self.request_timeout)
            .json(body);
        if let Some(sid) = &session_id {
            req = req.header(SESSION_HEADER, sid);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                McpError::Timeout(self.request_timeout)
            } else {
                McpError::Network(e.to_string())
            }
        })?;

        if session_id.is_none() {
            if let Some(sid) = response
                .headers()
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
                .filter(|s| !s.is_empty())
            {
                tracing::info!(session_id = sid, "MCP session established via HTTP");
                self.state.write().await.session_id = Some(sid.to_string());
            }
        }

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| McpError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(McpError::Http {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }

    /// 以当前缓存的工具列表构建注册表（名称规整为 provider 可接受的形式）
    pub async fn registry(self: &Arc<Self>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        let mut used = HashSet::new();
        for info in self.tools().await {
            let exposed = sanitize_tool_name(&info.name, &mut used);
            registry.register(McpTool {
                client: Arc::clone(self),
                exposed_name: exposed,
                description: info.llm_description(),
                info,
            });
        }
        registry
    }
}

/// 从 JSON 或 SSE 文本中取出 id 匹配的 JSON-RPC 消息
fn extract_message(text: &str, id: u64) -> Result<Value, McpError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(McpError::Protocol("empty response".to_string()));
    }
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Ok(v);
    }

    let mut first = None;
    for line in trimmed.lines() {
        let parsed = parse_line(line);
        let Some(data) = parsed.payload() else { continue };
        let Ok(v) = serde_json::from_str::<Value>(data) else { continue };
        if v["id"].as_u64() == Some(id) {
            return Ok(v);
        }
        first.get_or_insert(v);
    }
    first.ok_or_else(|| McpError::Protocol("no JSON-RPC message in response".to_string()))
}

/// 以 Tool trait 暴露的远端 MCP 工具
pub struct McpTool {
    client: Arc<McpClient>,
    exposed_name: String,
    description: String,
    info: McpToolInfo,
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.exposed_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.info.input_schema.clone()
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        let result = self
            .client
            .call_tool(&self.info.name, args)
            .await
            .map_err(|e| e.to_string())?;
        if result.is_error {
            let output = result.into_output();
            return Err(output.text);
        }
        Ok(result.into_output())
    }
}
