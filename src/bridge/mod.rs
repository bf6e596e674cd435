//! A2UI surface 协议桥接
//!
//! 把用户文本以 A2A Message 形式 POST 到 `<server_url>/agent`，读取返回的逐行流
//! （`data: {json}` SSE 帧或裸 NDJSON），每行映射为四种 surface 消息之一，
//! 再原样包装成一个 AG-UI `CUSTOM` 事件转发（不合并、不缓冲）。

use std::pin::Pin;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::config::A2uiSection;
use crate::protocol::{Event, RunRequest, SseLine, SseLineStream};

/// CUSTOM 事件名
pub const A2UI_EVENT_NAME: &str = "a2ui";

const AGENT_PATH: &str = "/agent";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("A2UI server error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("A2UI server unreachable: {0}")]
    Network(String),

    #[error("A2UI exchange timed out after {0:?}")]
    Timeout(Duration),
}

/// surface 消息种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SurfaceKind {
    BeginRendering,
    SurfaceUpdate,
    DataModelUpdate,
    DeleteSurface,
}

impl SurfaceKind {
    pub const ALL: [SurfaceKind; 4] = [
        SurfaceKind::BeginRendering,
        SurfaceKind::SurfaceUpdate,
        SurfaceKind::DataModelUpdate,
        SurfaceKind::DeleteSurface,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SurfaceKind::BeginRendering => "beginRendering",
            SurfaceKind::SurfaceUpdate => "surfaceUpdate",
            SurfaceKind::DataModelUpdate => "dataModelUpdate",
            SurfaceKind::DeleteSurface => "deleteSurface",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

/// 线上载荷 `{type, payload}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfacePayload {
    #[serde(rename = "type")]
    pub kind: SurfaceKind,
    pub payload: Value,
}

impl SurfacePayload {
    /// 从上游消息映射：`{"surfaceUpdate": {...}}`，也接受已是 `{type, payload}` 的形态
    pub fn from_message(obj: &Value) -> Option<Self> {
        let map = obj.as_object()?;
        for kind in SurfaceKind::ALL {
            if let Some(payload) = map.get(kind.as_str()).filter(|v| v.is_object()) {
                return Some(Self {
                    kind,
                    payload: payload.clone(),
                });
            }
        }
        let kind = map.get("type").and_then(Value::as_str).and_then(SurfaceKind::parse)?;
        let payload = map.get("payload").filter(|v| v.is_object())?.clone();
        Some(Self { kind, payload })
    }
}

/// 解析一行上游输出；非数据行、畸形行、未知消息返回 None（畸形行记 warn）
pub fn parse_surface_line(line: &SseLine) -> Option<SurfacePayload> {
    let text = line.payload()?.trim();
    if text.is_empty() || text == "[DONE]" {
        return None;
    }
    let obj: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, line = %truncate(text, 200), "A2UI: skip malformed line");
            return None;
        }
    };
    let payload = SurfacePayload::from_message(&obj);
    if payload.is_none() {
        tracing::debug!(line = %truncate(text, 200), "A2UI: skip unmapped message");
    }
    payload
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}

/// 包装为 AG-UI CUSTOM 事件：每个载荷独立一个事件
pub fn surface_event(session_id: &str, payload: SurfacePayload) -> Event {
    Event::custom(
        A2UI_EVENT_NAME,
        json!({
            "sessionId": session_id,
            "a2uiPayloads": [payload],
        }),
    )
}

/// 一次桥接请求
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BridgeRequest {
    pub message: String,
    pub thread_id: String,
    pub run_id: String,
    pub surface_id: Option<String>,
    /// 透传到 metadata 的客户端能力等字段
    pub metadata: Map<String, Value>,
}

impl BridgeRequest {
    /// 从 run 输入提取：最近用户文本 + forwardedProps 中的 surfaceId / a2uiClientCapabilities
    pub fn from_run(request: &RunRequest, message: impl Into<String>) -> Self {
        let mut metadata = Map::new();
        if let Some(caps) = request.forwarded_value("a2uiClientCapabilities") {
            metadata.insert("a2uiClientCapabilities".to_string(), caps.clone());
        }
        Self {
            message: message.into(),
            thread_id: request.thread_id.clone(),
            run_id: request.run_id.clone(),
            surface_id: request.forwarded_str("surfaceId").map(str::to_string),
            metadata,
        }
    }

    /// A2A Message 请求体
    pub fn to_body(&self, default_surface_id: &str) -> Value {
        let mut metadata = self.metadata.clone();
        metadata.insert(
            "surfaceId".to_string(),
            Value::String(
                self.surface_id
                    .clone()
                    .unwrap_or_else(|| default_surface_id.to_string()),
            ),
        );
        metadata.insert("threadId".to_string(), Value::String(self.thread_id.clone()));
        metadata.insert("runId".to_string(), Value::String(self.run_id.clone()));
        json!({
            "metadata": metadata,
            "message": { "prompt": { "text": self.message } },
        })
    }
}

pub type PayloadStream = Pin<Box<dyn Stream<Item = Result<SurfacePayload, BridgeError>> + Send>>;

/// surface 服务客户端
#[derive(Debug, Clone)]
pub struct SurfaceBridgeClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    default_surface_id: String,
}

impl SurfaceBridgeClient {
    pub fn new(http: reqwest::Client, config: &A2uiSection) -> Self {
        Self {
            http,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            timeout: config.timeout(),
            default_surface_id: config.default_surface_id.clone(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn agent_url(&self) -> String {
        format!("{}{}", self.base_url, AGENT_PATH)
    }

    /// 发起交换并逐条产出载荷。整个交换受 `timeout` 约束，超时后丢弃仍在读的响应（即中止连接）。
    /// 出错时产出一个 `Err` 后结束。
    pub fn stream_payloads(&self, request: BridgeRequest) -> PayloadStream {
        let http = self.http.clone();
        let url = self.agent_url();
        let timeout = self.timeout;
        let body = request.to_body(&self.default_surface_id);

        Box::pin(async_stream::stream! {
            let deadline = tokio::time::Instant::now() + timeout;
            tracing::debug!(%url, thread_id = %request.thread_id, "A2UI: sending request");

            let send = http.post(&url).json(&body).send();
            let response = match tokio::time::timeout_at(deadline, send).await {
                Err(_) => {
                    yield Err(BridgeError::Timeout(timeout));
                    return;
                }
                Ok(Err(e)) => {
                    yield Err(BridgeError::Network(e.to_string()));
                    return;
                }
                Ok(Ok(response)) => response,
            };

            let status = response.status();
            if !status.is_success() {
                let body = tokio::time::timeout_at(deadline, response.text())
                    .await
                    .ok()
                    .and_then(Result::ok)
                    .unwrap_or_default();
                yield Err(BridgeError::Status { status: status.as_u16(), body });
                return;
            }

            let mut lines = SseLineStream::new(Box::pin(response.bytes_stream()));
            loop {
                let next = match tokio::time::timeout_at(deadline, lines.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        yield Err(BridgeError::Timeout(timeout));
                        return;
                    }
                };
                match next {
                    None => break,
                    Some(Err(e)) => {
                        yield Err(BridgeError::Network(e.to_string()));
                        return;
                    }
                    Some(Ok(line)) => {
                        if let Some(payload) = parse_surface_line(&line) {
                            yield Ok(payload);
                        }
                    }
                }
            }
        })
    }

    /// 健康检查用：服务是否可达（任何 HTTP 响应都算可达）
    pub async fn is_reachable(&self) -> bool {
        self.http
            .get(&self.base_url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .is_ok()
    }
}
