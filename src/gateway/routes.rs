//! HTTP 路由
//!
//! - `POST /agent`：执行一次 run。会话没有活跃推送连接时直接以 SSE 返回事件流；
//!   有活跃连接时事件经由该连接推送，响应为 202
//! - `GET /events`：推送连接（长连接 SSE）
//! - `GET /health`、`GET /`：健康检查与服务信息
//! - `/scenarios`、`/sessions`：场景查询与回放、显式会话管理

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};

use super::connection::{ConnectionRegistry, PushTransport, MAX_BACKLOG};
use super::hub::AppState;
use super::runtime::StartedRun;
use crate::agents::EventStream;
use crate::config::SseSection;
use crate::core::GatewayError;
use crate::protocol::{Event, RunRequest};
use crate::scenario::{Scenario, ScenarioSummary};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/agent", post(run_agent))
        .route("/events", get(subscribe))
        .route("/scenarios", get(list_scenarios))
        .route("/scenarios/:id", get(get_scenario).post(run_scenario))
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionQuery {
    session_id: Option<String>,
}

impl SessionQuery {
    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref().filter(|s| !s.is_empty())
    }
}

/// 请求体为空时视为空 RunRequest（id 由网关生成）
fn parse_run_request(body: &Bytes) -> Result<RunRequest, GatewayError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RunRequest::new("", "", Vec::new()));
    }
    serde_json::from_slice(body)
        .map_err(|e| GatewayError::InvalidRequest(format!("malformed run request: {e}")))
}

/// POST /agent
async fn run_agent(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let request = parse_run_request(&body)?;
    let run = state.runtime.start_run(request, query.session_id())?;
    Ok(deliver(&state, run))
}

/// POST /scenarios/:id：忽略默认配置，回放指定场景
async fn run_scenario(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<SessionQuery>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let request = parse_run_request(&body)?;
    let run = state
        .runtime
        .start_scenario_run(&id, request, query.session_id())?;
    Ok(deliver(&state, run))
}

/// 有活跃推送连接走推送，否则直接以 SSE 响应
fn deliver(state: &Arc<AppState>, run: StartedRun) -> Response {
    let StartedRun {
        thread_id,
        run_id,
        session_id,
        agent,
        events,
    } = run;

    if state.connections.has_live(&session_id) {
        tracing::info!(%session_id, %run_id, agent, "delivering run via push connection");
        tokio::spawn(push_run(
            Arc::clone(&state.connections),
            session_id.clone(),
            events,
        ));
        let ack = json!({
            "threadId": thread_id,
            "runId": run_id,
            "sessionId": session_id,
            "delivery": "push",
        });
        return (StatusCode::ACCEPTED, Json(ack)).into_response();
    }

    sse_response(&state.config.sse, events).into_response()
}

/// 逐个推送事件；推送失败时丢弃事件流（即取消 Agent），并补记一个 RUN_ERROR 到积压队列
async fn push_run(connections: Arc<ConnectionRegistry>, session_id: String, mut events: EventStream) {
    loop {
        let event = match events.next().await {
            Some(event) => event,
            None => return,
        };
        let terminal = event.is_terminal();
        if let Err(e) = connections.push(&session_id, event).await {
            tracing::warn!(%session_id, error = %e, "push delivery failed, cancelling run");
            drop(events);
            if !terminal {
                let aborted = Event::run_error_with_code(
                    "Push connection closed during run",
                    "TRANSPORT_CLOSED",
                );
                let _ = connections.push(&session_id, aborted).await;
            }
            return;
        }
    }
}

fn sse_response(
    config: &SseSection,
    events: EventStream,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    Sse::new(sse_frames(config.retry(), events)).keep_alive(
        KeepAlive::new()
            .interval(config.heartbeat())
            .text("keepalive"),
    )
}

/// `retry:` 指令 + 每个事件一个 `data:` 帧
fn sse_frames(
    retry: Duration,
    events: impl Stream<Item = Event> + Send + 'static,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    async_stream::stream! {
        yield Ok(SseEvent::default().retry(retry));
        let mut events = Box::pin(events);
        while let Some(event) = events.next().await {
            match SseEvent::default().json_data(&event) {
                Ok(frame) => yield Ok(frame),
                Err(e) => tracing::error!(event = event.event_type(), error = %e, "failed to encode event"),
            }
        }
    }
}

/// 连接结束（客户端断开或被替换）时注销
struct Subscription {
    connections: Arc<ConnectionRegistry>,
    session_id: String,
    connection_id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.connections
            .unregister(&self.session_id, self.connection_id);
    }
}

/// GET /events?sessionId=...
async fn subscribe(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> Result<Response, GatewayError> {
    let session_id = query
        .session_id()
        .ok_or_else(|| GatewayError::InvalidRequest("sessionId is required".to_string()))?
        .to_string();
    let session = state.sessions.get_or_create(&session_id, Some(&session_id));

    let (transport, rx) = PushTransport::channel(MAX_BACKLOG);
    let closed = transport.closed_token();
    let connection_id = state.connections.register(&session.id, transport);
    tracing::info!(session_id = %session.id, connection_id, "push connection opened");

    let subscription = Subscription {
        connections: Arc::clone(&state.connections),
        session_id: session.id,
        connection_id,
    };
    let events = async_stream::stream! {
        let _subscription = subscription;
        let mut rx = rx;
        loop {
            let next = tokio::select! {
                _ = closed.cancelled() => None,
                event = rx.recv() => event,
            };
            match next {
                Some(event) => yield event,
                None => break,
            }
        }
    };

    Ok(Sse::new(sse_frames(state.config.sse.retry(), events))
        .keep_alive(
            KeepAlive::new()
                .interval(state.config.sse.heartbeat())
                .text("keepalive"),
        )
        .into_response())
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mcp = match &state.mcp {
        Some(client) => json!({
            "enabled": true,
            "connected": client.is_connected().await,
            "serverUrl": client.server_url(),
            "toolCount": client.tool_count().await,
        }),
        None => json!({ "enabled": false }),
    };
    let a2ui = match &state.bridge {
        Some(bridge) => json!({
            "enabled": true,
            "serverUrl": bridge.base_url(),
            "reachable": bridge.is_reachable().await,
        }),
        None => json!({ "enabled": false }),
    };

    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime": state.started_at.elapsed().as_secs(),
        "sessions": state.sessions.len(),
        "sseConnections": state.connections.len(),
        "mcp": mcp,
        "a2ui": a2ui,
    }))
}

/// GET /
async fn index(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "startedAt": state.started_at_utc.to_rfc3339(),
        "agentMode": config.agent.mode,
        "extensionMode": config.extension.mode,
        "defaultScenario": config.agent.default_scenario,
        "endpoints": {
            "agent": "POST /agent?sessionId=<id>",
            "events": "GET /events?sessionId=<id>",
            "health": "GET /health",
            "scenarios": "GET /scenarios",
            "scenario": "GET|POST /scenarios/:id",
            "sessions": "GET|POST /sessions",
            "session": "GET|DELETE /sessions/:id",
        },
    }))
}

/// GET /scenarios
async fn list_scenarios(State(state): State<Arc<AppState>>) -> Json<Vec<ScenarioSummary>> {
    Json(state.scenarios.list())
}

/// GET /scenarios/:id
async fn get_scenario(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Scenario>, GatewayError> {
    state
        .scenarios
        .get(&id)
        .map(|s| Json(s.as_ref().clone()))
        .ok_or(GatewayError::ScenarioNotFound(id))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody {
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

/// GET /sessions
async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "sessions": state.sessions.list() }))
}

/// POST /sessions
async fn create_session(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let body: CreateSessionBody = if body.iter().all(u8::is_ascii_whitespace) {
        CreateSessionBody {
            thread_id: None,
            session_id: None,
        }
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| GatewayError::InvalidRequest(format!("malformed session request: {e}")))?
    };
    let thread_id = body
        .thread_id
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("thread_{}", uuid::Uuid::new_v4()));
    let session = state
        .sessions
        .get_or_create(&thread_id, body.session_id.as_deref());
    Ok((StatusCode::CREATED, Json(session.info())).into_response())
}

/// GET /sessions/:id
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    let session = state
        .sessions
        .get(&id)
        .ok_or_else(|| GatewayError::SessionNotFound(id.clone()))?;
    Ok(Json(json!({
        "session": session.info(),
        "messages": session.messages,
        "connected": state.connections.has_live(&id),
    })))
}

/// DELETE /sessions/:id
async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    if !state.sessions.delete(&id) {
        return Err(GatewayError::SessionNotFound(id));
    }
    state.connections.remove_session(&id);
    tracing::info!(session_id = %id, "session deleted");
    Ok(StatusCode::NO_CONTENT)
}
