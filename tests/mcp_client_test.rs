//! MCP 客户端对接本地假服务端：会话头、SSE 帧响应、会话失效后的重连重试

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agui_gateway::config::McpSection;
use agui_gateway::tools::McpClient;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

#[derive(Default)]
struct FakeServer {
    /// (method, 请求携带的会话 id)
    seen: Mutex<Vec<(String, Option<String>)>>,
    sessions: AtomicUsize,
    expire_next_call: AtomicBool,
}

impl FakeServer {
    fn seen(&self) -> Vec<(String, Option<String>)> {
        self.seen.lock().unwrap().clone()
    }

    fn methods(&self) -> Vec<String> {
        self.seen().into_iter().map(|(m, _)| m).collect()
    }
}

fn session_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn reply(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

async fn handle_rpc(
    State(server): State<Arc<FakeServer>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let method = body["method"].as_str().unwrap_or_default().to_string();
    let session = session_of(&headers);
    server.seen.lock().unwrap().push((method.clone(), session.clone()));
    let id = body["id"].clone();

    match method.as_str() {
        "initialize" => {
            let n = server.sessions.fetch_add(1, Ordering::SeqCst) + 1;
            let result = reply(
                &id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fake", "version": "0.0.1"},
                }),
            );
            ([("mcp-session-id", format!("sess-{n}"))], Json(result)).into_response()
        }
        "notifications/initialized" => StatusCode::ACCEPTED.into_response(),
        _ if session.is_none() => (StatusCode::BAD_REQUEST, "missing session").into_response(),
        "tools/list" => {
            let result = reply(
                &id,
                json!({"tools": [
                    {
                        "name": "echo",
                        "description": "Echo text back",
                        "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}}
                    },
                    {"name": "fail", "title": "Always fails"}
                ]}),
            );
            // 以单帧 event-stream 返回
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                format!("event: message\ndata: {result}\n\n"),
            )
                .into_response()
        }
        "tools/call" => {
            if server.expire_next_call.swap(false, Ordering::SeqCst) {
                return (StatusCode::NOT_FOUND, "session expired").into_response();
            }
            let args = &body["params"]["arguments"];
            let result = match body["params"]["name"].as_str() {
                Some("echo") => json!({"content": [
                    {"type": "text", "text": format!("echo: {}", args["text"].as_str().unwrap_or_default())},
                    {"type": "resource", "resource": {"uri": "ui://echo/1", "mimeType": "text/html", "text": "<p>hi</p>"}}
                ]}),
                _ => json!({"content": [{"type": "text", "text": "bad input"}], "isError": true}),
            };
            Json(reply(&id, result)).into_response()
        }
        _ => Json(json!({
            "jsonrpc": "2.0", "id": id,
            "error": {"code": -32601, "message": "method not found"}
        }))
        .into_response(),
    }
}

async fn handle_delete(State(server): State<Arc<FakeServer>>, headers: HeaderMap) -> StatusCode {
    server
        .seen
        .lock()
        .unwrap()
        .push(("DELETE".to_string(), session_of(&headers)));
    StatusCode::NO_CONTENT
}

async fn spawn_server() -> (Arc<FakeServer>, String) {
    let server = Arc::new(FakeServer::default());
    let app = Router::new()
        .route("/mcp", post(handle_rpc).delete(handle_delete))
        .with_state(Arc::clone(&server));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (server, format!("http://{addr}/mcp"))
}

fn client(url: String) -> Arc<McpClient> {
    let config = McpSection {
        server_url: url,
        tool_call_timeout_ms: 5_000,
        ..McpSection::default()
    };
    Arc::new(McpClient::new(reqwest::Client::new(), &config))
}

#[tokio::test]
async fn test_connect_establishes_session_and_lists_tools() {
    let (server, url) = spawn_server().await;
    let client = client(url);

    assert!(client.connect_with_timeout(Duration::from_secs(5)).await);
    assert!(client.is_connected().await);
    assert_eq!(client.tool_count().await, 2);
    let tools = client.tools().await;
    assert_eq!(tools[0].name, "echo");
    assert_eq!(tools[0].input_schema["properties"]["text"]["type"], "string");
    assert_eq!(tools[1].input_schema["type"], "object");

    let seen = server.seen();
    assert_eq!(seen[0], ("initialize".to_string(), None));
    assert!(seen[1..]
        .iter()
        .all(|(_, sid)| sid.as_deref() == Some("sess-1")));
    assert_eq!(server.methods()[1..], ["notifications/initialized", "tools/list"]);
}

#[tokio::test]
async fn test_registry_executes_remote_tools() {
    let (_server, url) = spawn_server().await;
    let client = client(url);
    client.connect().await.unwrap();

    let registry = client.registry().await;
    assert_eq!(registry.tool_names().len(), 2);

    let output = registry.execute("echo", json!({"text": "hi"})).await.unwrap();
    assert_eq!(output.text, "echo: hi");
    assert_eq!(output.resources.len(), 1);
    assert_eq!(output.resources[0]["resource"]["uri"], "ui://echo/1");

    let err = registry.execute("fail", json!({})).await.unwrap_err();
    assert_eq!(err, "bad input");
}

#[tokio::test]
async fn test_expired_session_reconnects_once() {
    let (server, url) = spawn_server().await;
    let client = client(url);
    client.connect().await.unwrap();
    server.expire_next_call.store(true, Ordering::SeqCst);

    let result = client.call_tool("echo", json!({"text": "again"})).await.unwrap();
    assert!(!result.is_error);
    assert_eq!(result.into_output().text, "echo: again");

    let seen = server.seen();
    let delete = seen.iter().position(|(m, _)| m == "DELETE").expect("old session deleted");
    assert_eq!(seen[delete].1.as_deref(), Some("sess-1"));
    assert_eq!(seen[delete + 1], ("initialize".to_string(), None));
    assert_eq!(
        seen.last(),
        Some(&("tools/call".to_string(), Some("sess-2".to_string())))
    );
}

#[tokio::test]
async fn test_call_after_disconnect_reconnects() {
    let (server, url) = spawn_server().await;
    let client = client(url);
    client.connect().await.unwrap();
    client.disconnect().await;

    assert!(!client.is_connected().await);
    assert_eq!(server.methods().last().map(String::as_str), Some("DELETE"));

    let result = client.call_tool("echo", json!({"text": "back"})).await.unwrap();
    assert_eq!(result.into_output().text, "echo: back");
    assert!(client.is_connected().await);
    assert_eq!(server.sessions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unreachable_server_fails_softly() {
    let client = client("http://127.0.0.1:1/mcp".to_string());
    assert!(!client.connect_with_timeout(Duration::from_secs(5)).await);
    assert!(!client.is_connected().await);
    assert_eq!(client.tool_count().await, 0);
}
