//! OpenAI 兼容客户端对接本地假 completion 服务：SSE 增量帧、tool_call 片段、状态码重试

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agui_gateway::llm::{
    ChatChunk, ChatMessage, ChatRequest, CompletionBackend, LlmError, OpenAiCompatClient,
    RetryConfig, RetryingBackend,
};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures_util::StreamExt;
use serde_json::{json, Value};

struct FakeCompletions {
    /// 前 N 次请求返回 503
    fail_first: usize,
    calls: AtomicUsize,
    bodies: std::sync::Mutex<Vec<Value>>,
}

fn frame(delta: Value) -> String {
    let chunk = json!({
        "id": "chatcmpl-1",
        "object": "chat.completion.chunk",
        "created": 1_700_000_000,
        "model": "deepseek-chat",
        "choices": [{"index": 0, "delta": delta, "finish_reason": null}]
    });
    format!("data: {chunk}\n\n")
}

async fn completions(State(server): State<Arc<FakeCompletions>>, Json(body): Json<Value>) -> Response {
    let n = server.calls.fetch_add(1, Ordering::SeqCst);
    server.bodies.lock().unwrap().push(body);
    if n < server.fail_first {
        return (StatusCode::SERVICE_UNAVAILABLE, "upstream overloaded").into_response();
    }
    let mut stream = String::new();
    stream.push_str(&frame(json!({"role": "assistant", "content": "Checking"})));
    stream.push_str(&frame(json!({"tool_calls": [{
        "index": 0, "id": "call_1", "type": "function",
        "function": {"name": "lookup", "arguments": "{\"q\":"}
    }]})));
    stream.push_str(&frame(json!({"tool_calls": [{"index": 0, "function": {"arguments": "1}"}}]})));
    stream.push_str("data: [DONE]\n\n");
    ([(header::CONTENT_TYPE, "text/event-stream")], stream).into_response()
}

async fn spawn_server(fail_first: usize) -> (Arc<FakeCompletions>, String) {
    let server = Arc::new(FakeCompletions {
        fail_first,
        calls: AtomicUsize::new(0),
        bodies: std::sync::Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/v1/chat/completions", post(completions))
        .with_state(Arc::clone(&server));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (server, format!("http://{addr}/v1"))
}

fn client(endpoint: String) -> OpenAiCompatClient {
    OpenAiCompatClient::new(reqwest::Client::new(), endpoint, "sk-test", Duration::from_secs(5))
}

fn request() -> ChatRequest {
    ChatRequest {
        model: "deepseek-chat".into(),
        messages: vec![ChatMessage::system("be brief"), ChatMessage::user("look it up")],
        tools: Vec::new(),
        stream: true,
        temperature: 0.7,
    }
}

async fn collect(backend: &dyn CompletionBackend) -> Vec<ChatChunk> {
    let stream = backend.stream_chat(&request()).await.unwrap();
    stream.map(|chunk| chunk.unwrap()).collect().await
}

#[tokio::test]
async fn test_streams_text_and_tool_call_fragments() {
    let (server, endpoint) = spawn_server(0).await;
    let chunks = collect(&client(endpoint)).await;

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].delta().unwrap().content.as_deref(), Some("Checking"));

    let first = &chunks[1].delta().unwrap().tool_calls[0];
    assert_eq!(first.index, 0);
    assert_eq!(first.id.as_deref(), Some("call_1"));
    let function = first.function.as_ref().unwrap();
    assert_eq!(function.name.as_deref(), Some("lookup"));
    assert_eq!(function.arguments.as_deref(), Some("{\"q\":"));

    let second = &chunks[2].delta().unwrap().tool_calls[0];
    assert!(second.id.is_none());
    assert_eq!(second.function.as_ref().unwrap().arguments.as_deref(), Some("1}"));

    let sent = server.bodies.lock().unwrap().clone();
    assert_eq!(sent[0]["model"], "deepseek-chat");
    assert_eq!(sent[0]["stream"], true);
    assert_eq!(sent[0]["messages"][1]["content"], "look it up");
}

#[tokio::test]
async fn test_server_error_is_retryable_status() {
    let (_server, endpoint) = spawn_server(usize::MAX).await;
    let err = client(endpoint).stream_chat(&request()).await.err().unwrap();
    assert!(matches!(err, LlmError::Status { status: 503, .. }), "{err:?}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_retrying_backend_recovers_from_transient_503() {
    let (server, endpoint) = spawn_server(1).await;
    let retrying = RetryingBackend::new(
        Arc::new(client(endpoint)),
        RetryConfig {
            max_retries: 2,
            delay: Duration::from_millis(10),
        },
    );

    let chunks = collect(&retrying).await;
    assert_eq!(chunks.len(), 3);
    assert_eq!(server.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unreachable_endpoint_is_network_error() {
    let err = client("http://127.0.0.1:1/v1".to_string())
        .stream_chat(&request())
        .await
        .err()
        .unwrap();
    assert!(err.is_retryable(), "{err:?}");
}
