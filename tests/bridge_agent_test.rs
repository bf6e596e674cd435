//! BridgeAgent 对接本地 surface 服务：逐行转发、畸形行跳过、上游错误与超时；
//! 以及 LlmAgent 的 surface 渲染工具（generateA2UI）经同一上游转发

use std::sync::{Arc, Mutex};
use std::time::Duration;

use agui_gateway::agents::{guarded, Agent, BridgeAgent, LlmAgent};
use agui_gateway::bridge::SurfaceBridgeClient;
use agui_gateway::config::{A2uiSection, LlmSection};
use agui_gateway::llm::{ChatChunk, Scripted, ScriptedBackend};
use agui_gateway::protocol::{Event, Message, RunRequest};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures_util::StreamExt;
use serde_json::{json, Value};

const SURFACE_STREAM: &str = concat!(
    "data: {\"beginRendering\":{\"surfaceId\":\"main\",\"root\":\"root\"}}\n\n",
    "data: {\"surfaceUpdate\":{\"surfaceId\":\"main\",\"components\":[{\"id\":\"root\"}]}}\n\n",
    "data: {oops\n\n",
    ": keepalive\n\n",
    "{\"dataModelUpdate\":{\"surfaceId\":\"main\",\"contents\":[]}}\n",
    "data: {\"deleteSurface\":{\"surfaceId\":\"main\"}}\n\n",
    "data: [DONE]\n\n",
);

#[derive(Clone, Copy)]
enum Upstream {
    Stream,
    Fail,
    Stall,
}

struct FakeSurface {
    mode: Upstream,
    requests: Mutex<Vec<Value>>,
}

async fn handle_agent(State(server): State<Arc<FakeSurface>>, Json(body): Json<Value>) -> Response {
    server.requests.lock().unwrap().push(body);
    match server.mode {
        Upstream::Stream => SURFACE_STREAM.into_response(),
        Upstream::Fail => (StatusCode::INTERNAL_SERVER_ERROR, "agent crashed").into_response(),
        Upstream::Stall => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            StatusCode::OK.into_response()
        }
    }
}

async fn spawn_upstream(mode: Upstream) -> (Arc<FakeSurface>, String) {
    let server = Arc::new(FakeSurface {
        mode,
        requests: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/agent", post(handle_agent))
        .with_state(Arc::clone(&server));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (server, format!("http://{addr}/"))
}

fn bridge_client(url: String, timeout_ms: u64) -> SurfaceBridgeClient {
    let config = A2uiSection {
        server_url: url,
        timeout_ms,
        ..A2uiSection::default()
    };
    SurfaceBridgeClient::new(reqwest::Client::new(), &config)
}

fn bridge_agent(url: String, timeout_ms: u64) -> BridgeAgent {
    BridgeAgent::new(bridge_client(url, timeout_ms))
}

/// 第一轮调用 generateA2UI，第二轮给出文字回复
fn render_then_answer() -> Arc<ScriptedBackend> {
    Arc::new(ScriptedBackend::new([
        Scripted::Reply(vec![ChatChunk::tool_call(
            0,
            Some("call_ui"),
            Some("generateA2UI"),
            Some(r#"{"message":"a booking form"}"#),
        )]),
        ScriptedBackend::text_reply(&["Here is your form."]),
    ]))
}

async fn run(agent: &impl Agent, request: RunRequest) -> Vec<Event> {
    let (thread_id, run_id) = (request.thread_id.clone(), request.run_id.clone());
    guarded(agent.run(request), thread_id, run_id).collect().await
}

fn request(text: &str) -> RunRequest {
    RunRequest::new("thread-s", "run-s", vec![Message::user(text)])
}

#[tokio::test]
async fn test_each_payload_becomes_one_custom_event() {
    let (server, url) = spawn_upstream(Upstream::Stream).await;
    let agent = bridge_agent(url, 5_000);

    let mut req = request("show me a booking form");
    req.forwarded_props = json!({"surfaceId": "booking"});
    let events = run(&agent, req).await;

    assert!(matches!(events.first(), Some(Event::RunStarted { .. })));
    assert!(matches!(events.last(), Some(Event::RunFinished { .. })));

    let kinds: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            Event::Custom { name, value } if name == "a2ui" => {
                assert_eq!(value["sessionId"], "thread-s");
                assert_eq!(value["a2uiPayloads"].as_array().map(Vec::len), Some(1));
                value["a2uiPayloads"][0]["type"].as_str().map(str::to_string)
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        kinds,
        ["beginRendering", "surfaceUpdate", "dataModelUpdate", "deleteSurface"]
    );
    assert_eq!(events.len(), 6);

    let sent = server.requests.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["message"]["prompt"]["text"], "show me a booking form");
    assert_eq!(sent[0]["metadata"]["surfaceId"], "booking");
    assert_eq!(sent[0]["metadata"]["threadId"], "thread-s");
}

#[tokio::test]
async fn test_upstream_failure_ends_with_run_error() {
    let (_server, url) = spawn_upstream(Upstream::Fail).await;
    let agent = bridge_agent(url, 5_000);

    let events = run(&agent, request("hi")).await;
    assert_eq!(events.len(), 2);
    match &events[1] {
        Event::RunError { message, code } => {
            assert_eq!(code.as_deref(), Some("A2UI_ERROR"));
            assert!(message.contains("500"), "{message}");
        }
        other => panic!("expected RunError, got {other:?}"),
    }
}

#[tokio::test]
async fn test_exchange_timeout() {
    let (_server, url) = spawn_upstream(Upstream::Stall).await;
    let agent = bridge_agent(url, 200);

    let events = tokio::time::timeout(Duration::from_secs(10), run(&agent, request("hi")))
        .await
        .expect("bridge exchange not bounded");
    assert!(matches!(
        events.last(),
        Some(Event::RunError { message, .. }) if message.contains("timed out")
    ));
}

#[tokio::test]
async fn test_cancel_stops_waiting_on_upstream() {
    let (_server, url) = spawn_upstream(Upstream::Stall).await;
    let agent = Arc::new(bridge_agent(url, 60_000));

    let canceller = Arc::clone(&agent);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let events = tokio::time::timeout(Duration::from_secs(10), run(agent.as_ref(), request("hi")))
        .await
        .expect("cancel ignored");
    assert!(matches!(
        events.last(),
        Some(Event::RunError { code, .. }) if code.as_deref() == Some("CANCELLED")
    ));
}

fn render_results(events: &[Event]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::ToolCallResult {
                tool_call_id,
                content,
                ..
            } if tool_call_id == "call_ui" => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_llm_render_tool_streams_surface_then_continues() {
    let (server, url) = spawn_upstream(Upstream::Stream).await;
    let backend = render_then_answer();
    let agent = LlmAgent::new(backend.clone(), &LlmSection::default())
        .with_bridge(bridge_client(url, 5_000));

    let events = run(&agent, request("I need to book a table")).await;
    let types: Vec<&str> = events.iter().map(Event::event_type).collect();
    assert_eq!(
        types,
        [
            "RUN_STARTED",
            "TOOL_CALL_START",
            "TOOL_CALL_ARGS",
            "TOOL_CALL_END",
            "CUSTOM",
            "CUSTOM",
            "CUSTOM",
            "CUSTOM",
            "TOOL_CALL_RESULT",
            "TEXT_MESSAGE_START",
            "TEXT_MESSAGE_CHUNK",
            "TEXT_MESSAGE_END",
            "RUN_FINISHED",
        ]
    );
    assert_eq!(render_results(&events), ["Generated interactive UI"]);
    assert_eq!(backend.calls(), 2);

    let first = &backend.requests()[0];
    assert!(first.tools.iter().any(|t| t.function.name == "generateA2UI"));
    let second = &backend.requests()[1];
    let tool_msg = second
        .messages
        .iter()
        .find(|m| m.role == "tool")
        .expect("render result sent back to the model");
    assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_ui"));

    let sent = server.requests.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["message"]["prompt"]["text"], "a booking form");
}

#[tokio::test]
async fn test_llm_render_tool_upstream_failure_becomes_tool_error() {
    let (_server, url) = spawn_upstream(Upstream::Fail).await;
    let backend = render_then_answer();
    let agent = LlmAgent::new(backend.clone(), &LlmSection::default())
        .with_bridge(bridge_client(url, 5_000));

    let events = run(&agent, request("I need to book a table")).await;
    assert!(!events.iter().any(|e| matches!(e, Event::Custom { .. })));

    let results = render_results(&events);
    assert_eq!(results.len(), 1);
    assert!(results[0].starts_with("[Tool Error] generateA2UI:"), "{}", results[0]);
    assert!(matches!(events.last(), Some(Event::RunFinished { .. })));
    assert_eq!(backend.calls(), 2);
}
