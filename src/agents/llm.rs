//! LLM 工具编排 Agent
//!
//! 显式的有界状态机：
//!
//! ```text
//! Thinking ──(回复含 tool_calls)──▶ AwaitingToolResults ──(未到 max_rounds)──▶ Thinking
//!    │                                      │
//!    └──(无 tool_calls)──▶ Done ◀──(到达 max_rounds)
//! 任一阶段出错 / 取消 / 超出 run 预算 ──▶ Failed
//! ```
//!
//! Thinking：把 system prompt + 对话 + 工具定义发给后端，文本增量流为 TEXT_MESSAGE_CHUNK，
//! tool_call 增量按 index 组装并流为 TOOL_CALL_START / ARGS / END。
//! AwaitingToolResults：流结束后按顺序执行工具，结果作为 TOOL_CALL_RESULT 发出并写回对话。
//! 工具失败或超时不终止 run，而是合成 `[Tool Error]` 结果让模型下一轮自行处理。

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agents::{Agent, EventStream};
use crate::bridge::{surface_event, BridgeRequest, SurfaceBridgeClient};
use crate::config::LlmSection;
use crate::core::GatewayError;
use crate::llm::{
    ChatFunctionCall, ChatMessage, ChatRequest, ChatTool, ChatToolCall, CompletionBackend,
    ToolCallDelta,
};
use crate::protocol::{generate_message_id, Event, Message, Role, RunRequest};
use crate::tools::schema::RENDER_SURFACE_DESCRIPTION;
use crate::tools::{
    render_surface_parameters, McpClient, RenderSurfaceArgs, ToolExecutor, ToolRegistry,
    RENDER_SURFACE_TOOL,
};

/// MCP 工具返回的 UI 资源对应的 CUSTOM 事件名
pub const MCP_UI_RESOURCE_EVENT: &str = "mcp-ui-resource";

const RENDER_SURFACE_ACK: &str = "Generated interactive UI";
const CONTEXT_PREVIEW_LIMIT: usize = 200;
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// 编排循环的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Thinking,
    AwaitingToolResults,
    Done,
    Failed,
}

/// 服务端可执行的外部工具来源
#[derive(Clone, Default)]
pub enum ExternalTools {
    #[default]
    None,
    /// 固定的注册表
    Registry(ToolRegistry),
    /// 每次 run 开始时从 MCP 客户端的工具缓存构建
    Mcp(Arc<McpClient>),
}

impl ExternalTools {
    async fn resolve(&self) -> ToolRegistry {
        match self {
            ExternalTools::None => ToolRegistry::new(),
            ExternalTools::Registry(registry) => registry.clone(),
            ExternalTools::Mcp(client) => {
                if client.is_connected().await {
                    client.registry().await
                } else {
                    tracing::warn!(
                        server_id = client.server_id(),
                        "MCP client not connected, running without external tools"
                    );
                    ToolRegistry::new()
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
struct LoopSettings {
    model: String,
    temperature: f32,
    system_prompt: String,
    max_rounds: usize,
    run_timeout: Duration,
}

pub struct LlmAgent {
    backend: Arc<dyn CompletionBackend>,
    settings: Arc<LoopSettings>,
    tools: ExternalTools,
    tool_timeout: Duration,
    bridge: Option<SurfaceBridgeClient>,
    cancel: CancellationToken,
}

impl LlmAgent {
    /// `backend` 通常是包了一层 RetryingBackend 的 OpenAiCompatClient
    pub fn new(backend: Arc<dyn CompletionBackend>, config: &LlmSection) -> Self {
        Self {
            backend,
            settings: Arc::new(LoopSettings {
                model: config.model.clone(),
                temperature: config.temperature,
                system_prompt: config.system_prompt.clone(),
                max_rounds: config.max_rounds.max(1),
                run_timeout: config.run_timeout(),
            }),
            tools: ExternalTools::None,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            bridge: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_external_tools(mut self, tools: ExternalTools, call_timeout: Duration) -> Self {
        self.tools = tools;
        self.tool_timeout = call_timeout;
        self
    }

    /// 开启 surface 渲染工具
    pub fn with_bridge(mut self, bridge: SurfaceBridgeClient) -> Self {
        self.bridge = Some(bridge);
        self
    }
}

impl Agent for LlmAgent {
    fn name(&self) -> &'static str {
        "llm"
    }

    fn run(&self, request: RunRequest) -> EventStream {
        let backend = Arc::clone(&self.backend);
        let settings = Arc::clone(&self.settings);
        let tools = self.tools.clone();
        let tool_timeout = self.tool_timeout;
        let bridge = self.bridge.clone();
        let cancel = self.cancel.clone();

        Box::pin(async_stream::stream! {
            let thread_id = request.thread_id.clone();
            let run_id = request.run_id.clone();
            yield Event::run_started(thread_id.clone(), run_id.clone());

            let deadline = Instant::now() + settings.run_timeout;
            let executor = ToolExecutor::new(tools.resolve().await, tool_timeout);
            let chat_tools = collect_chat_tools(executor.registry(), bridge.is_some());
            let mut messages = build_chat_messages(&settings.system_prompt, &request);
            let mut used_ids: HashSet<String> = HashSet::new();
            let mut pending: Vec<PendingCall> = Vec::new();
            let mut phase = LoopPhase::Thinking;
            let mut round = 0usize;

            tracing::info!(
                thread_id = %thread_id,
                run_id = %run_id,
                model = %settings.model,
                messages = request.messages.len(),
                tools = chat_tools.len(),
                "running LLM agent"
            );

            'run: loop {
                match phase {
                    LoopPhase::Thinking => {
                        round += 1;
                        let chat_request = ChatRequest {
                            model: settings.model.clone(),
                            messages: messages.clone(),
                            tools: chat_tools.clone(),
                            stream: true,
                            temperature: settings.temperature,
                        };

                        let mut chunks = match bounded(&cancel, deadline, backend.stream_chat(&chat_request)).await {
                            Ok(Ok(chunks)) => chunks,
                            Ok(Err(e)) => {
                                tracing::error!(thread_id = %thread_id, run_id = %run_id, round, error = %e, "LLM request failed");
                                yield Event::run_error_with_code(format!("LLM request failed: {e}"), "LLM_ERROR");
                                phase = LoopPhase::Failed;
                                continue 'run;
                            }
                            Err(interrupt) => {
                                yield interrupt.into_event(settings.run_timeout);
                                phase = LoopPhase::Failed;
                                continue 'run;
                            }
                        };

                        let message_id = generate_message_id();
                        let mut assembler = CallAssembler::new(message_id.clone());
                        let mut text = String::new();
                        loop {
                            let chunk = match bounded(&cancel, deadline, chunks.next()).await {
                                Ok(None) => break,
                                Ok(Some(Ok(chunk))) => chunk,
                                Ok(Some(Err(e))) => {
                                    tracing::error!(thread_id = %thread_id, run_id = %run_id, round, error = %e, "LLM stream failed");
                                    yield Event::run_error_with_code(format!("LLM stream failed: {e}"), "LLM_ERROR");
                                    phase = LoopPhase::Failed;
                                    continue 'run;
                                }
                                Err(interrupt) => {
                                    yield interrupt.into_event(settings.run_timeout);
                                    phase = LoopPhase::Failed;
                                    continue 'run;
                                }
                            };

                            if let Some(delta) = chunk.delta() {
                                if let Some(content) = delta.content.as_deref().filter(|c| !c.is_empty()) {
                                    if text.is_empty() {
                                        yield Event::TextMessageStart {
                                            message_id: message_id.clone(),
                                            role: "assistant".to_string(),
                                        };
                                    }
                                    text.push_str(content);
                                    yield Event::text_chunk(message_id.clone(), content);
                                }
                                for fragment in &delta.tool_calls {
                                    for event in assembler.push(fragment, &mut used_ids) {
                                        yield event;
                                    }
                                }
                            }
                        }

                        let (end, calls) = assembler.finish();
                        if let Some(end) = end {
                            yield end;
                        }
                        if !text.is_empty() {
                            yield Event::TextMessageEnd { message_id: message_id.clone() };
                        }
                        messages.push(assistant_message(&text, &calls));
                        tracing::debug!(round, text_len = text.len(), tool_calls = calls.len(), "LLM round complete");

                        if calls.is_empty() {
                            phase = LoopPhase::Done;
                        } else {
                            pending = calls;
                            phase = LoopPhase::AwaitingToolResults;
                        }
                    }

                    LoopPhase::AwaitingToolResults => {
                        for call in std::mem::take(&mut pending) {
                            let mut resources: Vec<Value> = Vec::new();
                            let render_bridge = bridge.as_ref().filter(|_| call.name == RENDER_SURFACE_TOOL);

                            let content = if let Some(bridge) = render_bridge {
                                let args = RenderSurfaceArgs::parse(&call.arguments);
                                let prompt = if args.message.trim().is_empty() {
                                    request.latest_user_text().unwrap_or_default().to_string()
                                } else {
                                    args.message
                                };
                                let mut payloads = bridge.stream_payloads(BridgeRequest::from_run(&request, prompt));
                                let mut failure: Option<String> = None;
                                loop {
                                    match bounded(&cancel, deadline, payloads.next()).await {
                                        Ok(None) => break,
                                        Ok(Some(Ok(payload))) => {
                                            yield surface_event(&thread_id, payload);
                                        }
                                        Ok(Some(Err(e))) => {
                                            tracing::warn!(tool_call_id = %call.id, error = %e, "render surface tool failed");
                                            failure = Some(e.to_string());
                                            break;
                                        }
                                        Err(interrupt) => {
                                            yield interrupt.into_event(settings.run_timeout);
                                            phase = LoopPhase::Failed;
                                            continue 'run;
                                        }
                                    }
                                }
                                match failure {
                                    Some(reason) => tool_error(&call.name, reason),
                                    None => RENDER_SURFACE_ACK.to_string(),
                                }
                            } else if executor.registry().contains(&call.name) {
                                match parse_arguments(&call.arguments) {
                                    Err(reason) => tool_error(&call.name, reason),
                                    Ok(args) => match bounded(&cancel, deadline, executor.execute(&call.name, args)).await {
                                        Ok(Ok(output)) => {
                                            resources = output.resources;
                                            output.text
                                        }
                                        Ok(Err(e)) => {
                                            tracing::warn!(tool = %call.name, tool_call_id = %call.id, error = %e, "tool execution failed");
                                            tool_error(&call.name, failure_reason(e))
                                        }
                                        Err(interrupt) => {
                                            yield interrupt.into_event(settings.run_timeout);
                                            phase = LoopPhase::Failed;
                                            continue 'run;
                                        }
                                    },
                                }
                            } else {
                                tracing::warn!(tool = %call.name, "model called an unknown tool");
                                tool_error(&call.name, "unknown tool")
                            };

                            yield Event::ToolCallResult {
                                message_id: generate_message_id(),
                                tool_call_id: call.id.clone(),
                                content: content.clone(),
                                role: "tool".to_string(),
                            };
                            for resource in resources {
                                yield Event::custom(MCP_UI_RESOURCE_EVENT, resource);
                            }
                            messages.push(ChatMessage::tool(call.id.clone(), content));
                        }

                        if round >= settings.max_rounds {
                            tracing::warn!(
                                thread_id = %thread_id,
                                max_rounds = settings.max_rounds,
                                "max tool rounds reached, finishing with the text produced so far"
                            );
                            phase = LoopPhase::Done;
                        } else {
                            phase = LoopPhase::Thinking;
                        }
                    }

                    LoopPhase::Done => {
                        yield Event::run_finished(thread_id.clone(), run_id.clone());
                        break 'run;
                    }

                    LoopPhase::Failed => break 'run,
                }
            }

            tracing::info!(thread_id = %thread_id, run_id = %run_id, rounds = round, ?phase, "LLM agent finished");
        })
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// 打断一次等待的原因
enum Interrupt {
    Cancelled,
    TimedOut,
}

impl Interrupt {
    fn into_event(self, budget: Duration) -> Event {
        match self {
            Interrupt::Cancelled => Event::run_error_with_code("Run cancelled", "CANCELLED"),
            Interrupt::TimedOut => Event::run_error_with_code(
                format!("Run timed out after {}ms", budget.as_millis()),
                "RUN_TIMEOUT",
            ),
        }
    }
}

/// 在取消令牌与 run 截止时间约束下等待 `fut`
async fn bounded<F: Future>(
    cancel: &CancellationToken,
    deadline: Instant,
    fut: F,
) -> Result<F::Output, Interrupt> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        out = tokio::time::timeout_at(deadline, fut) => out.map_err(|_| Interrupt::TimedOut),
    }
}

/// 一轮中组装完成的工具调用
#[derive(Debug, Clone, PartialEq)]
struct PendingCall {
    index: usize,
    provider_id: Option<String>,
    id: String,
    name: String,
    arguments: String,
}

/// 把 tool_call 增量组装为完整调用，同时产出 START / ARGS / END。
/// 同一时刻只有一个打开的调用，新 index（或新的 provider id）先关闭当前调用，因此不同调用的事件不会交错。
struct CallAssembler {
    parent_message_id: String,
    current: Option<PendingCall>,
    finished: Vec<PendingCall>,
}

impl CallAssembler {
    fn new(parent_message_id: String) -> Self {
        Self {
            parent_message_id,
            current: None,
            finished: Vec::new(),
        }
    }

    fn push(&mut self, delta: &ToolCallDelta, used_ids: &mut HashSet<String>) -> Vec<Event> {
        let mut events = Vec::new();
        let incoming_id = delta.id.as_deref().filter(|id| !id.is_empty());

        let starts_new = self.current.as_ref().is_some_and(|current| {
            current.index != delta.index
                || incoming_id.is_some_and(|id| current.provider_id.as_deref() != Some(id))
        });
        if starts_new {
            events.extend(self.close_current());
        }

        if self.current.is_none() {
            if incoming_id.is_none() && self.finished.iter().any(|c| c.index == delta.index) {
                tracing::warn!(index = delta.index, "ignoring late fragment for a closed tool call");
                return events;
            }
            let id = incoming_id
                .filter(|id| !used_ids.contains(*id))
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4()));
            used_ids.insert(id.clone());
            let name = delta
                .function
                .as_ref()
                .and_then(|f| f.name.clone())
                .unwrap_or_default();
            events.push(Event::ToolCallStart {
                tool_call_id: id.clone(),
                tool_call_name: name.clone(),
                parent_message_id: Some(self.parent_message_id.clone()),
            });
            self.current = Some(PendingCall {
                index: delta.index,
                provider_id: incoming_id.map(str::to_string),
                id,
                name,
                arguments: String::new(),
            });
        }

        let fragment = delta
            .function
            .as_ref()
            .and_then(|f| f.arguments.as_deref())
            .filter(|a| !a.is_empty());
        if let (Some(call), Some(fragment)) = (self.current.as_mut(), fragment) {
            call.arguments.push_str(fragment);
            events.push(Event::ToolCallArgs {
                tool_call_id: call.id.clone(),
                delta: fragment.to_string(),
            });
        }
        events
    }

    fn close_current(&mut self) -> Option<Event> {
        let call = self.current.take()?;
        let end = Event::ToolCallEnd {
            tool_call_id: call.id.clone(),
        };
        self.finished.push(call);
        Some(end)
    }

    fn finish(mut self) -> (Option<Event>, Vec<PendingCall>) {
        let end = self.close_current();
        (end, self.finished)
    }
}

fn tool_error(name: &str, reason: impl std::fmt::Display) -> String {
    format!("[Tool Error] {name}: {reason}")
}

fn failure_reason(err: GatewayError) -> String {
    match err {
        GatewayError::ToolExecutionFailed(reason) => reason,
        other => other.to_string(),
    }
}

fn parse_arguments(raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(raw).map_err(|e| format!("invalid arguments: {e}"))
}

fn collect_chat_tools(registry: &ToolRegistry, with_render_surface: bool) -> Vec<ChatTool> {
    let mut tools: Vec<ChatTool> = registry
        .tools()
        .map(|t| ChatTool::function(t.name(), t.description(), t.parameters_schema()))
        .collect();
    if with_render_surface {
        tools.push(ChatTool::function(
            RENDER_SURFACE_TOOL,
            RENDER_SURFACE_DESCRIPTION,
            render_surface_parameters(),
        ));
    }
    tools
}

fn assistant_message(text: &str, calls: &[PendingCall]) -> ChatMessage {
    let mut message = ChatMessage::assistant(text);
    if text.is_empty() && !calls.is_empty() {
        message.content = None;
    }
    message.tool_calls = calls
        .iter()
        .map(|c| ChatToolCall {
            id: c.id.clone(),
            kind: "function".to_string(),
            function: ChatFunctionCall {
                name: c.name.clone(),
                arguments: c.arguments.clone(),
            },
        })
        .collect();
    message
}

fn to_chat_message(message: &Message) -> ChatMessage {
    let role = match message.role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
        Role::System | Role::Developer => "system",
    };
    ChatMessage {
        role: role.to_string(),
        content: Some(message.content.clone()),
        tool_calls: message
            .tool_calls
            .iter()
            .flatten()
            .map(|c| ChatToolCall {
                id: c.id.clone(),
                kind: "function".to_string(),
                function: ChatFunctionCall {
                    name: c.function.name.clone(),
                    arguments: c.function.arguments.clone(),
                },
            })
            .collect(),
        tool_call_id: message.tool_call_id.clone(),
    }
}

/// 请求 context 与客户端工具的摘要，附在 system prompt 之后
fn context_summary(request: &RunRequest) -> Vec<String> {
    let mut lines = Vec::new();
    for entry in &request.context {
        let key = entry.get("key").and_then(Value::as_str).unwrap_or("unknown");
        let value = entry.get("value");

        if let (Some(desc), Some(Value::String(v))) = (entry.get("description").and_then(Value::as_str), value) {
            lines.push(format!("{desc}: {}", preview(v)));
            continue;
        }
        if let Some(desc) = value
            .and_then(|v| v.get("description"))
            .and_then(Value::as_str)
            .filter(|d| !d.is_empty())
        {
            lines.push(desc.to_string());
            continue;
        }
        if let Some(data) = value.and_then(|v| v.get("data")) {
            lines.push(format!("{key}: {}", preview(&data.to_string())));
            continue;
        }
        lines.push(format!("Context {key} provided."));
    }

    if !request.tools.is_empty() {
        let names: Vec<&str> = request.tools.iter().map(|t| t.name.as_str()).collect();
        lines.push(format!("Available tools: {}", names.join(", ")));
    }
    lines
}

fn preview(s: &str) -> String {
    if s.chars().count() > CONTEXT_PREVIEW_LIMIT {
        format!("{}…", s.chars().take(CONTEXT_PREVIEW_LIMIT).collect::<String>())
    } else {
        s.to_string()
    }
}

fn build_chat_messages(system_prompt: &str, request: &RunRequest) -> Vec<ChatMessage> {
    let mut system = system_prompt.to_string();
    let summary = context_summary(request);
    if !summary.is_empty() {
        system.push_str("\n\nContext:");
        for line in summary {
            system.push_str("\n- ");
            system.push_str(&line);
        }
    }

    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    messages.push(ChatMessage::system(system));
    messages.extend(request.messages.iter().map(to_chat_message));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatChunk;
    use crate::protocol::{FunctionCall, ToolCallDirective, ToolSpec};
    use serde_json::json;

    fn deltas(chunk: ChatChunk) -> Vec<ToolCallDelta> {
        chunk.choices.into_iter().flat_map(|c| c.delta.tool_calls).collect()
    }

    #[test]
    fn test_assembler_never_interleaves_calls() {
        let mut used = HashSet::new();
        let mut asm = CallAssembler::new("msg_1".into());
        let mut events = Vec::new();
        let fragments = [
            ChatChunk::tool_call(0, Some("call_a"), Some("lookup"), Some("{\"q\":")),
            ChatChunk::tool_call(0, None, None, Some("\"x\"}")),
            ChatChunk::tool_call(1, Some("call_b"), Some("show"), Some("{}")),
        ];
        for chunk in fragments {
            for d in deltas(chunk) {
                events.extend(asm.push(&d, &mut used));
            }
        }
        let (end, calls) = asm.finish();
        events.extend(end);

        let kinds: Vec<(&str, &str)> = events
            .iter()
            .map(|e| (e.event_type(), e.tool_call_id().unwrap_or_default()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("TOOL_CALL_START", "call_a"),
                ("TOOL_CALL_ARGS", "call_a"),
                ("TOOL_CALL_ARGS", "call_a"),
                ("TOOL_CALL_END", "call_a"),
                ("TOOL_CALL_START", "call_b"),
                ("TOOL_CALL_ARGS", "call_b"),
                ("TOOL_CALL_END", "call_b"),
            ]
        );
        assert_eq!(calls[0].arguments, "{\"q\":\"x\"}");
        assert_eq!(calls[1].name, "show");
    }

    #[test]
    fn test_reused_provider_id_is_replaced() {
        let mut used = HashSet::from(["call_a".to_string()]);
        let mut asm = CallAssembler::new("msg_2".into());
        for d in deltas(ChatChunk::tool_call(0, Some("call_a"), Some("lookup"), None)) {
            asm.push(&d, &mut used);
        }
        let (_, calls) = asm.finish();
        assert_ne!(calls[0].id, "call_a");
        assert!(calls[0].id.starts_with("call_"));
    }

    #[test]
    fn test_context_summary_lines() {
        let mut request = RunRequest::new("t", "r", Vec::new());
        request.context = vec![
            json!({"key": "page", "value": {"description": "User is on the checkout page"}}),
            json!({"key": "cart", "value": {"data": {"items": 2}}}),
            json!({"key": "empty"}),
            json!({"description": "Locale", "value": "zh-CN"}),
        ];
        request.tools = vec![ToolSpec {
            name: "confirm".into(),
            description: String::new(),
            parameters: json!({}),
        }];
        let lines = context_summary(&request);
        assert_eq!(
            lines,
            vec![
                "User is on the checkout page".to_string(),
                "cart: {\"items\":2}".to_string(),
                "Context empty provided.".to_string(),
                "Locale: zh-CN".to_string(),
                "Available tools: confirm".to_string(),
            ]
        );
    }

    #[test]
    fn test_history_conversion() {
        let mut assistant = Message::new(Role::Assistant, "");
        assistant.tool_calls = Some(vec![ToolCallDirective {
            id: "call_1".into(),
            kind: "function".into(),
            function: FunctionCall {
                name: "lookup".into(),
                arguments: "{}".into(),
            },
        }]);
        let request = RunRequest::new(
            "t",
            "r",
            vec![
                Message::new(Role::Developer, "be brief"),
                Message::user("hi"),
                assistant,
                Message::tool_result("call_1", "42"),
            ],
        );
        let messages = build_chat_messages("sys", &request);
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "system", "user", "assistant", "tool"]);
        assert_eq!(messages[0].content.as_deref(), Some("sys"));
        assert_eq!(messages[3].tool_calls[0].function.name, "lookup");
        assert_eq!(messages[4].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_arguments("").unwrap(), json!({}));
        assert_eq!(parse_arguments("{\"a\":1}").unwrap(), json!({"a": 1}));
        assert!(parse_arguments("{oops").is_err());
    }
}
