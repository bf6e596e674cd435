//! Agent Runtime（运行时）
//!
//! 一次 run 的编排：校验请求 → 工厂选出 Agent（失败即请求错误，不产生任何事件）→ 获取或创建会话 →
//! 用生命周期守卫包住 Agent 的事件流 → 在终止事件发出前把本次对话写入会话。
//! 返回的流被丢弃时（客户端断开）Agent 会收到 cancel。

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;

use crate::agents::{create_agent, create_scenario_agent, guarded, Agent, AgentDeps, EventStream};
use crate::config::AppConfig;
use crate::core::GatewayError;
use crate::gateway::session::SessionStore;
use crate::protocol::{Event, FunctionCall, Message, Role, RunRequest, ToolCallDirective};

/// 已启动的 run
pub struct StartedRun {
    pub thread_id: String,
    pub run_id: String,
    pub session_id: String,
    pub agent: &'static str,
    pub events: EventStream,
}

pub struct AgentRuntime {
    config: Arc<AppConfig>,
    sessions: Arc<SessionStore>,
    deps: AgentDeps,
}

impl AgentRuntime {
    pub fn new(config: Arc<AppConfig>, sessions: Arc<SessionStore>, deps: AgentDeps) -> Self {
        Self {
            config,
            sessions,
            deps,
        }
    }

    pub fn deps(&self) -> &AgentDeps {
        &self.deps
    }

    /// 按配置选择 Agent 并开始 run
    pub fn start_run(
        &self,
        request: RunRequest,
        session_id: Option<&str>,
    ) -> Result<StartedRun, GatewayError> {
        let request = request.normalize()?;
        let agent = create_agent(&self.config, &request, &self.deps)?;
        Ok(self.launch(agent, request, session_id))
    }

    /// 无视默认配置，直接回放指定场景
    pub fn start_scenario_run(
        &self,
        scenario_id: &str,
        request: RunRequest,
        session_id: Option<&str>,
    ) -> Result<StartedRun, GatewayError> {
        let request = request.normalize()?;
        let agent = create_scenario_agent(&self.config, scenario_id, &self.deps)?;
        Ok(self.launch(agent, request, session_id))
    }

    fn launch(&self, agent: Box<dyn Agent>, request: RunRequest, session_id: Option<&str>) -> StartedRun {
        let session = self.sessions.get_or_create(&request.thread_id, session_id);
        let agent: Arc<dyn Agent> = Arc::from(agent);
        let name = agent.name();

        tracing::info!(
            thread_id = %request.thread_id,
            run_id = %request.run_id,
            session_id = %session.id,
            agent = name,
            messages = request.messages.len(),
            "run started"
        );

        let thread_id = request.thread_id.clone();
        let run_id = request.run_id.clone();
        let input = request.messages.clone();
        let events = guarded(agent.run(request), thread_id.clone(), run_id.clone());
        let events = record_transcript(
            events,
            Arc::clone(&self.sessions),
            session.id.clone(),
            input,
            CancelOnDrop(agent),
        );

        StartedRun {
            thread_id,
            run_id,
            session_id: session.id,
            agent: name,
            events,
        }
    }
}

/// 流被丢弃时通知 Agent 停止
struct CancelOnDrop(Arc<dyn Agent>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// 透传事件，同时累积本次 run 的对话；终止事件发出前把输入消息与产出消息写入会话
fn record_transcript(
    inner: EventStream,
    sessions: Arc<SessionStore>,
    session_id: String,
    input: Vec<Message>,
    cancel_guard: CancelOnDrop,
) -> EventStream {
    Box::pin(async_stream::stream! {
        let _cancel_guard = cancel_guard;
        let mut inner = inner;
        let mut transcript = Transcript::default();

        while let Some(event) = inner.next().await {
            transcript.observe(&event);
            if event.is_terminal() {
                let produced = std::mem::take(&mut transcript).into_messages();
                tracing::debug!(
                    session_id = %session_id,
                    input = input.len(),
                    produced = produced.len(),
                    outcome = event.event_type(),
                    "recording run transcript"
                );
                sessions.append_messages(&session_id, input.iter().cloned().chain(produced));
            }
            yield event;
        }
    })
}

/// 从事件流重建助手消息与工具结果消息
#[derive(Debug, Default)]
struct Transcript {
    messages: Vec<Message>,
    /// tool_call_id → (消息下标, 调用下标)
    calls: HashMap<String, (usize, usize)>,
}

impl Transcript {
    fn observe(&mut self, event: &Event) {
        match event {
            Event::TextMessageStart { message_id, .. } => {
                self.assistant(message_id);
            }
            Event::TextMessageChunk { message_id, delta } => {
                let idx = self.assistant(message_id);
                self.messages[idx].content.push_str(delta);
            }
            Event::ToolCallStart {
                tool_call_id,
                tool_call_name,
                parent_message_id,
            } => {
                let parent = parent_message_id
                    .clone()
                    .unwrap_or_else(|| format!("msg_{tool_call_id}"));
                let idx = self.assistant(&parent);
                let calls = self.messages[idx].tool_calls.get_or_insert_with(Vec::new);
                calls.push(ToolCallDirective {
                    id: tool_call_id.clone(),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: tool_call_name.clone(),
                        arguments: String::new(),
                    },
                });
                self.calls.insert(tool_call_id.clone(), (idx, calls.len() - 1));
            }
            Event::ToolCallArgs { tool_call_id, delta } => {
                if let Some(&(msg, call)) = self.calls.get(tool_call_id) {
                    if let Some(calls) = self.messages[msg].tool_calls.as_mut() {
                        calls[call].function.arguments.push_str(delta);
                    }
                }
            }
            Event::ToolCallResult {
                message_id,
                tool_call_id,
                content,
                ..
            } => {
                let mut result = Message::tool_result(tool_call_id.clone(), content.clone());
                result.id = message_id.clone();
                self.messages.push(result);
            }
            _ => {}
        }
    }

    /// 找到或创建 id 为 `message_id` 的助手消息，返回下标
    fn assistant(&mut self, message_id: &str) -> usize {
        if let Some(idx) = self
            .messages
            .iter()
            .position(|m| m.role == Role::Assistant && m.id == message_id)
        {
            return idx;
        }
        let mut message = Message::new(Role::Assistant, "");
        message.id = message_id.to_string();
        self.messages.push(message);
        self.messages.len() - 1
    }

    fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}
