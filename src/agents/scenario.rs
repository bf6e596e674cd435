//! 场景回放 Agent
//!
//! 取最近一条用户文本，在场景的回合列表中按声明顺序找第一个匹配的回合，
//! 依次回放其事件（事件之间按间隔等待）；没有回合匹配时只输出 RUN_STARTED / RUN_FINISHED。
//! 回合里手写的 RUN_STARTED / RUN_FINISHED 会被跳过，生命周期由 Agent 自己产生；
//! 手写的 RUN_ERROR 用于模拟失败，回放到它即结束。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::agents::{Agent, EventStream};
use crate::protocol::{Event, RunRequest};
use crate::scenario::Scenario;

pub struct ScenarioAgent {
    scenario: Arc<Scenario>,
    default_delay: Duration,
    cancel: CancellationToken,
}

impl ScenarioAgent {
    pub fn new(scenario: Arc<Scenario>, default_delay: Duration) -> Self {
        Self {
            scenario,
            default_delay,
            cancel: CancellationToken::new(),
        }
    }

    pub fn scenario_id(&self) -> &str {
        &self.scenario.id
    }
}

impl Agent for ScenarioAgent {
    fn name(&self) -> &'static str {
        "scenario"
    }

    fn run(&self, request: RunRequest) -> EventStream {
        let scenario = Arc::clone(&self.scenario);
        let default_delay = self.default_delay;
        let cancel = self.cancel.clone();

        Box::pin(async_stream::stream! {
            yield Event::run_started(request.thread_id.clone(), request.run_id.clone());

            let text = request.latest_user_text().unwrap_or_default();
            let turn = match scenario.select_turn(text) {
                Some(turn) => turn,
                None => {
                    tracing::info!(
                        scenario = %scenario.id,
                        thread_id = %request.thread_id,
                        "no scenario turn matched, finishing without content"
                    );
                    yield Event::run_finished(request.thread_id.clone(), request.run_id.clone());
                    return;
                }
            };

            let delay = turn.delay_ms.map(Duration::from_millis).unwrap_or(default_delay);
            tracing::debug!(
                scenario = %scenario.id,
                trigger = ?turn.trigger.user_message,
                events = turn.events.len(),
                "replaying scenario turn"
            );

            let mut first = true;
            for event in &turn.events {
                if matches!(event, Event::RunStarted { .. } | Event::RunFinished { .. }) {
                    tracing::warn!(
                        scenario = %scenario.id,
                        event_type = event.event_type(),
                        "skipping authored lifecycle event"
                    );
                    continue;
                }
                if !first && !delay.is_zero() {
                    let cancelled = tokio::select! {
                        _ = cancel.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if cancelled {
                        yield Event::run_error_with_code("Run cancelled", "CANCELLED");
                        return;
                    }
                } else if cancel.is_cancelled() {
                    yield Event::run_error_with_code("Run cancelled", "CANCELLED");
                    return;
                }
                first = false;
                yield event.clone();
                if event.is_terminal() {
                    return;
                }
            }

            yield Event::run_finished(request.thread_id.clone(), request.run_id.clone());
        })
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}
