//! 回显 Agent：把最近一条用户消息以 `Echo: ...` 逐字符流回

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::agents::{Agent, EventStream};
use crate::protocol::{generate_message_id, Event, RunRequest};

const CHAR_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
pub struct EchoAgent {
    cancel: CancellationToken,
}

impl EchoAgent {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Agent for EchoAgent {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn run(&self, request: RunRequest) -> EventStream {
        let cancel = self.cancel.clone();
        let text = request.latest_user_text().map(|t| format!("Echo: {t}"));

        Box::pin(async_stream::stream! {
            yield Event::run_started(request.thread_id.clone(), request.run_id.clone());

            if let Some(text) = text {
                let message_id = generate_message_id();
                yield Event::TextMessageStart {
                    message_id: message_id.clone(),
                    role: "assistant".to_string(),
                };
                for ch in text.chars() {
                    let cancelled = tokio::select! {
                        _ = cancel.cancelled() => true,
                        _ = tokio::time::sleep(CHAR_DELAY) => false,
                    };
                    if cancelled {
                        yield Event::run_error_with_code("Run cancelled", "CANCELLED");
                        return;
                    }
                    yield Event::text_chunk(message_id.clone(), ch.to_string());
                }
                yield Event::TextMessageEnd { message_id };
            }

            yield Event::run_finished(request.thread_id, request.run_id);
        })
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use futures_util::StreamExt;

    #[tokio::test(start_paused = true)]
    async fn test_echoes_latest_user_text() {
        let agent = EchoAgent::new();
        let request = RunRequest::new("t", "r", vec![Message::user("first"), Message::user("ok")]);
        let events: Vec<Event> = agent.run(request).collect().await;

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                Event::TextMessageChunk { delta, .. } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Echo: ok");
        assert!(matches!(events.first(), Some(Event::RunStarted { .. })));
        assert!(matches!(events.last(), Some(Event::RunFinished { .. })));
    }

    #[tokio::test]
    async fn test_no_user_message_finishes_empty() {
        let agent = EchoAgent::new();
        let events: Vec<Event> = agent.run(RunRequest::new("t", "r", Vec::new())).collect().await;
        assert_eq!(events, vec![Event::run_started("t", "r"), Event::run_finished("t", "r")]);
    }

    #[tokio::test]
    async fn test_cancel_stops_with_error() {
        let agent = EchoAgent::new();
        agent.cancel();
        let events: Vec<Event> = agent
            .run(RunRequest::new("t", "r", vec![Message::user("long text")]))
            .collect()
            .await;
        assert!(matches!(events.last(), Some(Event::RunError { .. })));
        assert!(!events.iter().any(|e| matches!(e, Event::TextMessageChunk { .. })));
    }
}
