//! 生命周期守卫：包在任意 Agent 流外面，强制 run 的事件契约
//!
//! - 第一个事件不是 RUN_STARTED 时补一个
//! - 多余的 RUN_STARTED 丢弃
//! - 终止事件之后的一切丢弃（并停止拉取内层流）
//! - 内层流在没有终止事件的情况下结束时补一个 RUN_ERROR

use futures_util::StreamExt;

use crate::agents::EventStream;
use crate::protocol::Event;

pub fn guarded(inner: EventStream, thread_id: String, run_id: String) -> EventStream {
    Box::pin(async_stream::stream! {
        let mut inner = inner;
        let mut started = false;

        while let Some(event) = inner.next().await {
            match &event {
                Event::RunStarted { .. } if started => {
                    tracing::warn!(%thread_id, %run_id, "dropping duplicate RUN_STARTED");
                    continue;
                }
                Event::RunStarted { .. } => started = true,
                _ if !started => {
                    started = true;
                    yield Event::run_started(thread_id.clone(), run_id.clone());
                }
                _ => {}
            }

            let terminal = event.is_terminal();
            yield event;
            if terminal {
                return;
            }
        }

        if !started {
            yield Event::run_started(thread_id.clone(), run_id.clone());
        }
        tracing::warn!(%thread_id, %run_id, "agent stream ended without a terminal event");
        yield Event::run_error_with_code("Agent stream ended unexpectedly", "INCOMPLETE_RUN");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    async fn collect(events: Vec<Event>) -> Vec<Event> {
        guarded(Box::pin(stream::iter(events)), "t".into(), "r".into())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_well_formed_stream_passes_through() {
        let events = vec![
            Event::run_started("t", "r"),
            Event::text_chunk("m", "hi"),
            Event::run_finished("t", "r"),
        ];
        assert_eq!(collect(events.clone()).await, events);
    }

    #[tokio::test]
    async fn test_missing_start_and_terminal_are_added() {
        let out = collect(vec![Event::text_chunk("m", "hi")]).await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], Event::run_started("t", "r"));
        assert!(matches!(out[2], Event::RunError { .. }));
    }

    #[tokio::test]
    async fn test_nothing_after_terminal() {
        let out = collect(vec![
            Event::run_started("t", "r"),
            Event::run_error("boom"),
            Event::text_chunk("m", "late"),
            Event::run_finished("t", "r"),
        ])
        .await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[1], Event::run_error("boom"));
    }

    #[tokio::test]
    async fn test_empty_stream_is_closed_with_error() {
        let out = collect(Vec::new()).await;
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Event::RunStarted { .. }));
        assert!(out[1].is_terminal());
    }
}
