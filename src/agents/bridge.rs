//! Surface 协议代理 Agent
//!
//! RUN_STARTED 之后把用户文本交给 surface 服务，服务每回一行载荷就立刻转成一个
//! `CUSTOM{name:"a2ui"}` 事件转发；上游出错时以 RUN_ERROR 结束。

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::agents::{Agent, EventStream};
use crate::bridge::{surface_event, BridgeRequest, SurfaceBridgeClient};
use crate::protocol::{Event, RunRequest};

pub struct BridgeAgent {
    client: SurfaceBridgeClient,
    cancel: CancellationToken,
}

impl BridgeAgent {
    pub fn new(client: SurfaceBridgeClient) -> Self {
        Self {
            client,
            cancel: CancellationToken::new(),
        }
    }
}

impl Agent for BridgeAgent {
    fn name(&self) -> &'static str {
        "a2ui"
    }

    fn run(&self, request: RunRequest) -> EventStream {
        let client = self.client.clone();
        let cancel = self.cancel.clone();

        Box::pin(async_stream::stream! {
            let thread_id = request.thread_id.clone();
            yield Event::run_started(thread_id.clone(), request.run_id.clone());

            let text = request.latest_user_text().unwrap_or_default().to_string();
            let bridge_request = BridgeRequest::from_run(&request, text);
            tracing::info!(
                thread_id = %thread_id,
                run_id = %request.run_id,
                server = client.base_url(),
                "proxying run to A2UI server"
            );

            let mut payloads = client.stream_payloads(bridge_request);
            let mut forwarded = 0usize;
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    next = payloads.next() => Some(next),
                };
                match next {
                    None => {
                        yield Event::run_error_with_code("Run cancelled", "CANCELLED");
                        return;
                    }
                    Some(None) => break,
                    Some(Some(Ok(payload))) => {
                        forwarded += 1;
                        yield surface_event(&thread_id, payload);
                    }
                    Some(Some(Err(e))) => {
                        tracing::error!(thread_id = %thread_id, error = %e, "A2UI proxy failed");
                        yield Event::run_error_with_code(format!("A2UI proxy error: {e}"), "A2UI_ERROR");
                        return;
                    }
                }
            }

            tracing::debug!(thread_id = %thread_id, forwarded, "A2UI stream complete");
            yield Event::run_finished(thread_id, request.run_id.clone());
        })
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}
