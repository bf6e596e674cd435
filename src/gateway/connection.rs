//! 推送连接注册表
//!
//! 每个会话至多一条活跃推送连接（`GET /events` 建立）。新连接注册时关闭并替换旧连接；
//! 推送失败或空闲超时的连接被移除。没有活跃连接时推送的事件进入有界积压队列，
//! 在下一条连接注册时补发（尽力而为，不保证恰好一次）。

use std::collections::VecDeque;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::core::GatewayError;
use crate::protocol::Event;

/// 每个会话最多积压的事件数
pub const MAX_BACKLOG: usize = 256;

/// 推送通道：事件发送端 + 关闭信号
#[derive(Debug, Clone)]
pub struct PushTransport {
    tx: mpsc::Sender<Event>,
    closed: CancellationToken,
}

impl PushTransport {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self {
            tx,
            closed: CancellationToken::new(),
        }
    }

    /// 建立通道，返回 (transport, 接收端)
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// 连接关闭信号（被替换、被清理或服务关闭时触发）
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }
}

#[derive(Debug)]
struct Connection {
    id: u64,
    transport: PushTransport,
    last_activity: Instant,
}

#[derive(Debug, Default)]
struct Slot {
    live: Option<Connection>,
    backlog: VecDeque<Event>,
}

/// 会话 → 推送连接
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    slots: DashMap<String, Slot>,
    next_id: std::sync::atomic::AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册连接，返回连接 id；旧连接被关闭并替换，积压事件立即补发
    pub fn register(&self, session_id: &str, transport: PushTransport) -> u64 {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        let mut slot = self.slots.entry(session_id.to_string()).or_default();

        if let Some(old) = slot.live.take() {
            tracing::info!(session_id, old = old.id, new = id, "replacing push connection");
            old.transport.close();
        }

        while let Some(event) = slot.backlog.pop_front() {
            if transport.tx.try_send(event).is_err() {
                tracing::warn!(session_id, "backlog replay truncated");
                break;
            }
        }
        slot.backlog.clear();

        slot.live = Some(Connection {
            id,
            transport,
            last_activity: Instant::now(),
        });
        tracing::debug!(session_id, connection_id = id, "push connection registered");
        id
    }

    /// 仅当当前连接仍是 `connection_id` 时移除（避免误删替换后的新连接）
    pub fn unregister(&self, session_id: &str, connection_id: u64) -> bool {
        let removed = {
            let Some(mut slot) = self.slots.get_mut(session_id) else {
                return false;
            };
            match slot.live.as_ref() {
                Some(conn) if conn.id == connection_id => {
                    if let Some(conn) = slot.live.take() {
                        conn.transport.close();
                    }
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.slots
                .remove_if(session_id, |_, slot| slot.live.is_none() && slot.backlog.is_empty());
            tracing::debug!(session_id, connection_id, "push connection closed");
        }
        removed
    }

    /// 向会话的活跃连接推送事件；没有连接时进入积压队列并返回 `TransportClosed`
    pub async fn push(&self, session_id: &str, event: Event) -> Result<(), GatewayError> {
        let transport = self
            .slots
            .get(session_id)
            .and_then(|slot| slot.live.as_ref().map(|c| (c.id, c.transport.clone())));

        let Some((conn_id, transport)) = transport else {
            self.enqueue_backlog(session_id, event);
            return Err(GatewayError::TransportClosed(session_id.to_string()));
        };

        if transport.is_closed() {
            self.unregister(session_id, conn_id);
            self.enqueue_backlog(session_id, event);
            return Err(GatewayError::TransportClosed(session_id.to_string()));
        }

        match transport.tx.send(event).await {
            Ok(()) => {
                if let Some(mut slot) = self.slots.get_mut(session_id) {
                    if let Some(conn) = slot.live.as_mut().filter(|c| c.id == conn_id) {
                        conn.last_activity = Instant::now();
                    }
                }
                Ok(())
            }
            Err(mpsc::error::SendError(event)) => {
                self.unregister(session_id, conn_id);
                self.enqueue_backlog(session_id, event);
                Err(GatewayError::TransportClosed(session_id.to_string()))
            }
        }
    }

    fn enqueue_backlog(&self, session_id: &str, event: Event) {
        let mut slot = self.slots.entry(session_id.to_string()).or_default();
        if slot.backlog.len() >= MAX_BACKLOG {
            slot.backlog.pop_front();
        }
        slot.backlog.push_back(event);
    }

    /// 会话是否有在 `max_idle` 内活跃过的连接
    pub fn is_active(&self, session_id: &str, max_idle: Duration) -> bool {
        self.slots
            .get(session_id)
            .and_then(|slot| {
                slot.live
                    .as_ref()
                    .map(|c| !c.transport.is_closed() && c.last_activity.elapsed() <= max_idle)
            })
            .unwrap_or(false)
    }

    /// 是否存在未关闭的连接（不看空闲时间）
    pub fn has_live(&self, session_id: &str) -> bool {
        self.slots
            .get(session_id)
            .map(|slot| slot.live.as_ref().is_some_and(|c| !c.transport.is_closed()))
            .unwrap_or(false)
    }

    /// 清理空闲超过 `max_idle` 或已断开的连接，返回清理数量
    pub fn cleanup(&self, max_idle: Duration) -> usize {
        let mut removed = 0;
        for mut slot in self.slots.iter_mut() {
            let stale = slot
                .live
                .as_ref()
                .is_some_and(|c| c.transport.is_closed() || c.last_activity.elapsed() > max_idle);
            if stale {
                if let Some(conn) = slot.live.take() {
                    conn.transport.close();
                    removed += 1;
                }
            }
        }
        self.slots.retain(|_, slot| slot.live.is_some() || !slot.backlog.is_empty());
        if removed > 0 {
            tracing::info!("Cleaned up {} idle SSE connections", removed);
        }
        removed
    }

    /// 丢弃会话已不存在且没有活跃连接的槽位（含积压），返回丢弃数量
    pub fn drop_orphans(&self, session_exists: impl Fn(&str) -> bool) -> usize {
        let before = self.slots.len();
        self.slots
            .retain(|id, slot| slot.live.is_some() || session_exists(id));
        before.saturating_sub(self.slots.len())
    }

    /// 丢弃会话的连接与积压（会话被删除时）
    pub fn remove_session(&self, session_id: &str) {
        if let Some((_, slot)) = self.slots.remove(session_id) {
            if let Some(conn) = slot.live {
                conn.transport.close();
            }
        }
    }

    /// 关闭全部连接（服务关闭时）
    pub fn close_all(&self) {
        for slot in self.slots.iter() {
            if let Some(conn) = slot.live.as_ref() {
                conn.transport.close();
            }
        }
        self.slots.clear();
    }

    /// 活跃连接数
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.live.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn backlog_len(&self, session_id: &str) -> usize {
        self.slots.get(session_id).map(|s| s.backlog.len()).unwrap_or(0)
    }
}
