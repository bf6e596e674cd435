//! 会话管理
//!
//! 会话按 thread 维度保存对话历史，生命周期独立于任何单个请求：
//! 首次 run（或显式创建）时建立，每次 run 完成后追加消息，
//! 由显式删除或周期性 TTL 清扫销毁。底层为按 key 分片的 `DashMap`，只需单 key 原子操作。

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::{Duration, Instant};

use crate::protocol::Message;

/// 会话 ID（缺省等于 thread id）
pub type SessionId = String;

/// 单个会话
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub thread_id: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    /// 最后活跃时间（tokio 时钟，测试中可暂停推进）
    pub last_activity: Instant,
}

impl Session {
    pub fn new(id: SessionId, thread_id: String) -> Self {
        Self {
            id,
            thread_id,
            messages: Vec::new(),
            created_at: Utc::now(),
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_expired(&self, max_age: Duration) -> bool {
        self.last_activity.elapsed() > max_age
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            thread_id: self.thread_id.clone(),
            message_count: self.messages.len(),
            created_at: self.created_at,
            idle_ms: self.last_activity.elapsed().as_millis() as u64,
        }
    }
}

/// 会话摘要（HTTP 返回）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub thread_id: String,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub idle_ms: u64,
}

/// 会话存储
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<SessionId, Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取或创建会话；已存在时刷新活跃时间。id 为 `session_id`，缺省取 `thread_id`
    pub fn get_or_create(&self, thread_id: &str, session_id: Option<&str>) -> Session {
        let id = session_id
            .filter(|s| !s.is_empty())
            .unwrap_or(thread_id)
            .to_string();
        let mut entry = self.sessions.entry(id.clone()).or_insert_with(|| {
            tracing::debug!(session_id = %id, thread_id, "session created");
            Session::new(id.clone(), thread_id.to_string())
        });
        entry.touch();
        entry.value().clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn touch(&self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut s) => {
                s.touch();
                true
            }
            None => false,
        }
    }

    /// 追加消息（按 id 去重）；会话不存在返回 false
    pub fn append_messages(&self, session_id: &str, messages: impl IntoIterator<Item = Message>) -> bool {
        let Some(mut session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        let mut seen: HashSet<String> = session.messages.iter().map(|m| m.id.clone()).collect();
        for msg in messages {
            if seen.insert(msg.id.clone()) {
                session.messages.push(msg);
            }
        }
        session.touch();
        true
    }

    pub fn delete(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// 清理空闲超过 `max_age` 的会话，返回清理数量
    pub fn cleanup(&self, max_age: Duration) -> usize {
        self.cleanup_with(max_age, |_| false)
    }

    /// 同 `cleanup`，但 `keep(session_id)` 为 true 的会话保留（仍有活跃推送连接）
    pub fn cleanup_with(&self, max_age: Duration, keep: impl Fn(&str) -> bool) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|id, session| !session.is_expired(max_age) || keep(id));
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            tracing::info!("Cleaned up {} expired sessions", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|s| s.info()).collect()
    }
}
