//! 脚本化后端（用于测试，无需 API）
//!
//! 按顺序消费预置的回复：每次 stream_chat 取出一项，Reply 变成 chunk 流，Fail 直接返回错误。
//! 脚本用完后返回 Config 错误。记录调用次数与收到的请求，便于断言对话历史。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{ChatChunk, ChatRequest, ChunkStream, CompletionBackend, LlmError};

/// 一次调用的预置结果
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(Vec<ChatChunk>),
    /// 流开始后才出错：先产出这些 chunk，再产出错误
    BrokenReply(Vec<ChatChunk>, LlmError),
    Fail(LlmError),
}

#[derive(Debug, Default)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedBackend {
    pub fn new(script: impl IntoIterator<Item = Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 单轮纯文本回复，按字符串片段切成多个 chunk
    pub fn text_reply(parts: &[&str]) -> Scripted {
        Scripted::Reply(parts.iter().map(|p| ChatChunk::text(*p)).collect())
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChunkStream, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(Scripted::Reply(chunks)) => Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok)))),
            Some(Scripted::BrokenReply(chunks, err)) => {
                let items = chunks.into_iter().map(Ok).chain(std::iter::once(Err(err)));
                Ok(Box::pin(stream::iter(items)))
            }
            Some(Scripted::Fail(err)) => Err(err),
            None => Err(LlmError::Config("scripted backend exhausted".to_string())),
        }
    }
}
