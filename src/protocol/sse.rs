//! 入站 SSE / NDJSON 行解析
//!
//! A2UI bridge 与 MCP 上游返回的都是按行分隔的流：
//! 标准 SSE 字段行（`data:` / `event:` / `id:` / `retry:` / 注释），或者裸 JSON 行。
//! `SseLineStream` 负责字节缓冲、UTF-8 转换与 `\n` / `\r\n` 切分。

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;

/// 从流中切出的一行
#[derive(Debug, Clone, PartialEq)]
pub enum SseLine {
    /// `data:` 行（已去掉前缀）
    Data(String),
    Event(String),
    Id(String),
    /// `retry:` 行，单位毫秒
    Retry(u64),
    /// 空行（SSE 事件边界）
    Empty,
    /// `:` 开头的注释行（心跳）
    Comment(String),
    /// 非 SSE 字段的原始行（NDJSON）
    Raw(String),
}

pub fn parse_line(line: &str) -> SseLine {
    if line.trim().is_empty() {
        return SseLine::Empty;
    }

    if let Some(data) = line.strip_prefix("data:") {
        let data = data.strip_prefix(' ').unwrap_or(data);
        return SseLine::Data(data.to_string());
    }

    if let Some(event) = line.strip_prefix("event:") {
        let event = event.strip_prefix(' ').unwrap_or(event);
        return SseLine::Event(event.to_string());
    }

    if let Some(id) = line.strip_prefix("id:") {
        let id = id.strip_prefix(' ').unwrap_or(id);
        return SseLine::Id(id.to_string());
    }

    if let Some(retry) = line.strip_prefix("retry:") {
        if let Ok(value) = retry.trim().parse::<u64>() {
            return SseLine::Retry(value);
        }
        return SseLine::Comment(line.to_string());
    }

    if let Some(comment) = line.strip_prefix(':') {
        let comment = comment.strip_prefix(' ').unwrap_or(comment);
        return SseLine::Comment(comment.to_string());
    }

    SseLine::Raw(line.to_string())
}

impl SseLine {
    /// 承载 JSON 的行：`data:` 载荷或裸 NDJSON
    pub fn payload(&self) -> Option<&str> {
        match self {
            SseLine::Data(s) | SseLine::Raw(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// 把字节流切分为 `SseLine` 的流适配器
pub struct SseLineStream<S> {
    inner: S,
    buffer: Vec<u8>,
    done: bool,
}

impl<S> SseLineStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            done: false,
        }
    }

    fn take_line(&mut self) -> Option<SseLine> {
        let end = self.buffer.iter().position(|b| *b == b'\n')?;
        let mut raw: Vec<u8> = self.buffer.drain(..=end).collect();
        raw.pop();
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        Some(parse_line(&String::from_utf8_lossy(&raw)))
    }
}

impl<S, E> Stream for SseLineStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<SseLine, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        loop {
            // 按字节切行，避免多字节字符跨 chunk 时被截断
            if let Some(line) = self.take_line() {
                return Poll::Ready(Some(Ok(line)));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    self.buffer.extend_from_slice(&bytes);
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    if self.buffer.is_empty() {
                        return Poll::Ready(None);
                    }
                    let rest = std::mem::take(&mut self.buffer);
                    let line = String::from_utf8_lossy(&rest);
                    let line = line.trim_end_matches('\r');
                    return Poll::Ready(Some(Ok(parse_line(line))));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
