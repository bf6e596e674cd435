//! 优雅关闭
//!
//! 进程内唯一的关闭令牌。Ctrl+C / SIGTERM / 服务自身故障都经 `trigger` 触发，只记录第一个原因；
//! Hub 据此停止 HTTP 服务（等待在途响应）、退出清扫循环、断开 MCP 客户端。

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// 服务循环异常退出
    Fatal(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Interrupt => write!(f, "interrupt"),
            ShutdownReason::Terminate => write!(f, "terminate"),
            ShutdownReason::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

#[derive(Debug, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 后台任务据此退出
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；重复触发时保留最早的原因
    pub fn trigger(&self, reason: ShutdownReason) {
        if let Ok(mut slot) = self.reason.lock() {
            if slot.is_none() {
                tracing::info!(%reason, "initiating graceful shutdown");
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|r| r.clone())
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 监听 Ctrl+C 与 SIGTERM（非 unix 平台只有 Ctrl+C）；令牌先被取消时任务直接退出
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let reason = tokio::select! {
                _ = manager.token.cancelled() => return,
                Ok(()) = tokio::signal::ctrl_c() => ShutdownReason::Interrupt,
                _ = terminate() => ShutdownReason::Terminate,
            };
            manager.trigger(reason);
        });
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
