//! Hub - 进程级运行时
//!
//! 持有会话存储、连接注册表、场景目录、MCP 客户端与 Agent 运行时，负责：
//! - HTTP 服务（`routes::router`）与优雅关闭
//! - 会话 / 连接清扫循环
//! - 后台连接 MCP 服务

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::connection::ConnectionRegistry;
use super::routes;
use super::runtime::AgentRuntime;
use super::session::SessionStore;
use crate::agents::AgentDeps;
use crate::bridge::SurfaceBridgeClient;
use crate::config::AppConfig;
use crate::core::GatewayError;
use crate::llm::CompletionBackend;
use crate::scenario::ScenarioCatalog;
use crate::tools::McpClient;

/// 路由共享状态
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub sessions: Arc<SessionStore>,
    pub connections: Arc<ConnectionRegistry>,
    pub runtime: AgentRuntime,
    pub scenarios: Arc<ScenarioCatalog>,
    /// 仅 `extension.mode = mcpui` 时存在
    pub mcp: Option<Arc<McpClient>>,
    /// 仅 `extension.mode = a2ui` 时存在（健康检查用）
    pub bridge: Option<SurfaceBridgeClient>,
    pub started_at: Instant,
    pub started_at_utc: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: AppConfig, scenarios: ScenarioCatalog) -> Self {
        Self::with_backend(config, scenarios, None)
    }

    /// `backend` 替换 HTTP completion 后端
    pub fn with_backend(
        config: AppConfig,
        scenarios: ScenarioCatalog,
        backend: Option<Arc<dyn CompletionBackend>>,
    ) -> Self {
        let config = Arc::new(config);
        let http = reqwest::Client::new();
        let scenarios = Arc::new(scenarios);
        let sessions = Arc::new(SessionStore::new());

        let mcp = config
            .mcp_enabled()
            .then(|| Arc::new(McpClient::new(http.clone(), &config.mcp)));
        let bridge = config
            .a2ui_enabled()
            .then(|| SurfaceBridgeClient::new(http.clone(), &config.a2ui));

        let mut deps = AgentDeps::new(Arc::clone(&scenarios), http);
        if let Some(client) = &mcp {
            deps = deps.with_mcp(Arc::clone(client));
        }
        if let Some(backend) = backend {
            deps = deps.with_backend(backend);
        }

        Self {
            runtime: AgentRuntime::new(Arc::clone(&config), Arc::clone(&sessions), deps),
            config,
            sessions,
            connections: Arc::new(ConnectionRegistry::new()),
            scenarios,
            mcp,
            bridge,
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
        }
    }
}

/// 一次清扫：先清理空闲连接，再清理没有活跃连接的过期会话，最后丢弃已无会话的积压。
/// 返回 (会话数, 连接数)
pub fn sweep(state: &AppState) -> (usize, usize) {
    let idle = state.config.session.connection_idle();
    let connections = state.connections.cleanup(idle);
    let sessions = state
        .sessions
        .cleanup_with(state.config.session.max_age(), |id| {
            state.connections.is_active(id, idle)
        });
    let orphans = state.connections.drop_orphans(|id| state.sessions.contains(id));
    if orphans > 0 {
        tracing::debug!(orphans, "dropped push backlogs of expired sessions");
    }
    (sessions, connections)
}

pub struct Hub {
    state: Arc<AppState>,
    shutdown: CancellationToken,
}

impl Hub {
    pub fn new(state: AppState, shutdown: CancellationToken) -> Self {
        Self {
            state: Arc::new(state),
            shutdown,
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    pub fn router(&self) -> axum::Router {
        routes::router(Arc::clone(&self.state))
    }

    /// 按 `session.cleanup_interval_ms` 周期清扫，关闭信号触发后退出
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let shutdown = self.shutdown.clone();
        let period = state.config.session.cleanup_interval();

        tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("session sweeper stopped");
                        break;
                    }
                    _ = timer.tick() => {
                        let (sessions, connections) = sweep(&state);
                        tracing::debug!(
                            sessions_removed = sessions,
                            connections_removed = connections,
                            sessions = state.sessions.len(),
                            "sweep complete"
                        );
                    }
                }
            }
        })
    }

    /// 后台连接 MCP 服务；失败只记日志
    pub fn spawn_mcp_connect(&self) -> Option<JoinHandle<()>> {
        let mcp = self.state.mcp.clone()?;
        let timeout = self.state.config.mcp.connect_timeout();
        Some(tokio::spawn(async move {
            if mcp.connect_with_timeout(timeout).await {
                let tools = mcp.tool_count().await;
                tracing::info!(server_id = mcp.server_id(), tools, "MCP client ready");
            } else {
                tracing::warn!(
                    server_url = mcp.server_url(),
                    "MCP server unavailable, continuing without MCP tools"
                );
            }
        }))
    }

    /// 启动 HTTP 服务直到关闭信号触发
    pub async fn run(self) -> Result<(), GatewayError> {
        let addr = self.state.config.server.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::Internal(format!("Failed to bind {addr}: {e}")))?;
        self.serve(listener).await
    }

    /// 在已绑定的 listener 上服务
    pub async fn serve(self, listener: TcpListener) -> Result<(), GatewayError> {
        let local = listener
            .local_addr()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        let config = &self.state.config;
        tracing::info!(
            addr = %local,
            mode = ?config.agent.mode,
            extension = ?config.extension.mode,
            scenarios = self.state.scenarios.len(),
            "AG-UI gateway listening on http://{}",
            local
        );

        let sweeper = self.spawn_sweeper();
        self.spawn_mcp_connect();

        let shutdown = self.shutdown.clone();
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| GatewayError::Internal(format!("Server error: {e}")));

        self.shutdown.cancel();
        if let Err(e) = sweeper.await {
            tracing::warn!(error = %e, "session sweeper task failed");
        }
        if let Some(mcp) = &self.state.mcp {
            mcp.disconnect().await;
        }
        self.state.connections.close_all();
        tracing::info!("AG-UI gateway stopped");
        result
    }
}
