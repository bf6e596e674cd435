//! 网关层：会话、推送连接、Agent 运行时与 HTTP 接入
//!
//! - `session`：会话存储（TTL 清扫）
//! - `connection`：每会话至多一条推送连接 + 积压补发
//! - `runtime`：校验请求、选择 Agent、守卫事件流、写入会话
//! - `hub`：进程级状态、清扫循环、HTTP 服务生命周期
//! - `routes`：axum 路由

pub mod connection;
pub mod hub;
pub mod routes;
pub mod runtime;
pub mod session;

pub use connection::{ConnectionRegistry, PushTransport, MAX_BACKLOG};
pub use hub::{sweep, AppState, Hub};
pub use routes::router;
pub use runtime::{AgentRuntime, StartedRun};
pub use session::{Session, SessionId, SessionInfo, SessionStore};
