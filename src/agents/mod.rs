//! Agent 层：一次 run 的事件生产者
//!
//! 四种策略实现同一个 `Agent` trait：
//! - `ScenarioAgent`：按触发词回放预置事件
//! - `LlmAgent`：多轮 completion + 工具调用循环
//! - `BridgeAgent`：把 surface 协议服务的流代理成 CUSTOM 事件
//! - `EchoAgent`：回显最近一条用户消息
//!
//! `run` 返回惰性的事件流，由消费者逐个拉取；丢弃流即停止生产。`cancel` 触发 Agent 的
//! 取消令牌，正在进行的外部调用在下一个挂起点结束。`factory::create_agent` 按配置选择策略，
//! `guard::guarded` 保证每个流恰好以一个 RUN_STARTED 开始、一个终止事件结束。

use std::pin::Pin;

use futures_util::Stream;

use crate::protocol::{Event, RunRequest};

pub mod bridge;
pub mod echo;
pub mod factory;
pub mod guard;
pub mod llm;
pub mod scenario;

pub use bridge::BridgeAgent;
pub use echo::EchoAgent;
pub use factory::{create_agent, create_scenario_agent, AgentDeps};
pub use guard::guarded;
pub use llm::{ExternalTools, LlmAgent, LoopPhase, MCP_UI_RESOURCE_EVENT};
pub use scenario::ScenarioAgent;

/// 一次 run 的事件流
pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// Agent 能力：运行与取消
pub trait Agent: Send + Sync {
    /// 日志与健康检查用的策略名
    fn name(&self) -> &'static str;

    /// 开始一次 run；事件在被拉取时才产生
    fn run(&self, request: RunRequest) -> EventStream;

    /// 请求停止；已产出的事件不受影响
    fn cancel(&self);
}
