//! AG-UI 流式网关
//!
//! 接收一次对话 run 请求，按配置选择后端策略（场景回放 / LLM 工具循环 / surface 协议代理 / 回显），
//! 把结果以有序 AG-UI 事件流经 SSE 推送给客户端。
//!
//! 模块划分：
//! - **protocol**: AG-UI 事件、Run 输入、入站行流解析
//! - **agents**: Agent trait 与各策略实现、工厂、生命周期守卫
//! - **llm**: OpenAI 兼容流式 completion 客户端、重试、脚本化后端
//! - **tools**: 工具注册表、执行器、MCP 客户端、surface 渲染工具 schema
//! - **bridge**: A2UI surface 服务桥接
//! - **scenario**: 场景定义与目录加载
//! - **gateway**: 会话、推送连接、运行时与 HTTP 路由
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与优雅关闭

pub mod agents;
pub mod bridge;
pub mod config;
pub mod core;
pub mod gateway;
pub mod llm;
pub mod observability;
pub mod protocol;
pub mod scenario;
pub mod tools;
