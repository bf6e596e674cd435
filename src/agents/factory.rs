//! Agent 工厂：按配置 + 请求选出恰好一个 Agent
//!
//! 选择规则：
//! 1. `extension.mode = a2ui` 且不是 LLM 模式 → BridgeAgent
//! 2. LLM 模式 → LlmAgent（mcpui 时挂 MCP 工具，a2ui 时挂 surface 渲染工具）
//! 3. 否则按场景 id（emulated 下可由 `forwardedProps.scenarioId` 覆盖）：`echo` → EchoAgent，其余 → ScenarioAgent
//!
//! 构造失败（未知场景、不支持的 provider、缺少 API Key）在任何事件产生之前返回，作为普通请求错误。

use std::sync::Arc;

use crate::agents::{Agent, BridgeAgent, EchoAgent, ExternalTools, LlmAgent, ScenarioAgent};
use crate::bridge::SurfaceBridgeClient;
use crate::config::{AgentMode, AppConfig, SUPPORTED_PROVIDERS};
use crate::core::GatewayError;
use crate::llm::{CompletionBackend, OpenAiCompatClient, RetryConfig, RetryingBackend};
use crate::protocol::RunRequest;
use crate::scenario::ScenarioCatalog;
use crate::tools::McpClient;

pub const ECHO_SCENARIO: &str = "echo";

/// 工厂依赖的进程级服务
#[derive(Clone)]
pub struct AgentDeps {
    pub scenarios: Arc<ScenarioCatalog>,
    pub mcp: Option<Arc<McpClient>>,
    pub http: reqwest::Client,
    /// 替换 HTTP completion 后端（测试注入脚本化后端）
    pub backend: Option<Arc<dyn CompletionBackend>>,
}

impl AgentDeps {
    pub fn new(scenarios: Arc<ScenarioCatalog>, http: reqwest::Client) -> Self {
        Self {
            scenarios,
            mcp: None,
            http,
            backend: None,
        }
    }

    pub fn with_mcp(mut self, client: Arc<McpClient>) -> Self {
        self.mcp = Some(client);
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn CompletionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }
}

pub fn create_agent(
    config: &AppConfig,
    request: &RunRequest,
    deps: &AgentDeps,
) -> Result<Box<dyn Agent>, GatewayError> {
    let mode = config.agent.mode;

    if config.a2ui_enabled() && mode != AgentMode::Llm {
        tracing::info!(server_url = %config.a2ui.server_url, "creating A2UI proxy agent");
        let client = SurfaceBridgeClient::new(deps.http.clone(), &config.a2ui);
        return Ok(Box::new(BridgeAgent::new(client)));
    }

    if mode == AgentMode::Llm {
        return create_llm_agent(config, deps).map(|a| Box::new(a) as Box<dyn Agent>);
    }

    let scenario_override = request.forwarded_str("scenarioId");
    let scenario_id = scenario_override.unwrap_or(&config.agent.default_scenario);
    tracing::debug!(
        scenario_override = ?scenario_override,
        scenario_id,
        "creating emulated agent"
    );
    create_scenario_agent(config, scenario_id, deps)
}

/// 按 id 创建回放 Agent（`echo` 为回显）
pub fn create_scenario_agent(
    config: &AppConfig,
    scenario_id: &str,
    deps: &AgentDeps,
) -> Result<Box<dyn Agent>, GatewayError> {
    if scenario_id == ECHO_SCENARIO {
        return Ok(Box::new(EchoAgent::new()));
    }
    let scenario = deps
        .scenarios
        .get(scenario_id)
        .ok_or_else(|| GatewayError::ScenarioNotFound(scenario_id.to_string()))?;
    Ok(Box::new(ScenarioAgent::new(
        scenario,
        std::time::Duration::from_millis(config.scenario.delay_ms),
    )))
}

fn create_llm_agent(config: &AppConfig, deps: &AgentDeps) -> Result<LlmAgent, GatewayError> {
    let llm = &config.llm;
    if !SUPPORTED_PROVIDERS.contains(&llm.provider.as_str()) {
        return Err(GatewayError::ConfigError(format!(
            "Unsupported LLM provider: {}. Supported providers: {}",
            llm.provider,
            SUPPORTED_PROVIDERS.join(", ")
        )));
    }

    let inner: Arc<dyn CompletionBackend> = match &deps.backend {
        Some(backend) => Arc::clone(backend),
        None => {
            if llm.api_key.trim().is_empty() {
                return Err(GatewayError::ConfigError(format!(
                    "LLM_API_KEY is required for provider \"{}\" (set AGUI__LLM__API_KEY)",
                    llm.provider
                )));
            }
            let client = OpenAiCompatClient::from_config(deps.http.clone(), llm).map_err(|_| {
                GatewayError::ConfigError(format!(
                    "No endpoint configured for provider \"{}\" (set AGUI__LLM__BASE_URL)",
                    llm.provider
                ))
            })?;
            Arc::new(client)
        }
    };
    let backend = Arc::new(RetryingBackend::new(inner, RetryConfig::from_llm(llm)));

    let mut agent = LlmAgent::new(backend, llm);

    if config.mcp_enabled() {
        if let Some(mcp) = &deps.mcp {
            tracing::info!(server_id = mcp.server_id(), "LLM agent created with MCP tools");
            agent = agent.with_external_tools(
                ExternalTools::Mcp(Arc::clone(mcp)),
                config.mcp.tool_call_timeout(),
            );
        }
    }

    if config.a2ui_enabled() {
        tracing::info!(server_url = %config.a2ui.server_url, "LLM agent created with A2UI render tool");
        agent = agent.with_bridge(SurfaceBridgeClient::new(deps.http.clone(), &config.a2ui));
    }

    Ok(agent)
}
