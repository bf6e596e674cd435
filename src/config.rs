//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AGUI__*` 覆盖（双下划线表示嵌套，如 `AGUI__LLM__API_KEY=sk-...`）。
//! 命令行 `--use-llm` / `--emulated` 最后覆盖 `agent.mode`。

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub sse: SseSection,
    pub session: SessionSection,
    pub agent: AgentSection,
    pub scenario: ScenarioSection,
    pub llm: LlmSection,
    pub extension: ExtensionSection,
    pub mcp: McpSection,
    pub a2ui: A2uiSection,
}

/// [server] 段：监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerSection {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// [sse] 段：客户端重连间隔与心跳间隔（毫秒）
#[derive(Debug, Clone, Deserialize)]
pub struct SseSection {
    #[serde(default = "default_retry_ms")]
    pub retry_ms: u64,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
}

fn default_retry_ms() -> u64 {
    3000
}

fn default_heartbeat_ms() -> u64 {
    30_000
}

impl Default for SseSection {
    fn default() -> Self {
        Self {
            retry_ms: default_retry_ms(),
            heartbeat_ms: default_heartbeat_ms(),
        }
    }
}

impl SseSection {
    pub fn retry(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.max(1))
    }
}

/// [session] 段：会话 TTL、连接空闲阈值与清扫周期（毫秒）
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_session_max_age_ms")]
    pub max_age_ms: u64,
    #[serde(default = "default_connection_idle_ms")]
    pub connection_idle_ms: u64,
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

fn default_session_max_age_ms() -> u64 {
    60 * 60 * 1000
}

fn default_connection_idle_ms() -> u64 {
    5 * 60 * 1000
}

fn default_cleanup_interval_ms() -> u64 {
    10 * 60 * 1000
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_age_ms: default_session_max_age_ms(),
            connection_idle_ms: default_connection_idle_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

impl SessionSection {
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }

    pub fn connection_idle(&self) -> Duration {
        Duration::from_millis(self.connection_idle_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms.max(1))
    }
}

/// Agent 运行模式：场景回放或真实 LLM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    #[default]
    Emulated,
    Llm,
}

/// [agent] 段
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default)]
    pub mode: AgentMode,
    /// 未通过 forwardedProps.scenarioId 指定时使用的场景
    #[serde(default = "default_scenario_id")]
    pub default_scenario: String,
}

fn default_scenario_id() -> String {
    "tool-call".to_string()
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            mode: AgentMode::default(),
            default_scenario: default_scenario_id(),
        }
    }
}

/// [scenario] 段：场景目录与事件间隔
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioSection {
    #[serde(default = "default_scenario_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_scenario_delay_ms")]
    pub delay_ms: u64,
}

fn default_scenario_dir() -> PathBuf {
    PathBuf::from("./scenarios")
}

fn default_scenario_delay_ms() -> u64 {
    200
}

impl Default for ScenarioSection {
    fn default() -> Self {
        Self {
            dir: default_scenario_dir(),
            delay_ms: default_scenario_delay_ms(),
        }
    }
}

/// [llm] 段：OpenAI 兼容后端
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// openai / deepseek / siliconflow / litellm / custom
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    /// 未设置时按 provider 取默认地址
    pub base_url: Option<String>,
    /// 单次 completion 调用超时
    #[serde(default = "default_llm_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// 工具调用循环的最大轮数
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    /// 整个 run 的总预算
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_llm_timeout_ms() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_max_rounds() -> usize {
    5
}

fn default_run_timeout_ms() -> u64 {
    5 * 60 * 1000
}

fn default_temperature() -> f32 {
    0.7
}

fn default_system_prompt() -> String {
    "You are a helpful assistant. When tools are available, call them only when the user \
     explicitly requests the corresponding functionality. Do not invoke tools for simple \
     greetings, general questions, or conversational responses."
        .to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: String::new(),
            base_url: None,
            timeout_ms: default_llm_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_rounds: default_max_rounds(),
            run_timeout_ms: default_run_timeout_ms(),
            temperature: default_temperature(),
            system_prompt: default_system_prompt(),
        }
    }
}

/// 已知 provider 的默认端点
pub fn provider_default_url(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("https://api.openai.com/v1"),
        "deepseek" => Some("https://api.deepseek.com/v1"),
        "siliconflow" => Some("https://api.siliconflow.cn/v1"),
        "litellm" => Some("http://localhost:4000/v1"),
        _ => None,
    }
}

pub const SUPPORTED_PROVIDERS: &[&str] = &["openai", "deepseek", "siliconflow", "litellm", "custom"];

impl LlmSection {
    /// 显式 base_url 优先，否则取 provider 默认地址；末尾 `/` 去掉
    pub fn endpoint(&self) -> Option<String> {
        self.base_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .or_else(|| provider_default_url(&self.provider))
            .map(|u| u.trim_end_matches('/').to_string())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }
}

/// 扩展能力：MCP-UI 工具或 A2UI surface 桥接
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionMode {
    #[default]
    None,
    Mcpui,
    A2ui,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ExtensionSection {
    #[serde(default)]
    pub mode: ExtensionMode,
}

/// [mcp] 段：外部工具服务（streamable HTTP）
#[derive(Debug, Clone, Deserialize)]
pub struct McpSection {
    #[serde(default = "default_mcp_url")]
    pub server_url: String,
    #[serde(default = "default_mcp_server_id")]
    pub server_id: String,
    #[serde(default = "default_mcp_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_mcp_tool_call_timeout_ms")]
    pub tool_call_timeout_ms: u64,
}

fn default_mcp_url() -> String {
    "http://localhost:3100/mcp".to_string()
}

fn default_mcp_server_id() -> String {
    "mcpui-test-server".to_string()
}

fn default_mcp_connect_timeout_ms() -> u64 {
    5000
}

fn default_mcp_tool_call_timeout_ms() -> u64 {
    30_000
}

impl Default for McpSection {
    fn default() -> Self {
        Self {
            server_url: default_mcp_url(),
            server_id: default_mcp_server_id(),
            connect_timeout_ms: default_mcp_connect_timeout_ms(),
            tool_call_timeout_ms: default_mcp_tool_call_timeout_ms(),
        }
    }
}

impl McpSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn tool_call_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_call_timeout_ms)
    }
}

/// [a2ui] 段：surface 渲染协议服务
#[derive(Debug, Clone, Deserialize)]
pub struct A2uiSection {
    #[serde(default = "default_a2ui_url")]
    pub server_url: String,
    #[serde(default = "default_a2ui_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_surface_id")]
    pub default_surface_id: String,
}

fn default_a2ui_url() -> String {
    "http://localhost:3200".to_string()
}

fn default_a2ui_timeout_ms() -> u64 {
    60_000
}

fn default_surface_id() -> String {
    "main".to_string()
}

impl Default for A2uiSection {
    fn default() -> Self {
        Self {
            server_url: default_a2ui_url(),
            timeout_ms: default_a2ui_timeout_ms(),
            default_surface_id: default_surface_id(),
        }
    }
}

impl A2uiSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl AppConfig {
    pub fn mcp_enabled(&self) -> bool {
        self.extension.mode == ExtensionMode::Mcpui
    }

    pub fn a2ui_enabled(&self) -> bool {
        self.extension.mode == ExtensionMode::A2ui
    }

    /// 命令行覆盖：`--use-llm` / `--emulated`
    pub fn apply_cli_args<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            match arg.as_ref() {
                "--use-llm" => self.agent.mode = AgentMode::Llm,
                "--emulated" => self.agent.mode = AgentMode::Emulated,
                _ => {}
            }
        }
    }
}

/// 从 config 目录加载配置，环境变量 AGUI__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AGUI__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AGUI")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.port, 3000);
        assert_eq!(cfg.sse.retry_ms, 3000);
        assert_eq!(cfg.session.max_age(), Duration::from_secs(3600));
        assert_eq!(cfg.session.connection_idle(), Duration::from_secs(300));
        assert_eq!(cfg.session.cleanup_interval(), Duration::from_secs(600));
        assert_eq!(cfg.agent.mode, AgentMode::Emulated);
        assert_eq!(cfg.agent.default_scenario, "tool-call");
        assert_eq!(cfg.llm.max_retries, 2);
        assert_eq!(cfg.extension.mode, ExtensionMode::None);
        assert_eq!(cfg.a2ui.default_surface_id, "main");
    }

    #[test]
    fn test_endpoint_resolution() {
        let mut llm = LlmSection::default();
        assert_eq!(llm.endpoint().as_deref(), Some("https://api.deepseek.com/v1"));
        llm.base_url = Some("http://127.0.0.1:9999/v1/".into());
        assert_eq!(llm.endpoint().as_deref(), Some("http://127.0.0.1:9999/v1"));
        llm.base_url = None;
        llm.provider = "custom".into();
        assert_eq!(llm.endpoint(), None);
    }

    #[test]
    fn test_cli_overrides_mode() {
        let mut cfg = AppConfig::default();
        cfg.apply_cli_args(["agui-gateway", "--use-llm"]);
        assert_eq!(cfg.agent.mode, AgentMode::Llm);
        cfg.apply_cli_args(["--emulated"]);
        assert_eq!(cfg.agent.mode, AgentMode::Emulated);
    }

    #[test]
    fn test_load_from_file_keeps_unset_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[agent]\nmode = \"llm\"\n\n[extension]\nmode = \"a2ui\"\n\n[llm]\nmodel = \"gpt-4o-mini\"\nprovider = \"openai\""
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.agent.mode, AgentMode::Llm);
        assert!(cfg.a2ui_enabled());
        assert_eq!(cfg.llm.model, "gpt-4o-mini");
        assert_eq!(cfg.llm.timeout_ms, 60_000);
        assert_eq!(cfg.agent.default_scenario, "tool-call");
    }
}
