//! AG-UI 流式网关
//!
//! 入口：加载配置、初始化日志、加载场景目录，启动 HTTP 服务直到 Ctrl+C / SIGTERM。
//!
//! ```text
//! agui-gateway [--use-llm | --emulated] [--config <path>]
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use agui_gateway::config::load_config;
use agui_gateway::core::{ShutdownManager, ShutdownReason};
use agui_gateway::gateway::{AppState, Hub};
use agui_gateway::observability;
use agui_gateway::scenario::ScenarioCatalog;
use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from);

    let mut config = load_config(config_path).context("Failed to load config")?;
    config.apply_cli_args(&args);

    observability::init();

    let scenarios = ScenarioCatalog::load_dir(&config.scenario.dir)
        .with_context(|| format!("Failed to load scenarios from {}", config.scenario.dir.display()))?;

    tracing::info!(
        mode = ?config.agent.mode,
        extension = ?config.extension.mode,
        default_scenario = %config.agent.default_scenario,
        "starting AG-UI gateway"
    );

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let hub = Hub::new(AppState::new(config, scenarios), shutdown.token());
    if let Err(e) = hub.run().await {
        shutdown.trigger(ShutdownReason::Fatal(e.to_string()));
        return Err(e).context("Gateway failed");
    }

    if let Some(reason) = shutdown.reason() {
        tracing::info!(%reason, "shutdown complete");
    }
    Ok(())
}
