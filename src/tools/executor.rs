//! 工具执行器：单次调用超时 + 审计日志
//!
//! LLM 循环里服务端工具（MCP 远端工具）都经这里调用。失败不会中断 run，
//! 调用方把 `GatewayError` 折叠成 `[Tool Error]` 工具结果回填给模型。

use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::GatewayError;
use crate::tools::{ToolOutput, ToolRegistry};

/// 工具执行器：对每次调用施加超时，并将结果映射为 GatewayError
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// 执行指定工具；超时返回 ToolTimeout，工具返回 Err 则转为 ToolExecutionFailed，未注册返回 UnknownTool
    pub async fn execute(
        &self,
        tool_name: &str,
        args: serde_json::Value,
    ) -> Result<ToolOutput, GatewayError> {
        if !self.registry.contains(tool_name) {
            return Err(GatewayError::UnknownTool(tool_name.to_string()));
        }

        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(self.timeout, self.registry.execute(tool_name, args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(GatewayError::ToolExecutionFailed(e)),
            Err(_) => Err(GatewayError::ToolTimeout(format!(
                "{} after {}ms",
                tool_name,
                self.timeout.as_millis()
            ))),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
