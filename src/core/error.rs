//! 网关错误类型
//!
//! 请求级错误（校验失败、配置缺失、未知场景）在 run 开始前返回，映射为普通 HTTP 错误响应；
//! run 开始后的错误一律转为 `RUN_ERROR` 事件，不经过这里的 `IntoResponse`。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Scenario not found: {0}")]
    ScenarioNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// 推送通道已关闭或不存在
    #[error("Transport closed for session {0}")]
    TransportClosed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::ScenarioNotFound(_) => "scenario_not_found",
            GatewayError::SessionNotFound(_) => "session_not_found",
            GatewayError::ConfigError(_) => "config_error",
            GatewayError::ToolExecutionFailed(_) => "tool_failed",
            GatewayError::ToolTimeout(_) => "tool_timeout",
            GatewayError::UnknownTool(_) => "unknown_tool",
            GatewayError::TransportClosed(_) => "transport_closed",
            GatewayError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::ScenarioNotFound(_) | GatewayError::SessionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::TransportClosed(_) => StatusCode::GONE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), "{}", self);
        } else {
            tracing::warn!(code = self.code(), "{}", self);
        }
        let body = Json(serde_json::json!({
            "error": { "code": self.code(), "message": self.to_string() }
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::InvalidRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::ScenarioNotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::ConfigError("LLM_API_KEY".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
