//! 合成的 surface 渲染工具（schemars 自动生成参数 Schema）
//!
//! 开启 A2UI 扩展时，LLM 会多看到一个 `generateA2UI` 工具；调用它即把参数里的
//! 描述转交给 surface 桥接服务，由桥接服务生成界面。

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;

pub const RENDER_SURFACE_TOOL: &str = "generateA2UI";

pub const RENDER_SURFACE_DESCRIPTION: &str = "Generate an interactive UI (forms, cards, lists, \
    buttons) for the user. Call this only when the user explicitly asks for a UI, a form or \
    another visual, interactive element.";

/// 渲染工具的参数
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct RenderSurfaceArgs {
    /// 对要生成的界面的自然语言描述
    pub message: String,
}

impl RenderSurfaceArgs {
    /// 宽松解析：参数缺失或不是合法 JSON 时退回空描述
    pub fn parse(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "render surface args are not valid JSON");
            Self::default()
        })
    }
}

/// 参数 JSON Schema（去掉 `$schema` / `title` 等 provider 不需要的顶层字段）
pub fn render_surface_parameters() -> Value {
    let schema = schema_for!(RenderSurfaceArgs);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| Value::Null);
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}
