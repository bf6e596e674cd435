//! 工具层：注册表、带超时的执行器、MCP 远端工具与 surface 渲染工具 Schema

pub mod executor;
pub mod mcp;
pub mod registry;
pub mod schema;

pub use executor::ToolExecutor;
pub use mcp::{McpClient, McpError, McpTool};
pub use registry::{sanitize_tool_name, Tool, ToolOutput, ToolRegistry};
pub use schema::{render_surface_parameters, RenderSurfaceArgs, RENDER_SURFACE_TOOL};
