//! MCP tool orchestration: the tool registry with 4-level availability
//! filtering and the multi-turn agent loop that expands model tool-calls.

pub mod agent;
pub mod registry;

pub use registry::{McpClientConfig, McpConfig, McpToolManager, ToolHandler};
