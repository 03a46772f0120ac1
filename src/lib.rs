pub mod logging;
pub mod mcp_client;

pub use logging::init_tracing;
pub use mcp_client::{
    ClientOptions, ConfigResolver, McpClient, McpError, ServerConfig, ServerStatus,
    ToolCallOutcome, ToolListing,
};
