//! MCP Client — JSON-RPC over stdio transport for a group of MCP servers.
//!
//! This module handles:
//! - Resolving server configs from JSON files and environment variables
//! - Spawning, supervising, and terminating MCP server child processes
//! - JSON-RPC 2.0 requests over process stdio, correlated by id
//! - Tool discovery and tool calls
//!
//! Collaborators use [`McpClient`]; the other modules are its building blocks.

pub mod client;
pub mod config;
pub mod errors;
pub mod lifecycle;
pub mod supervisor;
pub mod tools;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{ClientOptions, McpClient};
pub use config::ConfigResolver;
pub use errors::McpError;
pub use types::{
    JsonRpcRequest, JsonRpcResponse, McpServersConfig, ServerConfig, ServerStatus,
    ToolCallOutcome, ToolListing,
};
