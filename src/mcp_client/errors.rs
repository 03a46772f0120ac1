//! MCP client error types.
//!
//! These never escape the public `McpClient` facade: it turns them into the
//! boolean / `Option` results its callers expect and logs them on the way.

use thiserror::Error;

/// Errors that can occur inside the supervisor, transport, and correlator.
#[derive(Debug, Error)]
pub enum McpError {
    /// No configuration exists for the requested server.
    #[error("server '{name}' is not configured")]
    NotConfigured {
        name: String,
    },

    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The server has no live process.
    #[error("server '{name}' is not running")]
    NotRunning {
        name: String,
    },

    /// Writing to the server's stdin failed (serialization or I/O).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// No matching response arrived before the deadline.
    #[error("request '{method}' to '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// The server's stdout closed while (or before) a request was waiting.
    #[error("response channel for server '{server}' is closed")]
    ChannelClosed {
        server: String,
    },

    /// Configuration error (unreadable or malformed config source).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// Terminating or reaping the server process failed.
    #[error("failed to stop server '{name}': {reason}")]
    StopFailed {
        name: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_method_and_server() {
        let err = McpError::Timeout {
            server: "echo-srv".into(),
            method: "tools/list".into(),
            timeout_ms: 250,
        };
        assert_eq!(
            err.to_string(),
            "request 'tools/list' to 'echo-srv' timed out after 250ms"
        );
    }

    #[test]
    fn test_not_configured_message() {
        let err = McpError::NotConfigured { name: "ghost".into() };
        assert_eq!(err.to_string(), "server 'ghost' is not configured");
    }
}
