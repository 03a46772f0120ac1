//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 envelopes, server configuration, and the result shapes handed
//! back to collaborators.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
///
/// `result` is `Some(Value::Null)` when the server sent `"result": null`, so a
/// present-but-null result is never confused with an error response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl JsonRpcResponse {
    /// Interpret a decoded JSON value as a response.
    ///
    /// Returns `None` unless the value is an object carrying an `id` key and at
    /// least one of `result` / `error`.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut map) = value else {
            return None;
        };
        if !map.contains_key("id") || !(map.contains_key("result") || map.contains_key("error")) {
            return None;
        }

        Some(Self {
            jsonrpc: map
                .remove("jsonrpc")
                .and_then(|v| v.as_str().map(String::from)),
            id: map.remove("id").unwrap_or(Value::Null),
            result: map.remove("result"),
            error: map.remove("error"),
        })
    }

    /// The numeric request id this response answers, if it has one.
    ///
    /// Accepts numeric strings as well, since some servers echo ids back as text.
    pub fn request_id(&self) -> Option<u64> {
        match &self.id {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

// ─── Configuration ──────────────────────────────────────────────────────────

/// Static description of one tool server.
///
/// The name is fixed at construction; `tools` can only be replaced wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    name: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// When set, `{node_modules_path}/.bin` is prepended to the child's `PATH`.
    #[serde(default)]
    pub node_modules_path: Option<String>,
    #[serde(default)]
    tools: Vec<String>,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_node_modules_path(mut self, path: impl Into<String>) -> Self {
        self.node_modules_path = Some(path.into());
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Known tool names (declared in config or filled in by discovery).
    pub fn tools(&self) -> &[String] {
        &self.tools
    }

    pub(crate) fn replace_tools(&mut self, tools: Vec<String>) {
        self.tools = tools;
    }

    /// Attach the map key a file entry was stored under.
    fn named(mut self, name: String) -> Self {
        self.name = name;
        self
    }
}

/// Top-level `mcp_config.json` document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServersConfig {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

impl McpServersConfig {
    /// Consume the document, yielding each entry with its name attached.
    pub fn into_server_configs(self) -> impl Iterator<Item = ServerConfig> {
        self.servers
            .into_iter()
            .map(|(name, config)| config.named(name))
    }
}

// ─── Tool Results ───────────────────────────────────────────────────────────

/// Where a server's tool list came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolListing {
    /// Statically configured names; nobody has confirmed the server still has them.
    Declared(Vec<String>),
    /// Names reported by `tools/list`. An empty list means "confirmed empty".
    Discovered(Vec<String>),
    /// Discovery produced nothing usable (timeout, inactive server, odd shape).
    Unknown,
}

impl ToolListing {
    pub fn names(&self) -> Option<&[String]> {
        match self {
            Self::Declared(names) | Self::Discovered(names) => Some(names),
            Self::Unknown => None,
        }
    }

    pub fn into_names(self) -> Option<Vec<String>> {
        match self {
            Self::Declared(names) | Self::Discovered(names) => Some(names),
            Self::Unknown => None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Discovered(_))
    }
}

/// Result of a `tools/call` that got an answer.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallOutcome {
    /// The server's `result` payload.
    Success(Value),
    /// The server's `error` payload.
    RemoteError(Value),
}

impl ToolCallOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::RemoteError(_))
    }

    /// Wire-compatible form: the bare result, or `{"error": ...}`.
    pub fn into_value(self) -> Value {
        match self {
            Self::Success(result) => result,
            Self::RemoteError(error) => serde_json::json!({ "error": error }),
        }
    }
}

/// Point-in-time status of one configured server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub name: String,
    pub active: bool,
    pub pid: Option<u32>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub tool_count: usize,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
