//! Tool discovery and invocation on top of the stdio transport.

use std::time::Duration;

use serde_json::{json, Value};

use super::errors::McpError;
use super::transport::StdioTransport;
use super::types::{ServerConfig, ToolCallOutcome, ToolListing};

pub const TOOLS_LIST_METHOD: &str = "tools/list";
pub const TOOLS_CALL_METHOD: &str = "tools/call";

/// Config-declared tools, if the config lists any.
pub fn declared_tools(config: &ServerConfig) -> Option<ToolListing> {
    if config.tools().is_empty() {
        None
    } else {
        Some(ToolListing::Declared(config.tools().to_vec()))
    }
}

/// Ask the server for its tools with `tools/list`.
///
/// Anything short of a `result` carrying a `tools` array is `Unknown`.
pub async fn discover(transport: &StdioTransport, timeout: Duration) -> ToolListing {
    let response = match transport.request(TOOLS_LIST_METHOD, json!({}), timeout).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(error = %e, "tool discovery failed");
            return ToolListing::Unknown;
        }
    };

    match response.result.as_ref().and_then(tool_names) {
        Some(names) => ToolListing::Discovered(names),
        None => {
            tracing::debug!(response = ?response, "tools/list response has no tools array");
            ToolListing::Unknown
        }
    }
}

/// Extract tool names from a `tools/list` result.
///
/// Entries may be plain strings or objects with a `name` (or `tool`) field;
/// anything else is skipped.
pub fn tool_names(result: &Value) -> Option<Vec<String>> {
    let tools = result.get("tools")?.as_array()?;
    let names = tools
        .iter()
        .filter_map(|entry| match entry {
            Value::String(name) => Some(name.as_str()),
            Value::Object(obj) => ["name", "tool"]
                .iter()
                .filter_map(|key| obj.get(*key).and_then(Value::as_str))
                .find(|name| !name.is_empty()),
            _ => None,
        })
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect();
    Some(names)
}

/// Invoke `tool_name` with `tools/call`.
///
/// A server-reported `error` comes back as `RemoteError`, not as `Err`.
pub async fn call(
    transport: &StdioTransport,
    tool_name: &str,
    arguments: Value,
    timeout: Duration,
) -> Result<ToolCallOutcome, McpError> {
    let params = json!({
        "name": tool_name,
        "arguments": arguments,
    });

    let response = transport.request(TOOLS_CALL_METHOD, params, timeout).await?;
    Ok(match response.error {
        Some(error) => ToolCallOutcome::RemoteError(error),
        None => ToolCallOutcome::Success(response.result.unwrap_or(Value::Null)),
    })
}
