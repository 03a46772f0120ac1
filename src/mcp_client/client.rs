//! MCP Client — high-level interface over every configured server.
//!
//! Owns the resolved server configs and the process supervisor, and exposes
//! the start/stop/call/list operations collaborators use. Failures for one
//! server are logged and reported as `false` / `None`; they never affect other
//! servers.
//!
//! The caller owns the client. `shutdown().await` is the orderly exit; if the
//! client is dropped instead, every remaining child process is killed.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;

use super::config::ConfigResolver;
use super::errors::McpError;
use super::lifecycle::SHUTDOWN_TIMEOUT;
use super::supervisor::ProcessSupervisor;
use super::tools;
use super::types::{JsonRpcResponse, ServerConfig, ServerStatus, ToolCallOutcome, ToolListing};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for `rpc_request` and tool calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for `tools/list` discovery.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

// ─── ClientOptions ───────────────────────────────────────────────────────────

/// Bootstrap options for [`McpClient::initialize`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Extra config file applied after the home and workspace files.
    pub config_path: Option<PathBuf>,
    /// Start every configured server once configs are resolved.
    pub autostart: bool,
    /// After autostart, replace each server's tool list with discovered names.
    pub refresh_tools: bool,
    pub request_timeout: Duration,
    pub discovery_timeout: Duration,
    pub grace_period: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            config_path: None,
            autostart: false,
            refresh_tools: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            grace_period: SHUTDOWN_TIMEOUT,
        }
    }
}

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Coordinates configuration, process supervision, and tool traffic.
pub struct McpClient {
    configs: RwLock<HashMap<String, ServerConfig>>,
    supervisor: ProcessSupervisor,
    request_timeout: Duration,
    discovery_timeout: Duration,
}

impl McpClient {
    /// Create a client over already-resolved server configs. Nothing is started.
    pub fn new(configs: HashMap<String, ServerConfig>) -> Self {
        Self {
            configs: RwLock::new(configs),
            supervisor: ProcessSupervisor::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }

    /// Resolve configs from every default source, then optionally autostart.
    pub async fn initialize(options: ClientOptions) -> Self {
        let mut resolver = ConfigResolver::new();
        if let Some(path) = &options.config_path {
            resolver = resolver.with_config_path(path);
        }
        Self::initialize_with(resolver.resolve(), options).await
    }

    /// Like [`initialize`](Self::initialize), over configs resolved elsewhere.
    pub async fn initialize_with(configs: HashMap<String, ServerConfig>, options: ClientOptions) -> Self {
        let mut client = Self::new(configs);
        client.set_request_timeout(options.request_timeout);
        client.set_discovery_timeout(options.discovery_timeout);
        client.set_grace_period(options.grace_period);

        if options.autostart {
            let results = client.start_all().await;
            let started = results.values().filter(|ok| **ok).count();
            tracing::info!(
                started,
                failed = results.len() - started,
                "MCP servers autostarted"
            );
            if options.refresh_tools {
                client.refresh_tools(client.discovery_timeout).await;
            }
        }
        client
    }

    pub fn set_request_timeout(&mut self, timeout: Duration) {
        self.request_timeout = timeout;
    }

    pub fn set_discovery_timeout(&mut self, timeout: Duration) {
        self.discovery_timeout = timeout;
    }

    pub fn set_grace_period(&mut self, grace: Duration) {
        self.supervisor.set_grace_period(grace);
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    // ─── Configuration ───────────────────────────────────────────────────

    /// Names of all configured servers, sorted.
    pub fn list_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs_read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_server_config(&self, name: &str) -> Option<ServerConfig> {
        self.configs_read().get(name).cloned()
    }

    /// Add or wholesale-replace a server config. A running process is unaffected.
    pub fn upsert_server_config(&self, config: ServerConfig) {
        self.configs_write().insert(config.name().to_string(), config);
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Names of servers with a live process entry, sorted.
    pub fn list_active_servers(&self) -> Vec<String> {
        self.supervisor.active_names()
    }

    pub fn is_server_running(&self, name: &str) -> bool {
        self.supervisor.is_active(name)
    }

    pub fn server_pid(&self, name: &str) -> Option<u32> {
        self.supervisor.get(name).and_then(|server| server.pid())
    }

    /// Start one server. `true` if it is running afterwards.
    pub async fn start_server(&self, name: &str) -> bool {
        let Some(config) = self.get_server_config(name) else {
            let err = McpError::NotConfigured { name: name.to_string() };
            tracing::error!(error = %err, "cannot start server");
            return false;
        };

        match self.supervisor.start(&config) {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(server = %name, error = %e, "failed to start server");
                false
            }
        }
    }

    /// Stop one server. `true` if it is not running afterwards.
    pub async fn stop_server(&self, name: &str) -> bool {
        match self.supervisor.stop(name).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(server = %name, error = %e, "failed to stop server");
                false
            }
        }
    }

    /// Start every configured server; one failure never prevents the others.
    pub async fn start_all(&self) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        for name in self.list_servers() {
            let ok = self.start_server(&name).await;
            results.insert(name, ok);
        }
        results
    }

    /// Stop every active server concurrently.
    pub async fn stop_all(&self) -> BTreeMap<String, bool> {
        let names = self.list_active_servers();
        let outcomes = join_all(names.iter().map(|name| self.stop_server(name))).await;
        names.into_iter().zip(outcomes).collect()
    }

    /// Per-server status for every configured server, sorted by name.
    pub fn server_status(&self) -> Vec<ServerStatus> {
        let configs = self.configs_read();
        let mut statuses: Vec<ServerStatus> = configs
            .values()
            .map(|config| {
                let running = self.supervisor.get(config.name());
                ServerStatus {
                    name: config.name().to_string(),
                    active: running.is_some(),
                    pid: running.as_ref().and_then(|s| s.pid()),
                    started_at: running.as_ref().map(|s| s.started_at()),
                    tool_count: config.tools().len(),
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Orderly teardown: cancel readers, stop every server, wait for readers.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down MCP client");
        self.supervisor.begin_shutdown();
        let results = self.stop_all().await;
        for (name, ok) in &results {
            if !ok {
                tracing::warn!(server = %name, "server did not stop cleanly during shutdown");
            }
        }
        self.supervisor.wait_for_readers().await;
        tracing::info!("MCP client shutdown complete");
    }

    // ─── Messaging ───────────────────────────────────────────────────────

    /// Write one raw JSON-RPC message to a server's stdin.
    pub async fn send_message(&self, name: &str, message: &Value) -> bool {
        let Some(server) = self.supervisor.get(name) else {
            tracing::error!(error = %not_running(name), "cannot send message");
            return false;
        };

        match server.transport.send(message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(server = %name, error = %e, "failed to send message");
                false
            }
        }
    }

    /// Send a request and wait up to `timeout` for the response with its id.
    ///
    /// `None` if the server is not running, the write fails, the server's
    /// output closes, or the deadline passes.
    pub async fn rpc_request(
        &self,
        name: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Option<JsonRpcResponse> {
        let Some(server) = self.supervisor.get(name) else {
            tracing::error!(error = %not_running(name), method, "cannot send request");
            return None;
        };

        match server.transport.request(method, params, timeout).await {
            Ok(response) => Some(response),
            Err(e @ McpError::Timeout { .. }) => {
                tracing::warn!(server = %name, error = %e, "no response before deadline");
                None
            }
            Err(e) => {
                tracing::error!(server = %name, method, error = %e, "request failed");
                None
            }
        }
    }

    // ─── Tools ───────────────────────────────────────────────────────────

    /// Where this server's tool names come from, and what they are.
    ///
    /// Config-declared names are returned without any I/O.
    pub async fn tool_listing(&self, name: &str, timeout: Duration) -> ToolListing {
        if let Some(declared) = self.get_server_config(name).as_ref().and_then(tools::declared_tools) {
            return declared;
        }

        match self.supervisor.get(name) {
            Some(server) => tools::discover(&server.transport, timeout).await,
            None => {
                tracing::debug!(server = %name, "server not running, tools unknown");
                ToolListing::Unknown
            }
        }
    }

    /// Tool names for a server, or `None` when they cannot be determined.
    pub async fn discover_tools(&self, name: &str, timeout: Duration) -> Option<Vec<String>> {
        self.tool_listing(name, timeout).await.into_names()
    }

    pub async fn list_tools(&self, name: &str, timeout: Duration) -> Option<Vec<String>> {
        self.discover_tools(name, timeout).await
    }

    /// Discover tools on every active server and store them on its config.
    ///
    /// Servers whose tools cannot be determined get an empty list.
    pub async fn refresh_tools(&self, timeout: Duration) -> BTreeMap<String, Vec<String>> {
        let names = self.list_active_servers();
        let listings = join_all(names.iter().map(|name| self.discover_tools(name, timeout))).await;

        let mut discovered = BTreeMap::new();
        let mut configs = self.configs_write();
        for (name, tools) in names.into_iter().zip(listings) {
            let tools = tools.unwrap_or_default();
            if let Some(config) = configs.get_mut(&name) {
                config.replace_tools(tools.clone());
            }
            discovered.insert(name, tools);
        }
        discovered
    }

    /// Call a tool using the client's request timeout.
    pub async fn call_tool(&self, name: &str, tool_name: &str, arguments: Value) -> Option<ToolCallOutcome> {
        self.call_tool_with_timeout(name, tool_name, arguments, self.request_timeout)
            .await
    }

    /// Call a tool. `None` means no answer; a server-side error is `Some(RemoteError)`.
    pub async fn call_tool_with_timeout(
        &self,
        name: &str,
        tool_name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Option<ToolCallOutcome> {
        let Some(server) = self.supervisor.get(name) else {
            tracing::error!(error = %not_running(name), tool = %tool_name, "cannot call tool");
            return None;
        };

        match tools::call(&server.transport, tool_name, arguments, timeout).await {
            Ok(outcome) => {
                if outcome.is_error() {
                    tracing::warn!(server = %name, tool = %tool_name, "tool call returned an error");
                }
                Some(outcome)
            }
            Err(e) => {
                tracing::error!(server = %name, tool = %tool_name, error = %e, "tool call failed");
                None
            }
        }
    }

    fn configs_read(&self) -> RwLockReadGuard<'_, HashMap<String, ServerConfig>> {
        self.configs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn configs_write(&self) -> RwLockWriteGuard<'_, HashMap<String, ServerConfig>> {
        self.configs.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn not_running(name: &str) -> McpError {
    McpError::NotRunning {
        name: name.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
