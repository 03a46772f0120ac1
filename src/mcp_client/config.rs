//! Server configuration resolution.
//!
//! Sources, lowest precedence first:
//! 1. `~/.mcp-group/mcp_config.json`
//! 2. `./mcp_config.json`
//! 3. an explicitly supplied config file
//! 4. `MCP_SERVERS` + `MCP_SERVER_{NAME}_*` environment variables
//!
//! A later source replaces a same-named entry wholesale; fields never merge.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use super::errors::McpError;
use super::types::{McpServersConfig, ServerConfig};

// ─── Constants ───────────────────────────────────────────────────────────────

/// File name looked up in the home config directory and the working directory.
pub const CONFIG_FILE_NAME: &str = "mcp_config.json";

/// Directory under `$HOME` holding the user-level config.
pub const HOME_CONFIG_DIR: &str = ".mcp-group";

/// Comma-separated list of server names.
pub const SERVERS_ENV_VAR: &str = "MCP_SERVERS";

const SERVER_ENV_PREFIX: &str = "MCP_SERVER_";

// ─── ConfigResolver ──────────────────────────────────────────────────────────

/// Accumulates server configs from every source in precedence order.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    home_dir: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    explicit_path: Option<PathBuf>,
    servers: HashMap<String, ServerConfig>,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigResolver {
    /// Resolver rooted at the real home and current directories.
    pub fn new() -> Self {
        Self {
            home_dir: dirs::home_dir(),
            working_dir: std::env::current_dir().ok(),
            explicit_path: None,
            servers: HashMap::new(),
        }
    }

    pub fn with_home_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.home_dir = Some(dir.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit_path = Some(path.into());
        self
    }

    /// Config files in the order they are applied.
    pub fn candidate_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(3);
        if let Some(home) = &self.home_dir {
            paths.push(home.join(HOME_CONFIG_DIR).join(CONFIG_FILE_NAME));
        }
        if let Some(cwd) = &self.working_dir {
            paths.push(cwd.join(CONFIG_FILE_NAME));
        }
        if let Some(explicit) = &self.explicit_path {
            paths.push(explicit.clone());
        }
        paths
    }

    /// Servers accumulated so far.
    pub fn servers(&self) -> &HashMap<String, ServerConfig> {
        &self.servers
    }

    /// Apply every source against the real process environment.
    pub fn resolve(self) -> HashMap<String, ServerConfig> {
        self.resolve_with_env(|key| std::env::var(key).ok())
    }

    /// Apply every source, reading environment variables through `lookup`.
    pub fn resolve_with_env<F>(mut self, lookup: F) -> HashMap<String, ServerConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        for path in self.candidate_paths() {
            self.load_json_file(&path);
        }
        self.load_env_from(lookup);

        tracing::info!(
            server_count = self.servers.len(),
            servers = ?self.servers.keys().collect::<Vec<_>>(),
            "resolved MCP server config"
        );
        self.servers
    }

    /// Load one JSON config file, replacing same-named entries.
    ///
    /// A missing file is skipped quietly; an unreadable or malformed one is
    /// logged and skipped. Returns how many entries were applied.
    pub fn load_json_file(&mut self, path: &Path) -> usize {
        match read_config_file(path) {
            Ok(Some(doc)) => {
                let mut applied = 0;
                for config in doc.into_server_configs() {
                    tracing::info!(
                        server = %config.name(),
                        path = %path.display(),
                        "loaded MCP server config from file"
                    );
                    self.insert(config);
                    applied += 1;
                }
                applied
            }
            Ok(None) => {
                tracing::debug!(path = %path.display(), "no MCP config file");
                0
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "skipping MCP config file");
                0
            }
        }
    }

    /// Load servers named by `MCP_SERVERS` from the process environment.
    pub fn load_env(&mut self) -> usize {
        self.load_env_from(|key| std::env::var(key).ok())
    }

    /// Load servers named by `MCP_SERVERS`, reading variables through `lookup`.
    ///
    /// A server without a `_COMMAND` variable is skipped with a warning.
    pub fn load_env_from<F>(&mut self, lookup: F) -> usize
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(list) = lookup(SERVERS_ENV_VAR).filter(|s| !s.trim().is_empty()) else {
            tracing::debug!("no {SERVERS_ENV_VAR} environment variable");
            return 0;
        };

        let mut applied = 0;
        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if let Some(config) = server_from_env(name, &lookup) {
                tracing::info!(server = %name, "loaded MCP server config from environment");
                self.insert(config);
                applied += 1;
            }
        }
        applied
    }

    fn insert(&mut self, config: ServerConfig) {
        self.servers.insert(config.name().to_string(), config);
    }
}

// ─── Sources ─────────────────────────────────────────────────────────────────

/// Read and parse a config file. `Ok(None)` means the file does not exist.
fn read_config_file(path: &Path) -> Result<Option<McpServersConfig>, McpError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(McpError::ConfigError {
                reason: format!("failed to read {}: {e}", path.display()),
            })
        }
    };

    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })
}

/// `my-server` → `MCP_SERVER_MY_SERVER`.
pub fn env_prefix(server_name: &str) -> String {
    format!(
        "{SERVER_ENV_PREFIX}{}",
        server_name.to_uppercase().replace('-', "_")
    )
}

fn server_from_env<F>(name: &str, lookup: &F) -> Option<ServerConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let prefix = env_prefix(name);

    let Some(command) = lookup(&format!("{prefix}_COMMAND")).filter(|c| !c.is_empty()) else {
        tracing::warn!(
            server = %name,
            variable = %format!("{prefix}_COMMAND"),
            "no command for MCP server, skipping"
        );
        return None;
    };

    let args_var = format!("{prefix}_ARGS");
    let args = match lookup(&args_var) {
        Some(raw) => serde_json::from_str::<Vec<String>>(&raw).unwrap_or_else(|e| {
            tracing::error!(variable = %args_var, value = %raw, error = %e, "invalid JSON args");
            Vec::new()
        }),
        None => Vec::new(),
    };

    let env_var = format!("{prefix}_ENV");
    let env = match lookup(&env_var) {
        Some(raw) => parse_env_object(&raw).unwrap_or_else(|e| {
            tracing::error!(variable = %env_var, value = %raw, error = %e, "invalid JSON env");
            HashMap::new()
        }),
        None => HashMap::new(),
    };

    let mut config = ServerConfig::new(name, command);
    config.args = args;
    config.env = env;
    config.node_modules_path = lookup(&format!("{prefix}_NODE_MODULES")).filter(|p| !p.is_empty());
    Some(config)
}

/// Parse a JSON object of env vars; scalar values are stringified.
fn parse_env_object(raw: &str) -> Result<HashMap<String, String>, String> {
    let value: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    let Value::Object(map) = value else {
        return Err("expected a JSON object".into());
    };

    map.into_iter()
        .map(|(key, value)| match value {
            Value::String(s) => Ok((key, s)),
            Value::Number(n) => Ok((key, n.to_string())),
            Value::Bool(b) => Ok((key, b.to_string())),
            other => Err(format!("value for '{key}' is not a scalar: {other}")),
        })
        .collect()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
