//! Table of live server processes.
//!
//! One entry per server name, each owning its process, transport, and reader
//! tasks. Removing an entry is the only cleanup path. Servers never share a
//! lock beyond the brief table lookup, so traffic to one server cannot block
//! another.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::errors::McpError;
use super::lifecycle::{self, ManagedServer, SHUTDOWN_TIMEOUT};
use super::types::ServerConfig;

/// Result of a successful `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

/// Owns every running server process and the tasks draining their output.
pub struct ProcessSupervisor {
    active: Mutex<HashMap<String, Arc<ManagedServer>>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    grace_period: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            grace_period: SHUTDOWN_TIMEOUT,
        }
    }

    /// How long `stop` waits after SIGTERM before killing.
    pub fn set_grace_period(&mut self, grace: Duration) {
        self.grace_period = grace;
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Spawn `config`'s process unless one is already registered under its name.
    pub fn start(&self, config: &ServerConfig) -> Result<StartOutcome, McpError> {
        let name = config.name();
        if self.shutdown.is_cancelled() {
            return Err(McpError::SpawnFailed {
                name: name.to_string(),
                reason: "client is shutting down".into(),
            });
        }

        // Held across the spawn so concurrent starts of one name spawn once.
        let mut active = self.table();
        if active.contains_key(name) {
            tracing::warn!(server = %name, "server already running");
            return Ok(StartOutcome::AlreadyRunning);
        }

        let server = lifecycle::spawn_server(config, &self.shutdown, &self.tracker)?;
        tracing::info!(server = %name, pid = ?server.pid(), command = %config.command, "started MCP server");
        active.insert(name.to_string(), Arc::new(server));
        Ok(StartOutcome::Started)
    }

    /// Terminate and unregister a server. A server that is not running is a no-op.
    ///
    /// If termination fails the entry is put back so the stop can be retried.
    pub async fn stop(&self, name: &str) -> Result<(), McpError> {
        let Some(server) = self.table().remove(name) else {
            tracing::warn!(server = %name, "server not running");
            return Ok(());
        };

        match server.shutdown(self.grace_period).await {
            Ok(()) => {
                tracing::info!(server = %name, "stopped MCP server");
                Ok(())
            }
            Err(e) => {
                self.table().entry(name.to_string()).or_insert(server);
                Err(e)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ManagedServer>> {
        self.table().get(name).cloned()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.table().contains_key(name)
    }

    /// Names of registered servers, sorted.
    pub fn active_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table().keys().cloned().collect();
        names.sort();
        names
    }

    /// Cancel every reader task. New starts are refused from here on.
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancel every reader and wait for all of them to finish.
    ///
    /// Implies `begin_shutdown`: the tracker is closed, so later starts are refused.
    pub(crate) async fn wait_for_readers(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<ManagedServer>>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // Remaining children die with their handles via `kill_on_drop`.
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_twice_keeps_one_process() {
        let supervisor = ProcessSupervisor::new();
        let config = ServerConfig::new("cat-srv", "cat");

        assert_eq!(supervisor.start(&config).unwrap(), StartOutcome::Started);
        let pid = supervisor.get("cat-srv").and_then(|s| s.pid());
        assert_eq!(supervisor.start(&config).unwrap(), StartOutcome::AlreadyRunning);
        assert_eq!(supervisor.get("cat-srv").and_then(|s| s.pid()), pid);
        assert_eq!(supervisor.active_names(), vec!["cat-srv"]);

        supervisor.stop("cat-srv").await.unwrap();
        assert!(!supervisor.is_active("cat-srv"));
    }

    #[tokio::test]
    async fn test_stop_unknown_is_noop() {
        let supervisor = ProcessSupervisor::new();
        supervisor.stop("never-started").await.unwrap();
        assert!(supervisor.active_names().is_empty());
    }

    #[tokio::test]
    async fn test_failed_spawn_registers_nothing() {
        let supervisor = ProcessSupervisor::new();
        let config = ServerConfig::new("ghost", "/no/such/binary-0d9c");
        assert!(supervisor.start(&config).is_err());
        assert!(!supervisor.is_active("ghost"));
    }

    #[tokio::test]
    async fn test_start_refused_after_shutdown_begins() {
        let supervisor = ProcessSupervisor::new();
        supervisor.begin_shutdown();
        let config = ServerConfig::new("late", "cat");
        assert!(matches!(
            supervisor.start(&config),
            Err(McpError::SpawnFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_waiting_for_readers_ends_accepting_starts() {
        let supervisor = ProcessSupervisor::new();
        supervisor.start(&ServerConfig::new("a", "cat")).unwrap();

        tokio::time::timeout(Duration::from_secs(5), supervisor.wait_for_readers())
            .await
            .expect("readers should be cancelled, not awaited to EOF");
        assert!(supervisor.is_shutting_down());
        assert!(supervisor.start(&ServerConfig::new("b", "cat")).is_err());

        supervisor.stop("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_readers_drain_after_stop() {
        let supervisor = ProcessSupervisor::new();
        supervisor.start(&ServerConfig::new("a", "cat")).unwrap();
        supervisor.start(&ServerConfig::new("b", "cat")).unwrap();
        supervisor.stop("a").await.unwrap();
        supervisor.stop("b").await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), supervisor.wait_for_readers())
            .await
            .expect("reader tasks should finish");
    }
}
