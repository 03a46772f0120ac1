//! Server process lifecycle management.
//!
//! Spawns MCP server child processes, drains their stdout/stderr on background
//! tasks, and shuts them down (terminate, grace period, then kill). Each server
//! runs as a separate OS process communicating via JSON-RPC over stdio.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::errors::McpError;
use super::transport::{route_stdout_line, ResponseChannel, StdioTransport};
use super::types::ServerConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for graceful shutdown before force-killing.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(windows)]
const PATH_SEPARATOR: &str = ";";
#[cfg(not(windows))]
const PATH_SEPARATOR: &str = ":";

// ─── ManagedServer ───────────────────────────────────────────────────────────

/// A running MCP server process with its transport and reader tasks.
///
/// Dropping it kills the process (`kill_on_drop`) and stops its readers.
pub struct ManagedServer {
    /// Server name this process was started for.
    pub name: String,
    /// The child process handle.
    process: Mutex<Child>,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    /// JSON-RPC transport (stdin + response routing).
    pub transport: StdioTransport,
    /// Cancels this server's reader tasks; child of the client-wide token.
    cancel: CancellationToken,
}

impl ManagedServer {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// `false` once the server's stdout has closed.
    pub fn is_connected(&self) -> bool {
        !self.transport.responses().is_closed()
    }

    /// Check if the server process is still running.
    pub async fn is_alive(&self) -> bool {
        matches!(self.process.lock().await.try_wait(), Ok(None))
    }

    /// Terminate the process: SIGTERM, wait up to `grace`, then kill and reap.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), McpError> {
        let mut process = self.process.lock().await;
        let stop_failed = |reason: String| McpError::StopFailed {
            name: self.name.clone(),
            reason,
        };

        let already_exited = process
            .try_wait()
            .map_err(|e| stop_failed(format!("failed to poll process: {e}")))?
            .is_some();

        if !already_exited {
            if !send_terminate(self.pid) {
                // No graceful signal on this platform; go straight to kill.
                process
                    .start_kill()
                    .map_err(|e| stop_failed(format!("failed to kill: {e}")))?;
            }

            match tokio::time::timeout(grace, process.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(server = %self.name, %status, "server exited");
                }
                Ok(Err(e)) => return Err(stop_failed(format!("failed to wait: {e}"))),
                Err(_) => {
                    tracing::warn!(
                        server = %self.name,
                        grace_ms = grace.as_millis() as u64,
                        "server did not terminate gracefully, killing"
                    );
                    process
                        .kill()
                        .await
                        .map_err(|e| stop_failed(format!("failed to kill: {e}")))?;
                }
            }
        }

        // A grandchild may still hold the pipes open; stop reading regardless.
        self.cancel.cancel();
        self.transport.responses().close();
        Ok(())
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn a server process and launch its stdout/stderr reader tasks.
///
/// Readers are tracked by `tracker` and stop when `shutdown` is cancelled,
/// when the server is shut down, or at end-of-stream.
pub fn spawn_server(
    config: &ServerConfig,
    shutdown: &CancellationToken,
    tracker: &TaskTracker,
) -> Result<ManagedServer, McpError> {
    let name = config.name();
    let spawn_failed = |reason: String| McpError::SpawnFailed {
        name: name.to_string(),
        reason,
    };

    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);
    cmd.envs(child_env_overrides(config));

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| spawn_failed(format!("{e}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_failed("failed to capture stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_failed("failed to capture stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| spawn_failed("failed to capture stderr".into()))?;

    let responses = Arc::new(ResponseChannel::new(name));
    let cancel = shutdown.child_token();

    tracker.spawn(drain_stdout(
        name.to_string(),
        stdout,
        responses.clone(),
        cancel.clone(),
    ));
    tracker.spawn(drain_stderr(name.to_string(), stderr, cancel.clone()));

    Ok(ManagedServer {
        name: name.to_string(),
        pid: child.id(),
        process: Mutex::new(child),
        started_at: Utc::now(),
        transport: StdioTransport::new(name, stdin, responses),
        cancel,
    })
}

/// Variables to set on top of the inherited environment.
///
/// The config's `env` map wins over inherited values; when `node_modules_path`
/// is set, its `.bin` directory is prepended to the resulting `PATH`.
pub fn child_env_overrides(config: &ServerConfig) -> HashMap<String, OsString> {
    let mut overrides: HashMap<String, OsString> = config
        .env
        .iter()
        .map(|(k, v)| (k.clone(), OsString::from(v)))
        .collect();

    if let Some(node_modules) = &config.node_modules_path {
        let current = overrides
            .get("PATH")
            .cloned()
            .or_else(|| std::env::var_os("PATH"));
        let bin_dir = PathBuf::from(node_modules).join(".bin");
        overrides.insert("PATH".to_string(), prepend_search_path(bin_dir, current));
    }

    overrides
}

/// `dir` followed by `existing` (if any), joined with the platform separator.
pub fn prepend_search_path(dir: PathBuf, existing: Option<OsString>) -> OsString {
    let mut path = dir.into_os_string();
    if let Some(existing) = existing.filter(|p| !p.is_empty()) {
        path.push(PATH_SEPARATOR);
        path.push(existing);
    }
    path
}

/// Ask the process to exit. Returns `false` if the signal could not be sent.
fn send_terminate(pid: Option<u32>) -> bool {
    use sysinfo::{Pid, ProcessesToUpdate, Signal, System};

    let Some(pid) = pid else {
        return false;
    };
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

    sys.process(pid)
        .and_then(|process| process.kill_with(Signal::Term))
        .unwrap_or(false)
}

// ─── Output Readers ──────────────────────────────────────────────────────────

/// Read stdout line by line, routing responses until EOF or cancellation.
///
/// On exit the response channel is closed so waiting requests fail fast.
async fn drain_stdout(
    server_name: String,
    stdout: ChildStdout,
    responses: Arc<ResponseChannel>,
    cancel: CancellationToken,
) {
    read_lines(&server_name, "stdout", stdout, &cancel, |line| {
        route_stdout_line(&server_name, line, &responses);
    })
    .await;
    responses.close();
}

/// Log every stderr line as a warning. Never parsed as protocol data.
async fn drain_stderr(server_name: String, stderr: ChildStderr, cancel: CancellationToken) {
    read_lines(&server_name, "stderr", stderr, &cancel, |line| {
        let line = line.trim_end();
        if !line.is_empty() {
            tracing::warn!(server = %server_name, "stderr: {line}");
        }
    })
    .await;
}

/// Read newline-terminated lines until EOF, an I/O error, or cancellation.
///
/// Bytes that are not valid UTF-8 are replaced rather than ending the stream.
async fn read_lines<R, F>(
    server_name: &str,
    stream: &str,
    reader: R,
    cancel: &CancellationToken,
    mut on_line: F,
) where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(server = %server_name, stream, "reader cancelled");
                break;
            }
            read = reader.read_until(b'\n', &mut buf) => match read {
                Ok(0) => {
                    tracing::debug!(server = %server_name, stream, "end of stream");
                    break;
                }
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    on_line(line.trim_end_matches(['\r', '\n']));
                }
                Err(e) => {
                    tracing::error!(server = %server_name, stream, error = %e, "error reading server output");
                    break;
                }
            },
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepend_search_path() {
        let joined = prepend_search_path(
            PathBuf::from("/opt/app/node_modules/.bin"),
            Some(OsString::from("/usr/bin")),
        );
        assert_eq!(
            joined,
            OsString::from(format!("/opt/app/node_modules/.bin{PATH_SEPARATOR}/usr/bin"))
        );
    }

    #[test]
    fn test_prepend_search_path_without_existing() {
        let joined = prepend_search_path(PathBuf::from("/nm/.bin"), None);
        assert_eq!(joined, OsString::from("/nm/.bin"));

        let joined = prepend_search_path(PathBuf::from("/nm/.bin"), Some(OsString::new()));
        assert_eq!(joined, OsString::from("/nm/.bin"));
    }

    #[test]
    fn test_env_overrides_without_node_modules() {
        let config = ServerConfig::new("s", "cat").with_env("FOO", "bar");
        let env = child_env_overrides(&config);
        assert_eq!(env.len(), 1);
        assert_eq!(env["FOO"], OsString::from("bar"));
        assert!(!env.contains_key("PATH"));
    }

    #[test]
    fn test_env_overrides_prefers_config_path() {
        let config = ServerConfig::new("s", "node")
            .with_env("PATH", "/custom/bin")
            .with_node_modules_path("/proj/node_modules");
        let env = child_env_overrides(&config);
        let expected = format!(
            "{}{PATH_SEPARATOR}/custom/bin",
            PathBuf::from("/proj/node_modules").join(".bin").display()
        );
        assert_eq!(env["PATH"], OsString::from(expected));
    }

    #[tokio::test]
    async fn test_read_lines_survives_invalid_utf8() {
        let input: &[u8] = b"bad \xff byte\r\n{\"ok\":true}\n\xfe\xfd\nlast";
        let mut seen = Vec::new();
        read_lines("srv", "stdout", input, &CancellationToken::new(), |line| {
            seen.push(line.to_string())
        })
        .await;
        assert_eq!(
            seen,
            vec!["bad \u{FFFD} byte", "{\"ok\":true}", "\u{FFFD}\u{FFFD}", "last"]
        );
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let config = ServerConfig::new("ghost", "/definitely/not/a/real/binary-7f3a");
        let err = spawn_server(&config, &CancellationToken::new(), &TaskTracker::new())
            .err()
            .expect("spawn should fail");
        assert!(matches!(err, McpError::SpawnFailed { ref name, .. } if name == "ghost"));
    }

    #[tokio::test]
    async fn test_stdout_eof_closes_channel() {
        let tracker = TaskTracker::new();
        let config = ServerConfig::new("short", "echo").with_args(["hello"]);
        let server = spawn_server(&config, &CancellationToken::new(), &tracker).unwrap();

        tracker.close();
        tokio::time::timeout(Duration::from_secs(5), tracker.wait())
            .await
            .expect("readers should finish at EOF");
        assert!(!server.is_connected());
        server.shutdown(SHUTDOWN_TIMEOUT).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_terminates_long_running_process() {
        let tracker = TaskTracker::new();
        let config = ServerConfig::new("sleeper", "sleep").with_args(["30"]);
        let server = spawn_server(&config, &CancellationToken::new(), &tracker).unwrap();
        assert!(server.is_alive().await);

        tokio::time::timeout(Duration::from_secs(10), server.shutdown(SHUTDOWN_TIMEOUT))
            .await
            .expect("shutdown should not hang")
            .unwrap();
        assert!(!server.is_alive().await);
    }

    #[tokio::test]
    async fn test_shutdown_kills_after_grace_period() {
        let tracker = TaskTracker::new();
        let config = ServerConfig::new("stubborn", "sh")
            .with_args(["-c", "trap '' TERM; while true; do sleep 1; done"]);
        let server = spawn_server(&config, &CancellationToken::new(), &tracker).unwrap();
        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        tokio::time::timeout(
            Duration::from_secs(10),
            server.shutdown(Duration::from_millis(300)),
        )
        .await
        .expect("forced kill should not hang")
        .unwrap();
        assert!(!server.is_alive().await);

        tracker.close();
        tokio::time::timeout(Duration::from_secs(5), tracker.wait())
            .await
            .expect("readers should stop once the server is shut down");
    }
}
