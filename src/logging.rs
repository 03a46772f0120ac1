//! Tracing setup for processes embedding the MCP client.
//!
//! With a log directory, output goes to `mcp-group.log` in it, rotated on each
//! start and flushed per line. Without one, output goes to stderr; stdout is
//! left alone since an embedding process may itself speak a protocol there.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::EnvFilter;

/// Log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "mcp-group.log";

/// Rotated generations kept next to the live log.
pub const LOG_GENERATIONS: u32 = 3;

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "mcp_group=info,warn";

/// Install the global tracing subscriber.
///
/// Returns the log file path when `log_dir` is given. Fails if the directory
/// or file cannot be created, or if a global subscriber is already installed.
pub fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let Some(log_dir) = log_dir else {
        fmt::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;
        return Ok(None);
    };

    let log_path = open_log_dir(log_dir)?;
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== mcp-group starting ==="
    );

    Ok(Some(log_path))
}

/// Create `log_dir` if needed and rotate any previous log. Returns the live log path.
fn open_log_dir(log_dir: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let log_path = log_dir.join(LOG_FILE_NAME);
    rotate_log_file(&log_path, LOG_GENERATIONS);
    Ok(log_path)
}

/// Rotate `name.log` → `name.log.1` → … → `name.log.{keep}`, dropping the oldest.
///
/// Missing files in the chain are skipped.
pub fn rotate_log_file(base_path: &Path, keep: u32) {
    if keep == 0 {
        let _ = std::fs::remove_file(base_path);
        return;
    }

    let _ = std::fs::remove_file(generation(base_path, keep));

    for i in (1..keep).rev() {
        let _ = std::fs::rename(generation(base_path, i), generation(base_path, i + 1));
    }

    if base_path.exists() {
        let _ = std::fs::rename(base_path, generation(base_path, 1));
    }
}

fn generation(base_path: &Path, n: u32) -> PathBuf {
    PathBuf::from(format!("{}.{n}", base_path.display()))
}

/// File writer that flushes after every write so log lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<File>>,
}

impl FlushingWriter {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    fn lock(&self) -> std::io::Result<std::sync::MutexGuard<'_, File>> {
        self.file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self.lock()?;
        let n = f.write(buf)?;
        f.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.lock()?.flush()
    }
}

impl<'a> MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
