//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; hosts pick where they go by
//! calling one of these once at startup.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "physics_tool_client=info,warn";

/// Log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "tool-client.log";

/// Rotated files kept next to the live log.
const KEEP_ROTATED: u32 = 3;

/// Platform data directory for this crate's files.
///
/// Falls back to `~/.physics-tools/` when the platform directory cannot be
/// resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("physics-tools");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".physics-tools")
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Log to a file in `log_dir` (default: [`data_dir`]).
///
/// Rotates the previous logs first, writes through a line-flushing writer and
/// logs a startup banner naming the file. Returns the log file path.
pub fn init_tracing(log_dir: Option<&Path>) -> std::io::Result<PathBuf> {
    let log_dir = log_dir.map(Path::to_path_buf).unwrap_or_else(data_dir);
    std::fs::create_dir_all(&log_dir)?;

    let log_path = log_dir.join(LOG_FILE_NAME);
    rotate_log_file(&log_path, KEEP_ROTATED);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let installed = fmt::fmt()
        .with_env_filter(env_filter())
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .try_init();
    if installed.is_err() {
        // Someone else already owns the global subscriber.
        return Ok(log_path);
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== physics-tools starting ==="
    );
    Ok(log_path)
}

/// Log to stderr. A no-op if a subscriber is already installed.
pub fn init_stderr() {
    let _ = fmt::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// `name.log` → `name.log.1` → … → `name.log.{keep}`; the oldest is deleted.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let rotated = |i: u32| PathBuf::from(format!("{}.{i}", base_path.display()));

    let _ = std::fs::remove_file(rotated(keep));
    for i in (1..keep).rev() {
        let _ = std::fs::rename(rotated(i), rotated(i + 1));
    }
    if base_path.exists() {
        let _ = std::fs::rename(base_path, rotated(1));
    }
}

/// File writer that flushes after every write so lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    fn file(&self) -> std::io::Result<std::sync::MutexGuard<'_, std::fs::File>> {
        self.file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self.file()?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::Write::flush(&mut *self.file()?)
    }
}

impl<'a> fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
