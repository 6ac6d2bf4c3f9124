//! Child-process transport: JSON-RPC lines over a spawned server's stdio.
//!
//! The transport owns the child outright. Closing it drops stdin, sends a
//! graceful terminate, waits for the grace period and then kills, so no path
//! (including error paths) leaves an orphaned server behind. `kill_on_drop`
//! covers the case where the transport is dropped without being closed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::{Transport, TransportFactory, TransportKind};
use crate::config::ProcessConfig;
use crate::tool_client::errors::ToolClientError;

/// Bytes of stderr kept for failure diagnostics.
const STDERR_TAIL_LIMIT: usize = 2000;

// ─── Transport ───────────────────────────────────────────────────────────────

/// Line-delimited transport over a child process's stdin/stdout.
pub struct ProcessTransport {
    command: String,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<BufReader<ChildStdout>>,
    stderr_tail: Arc<std::sync::Mutex<String>>,
    shutdown_timeout: Duration,
}

impl ProcessTransport {
    /// Spawn the configured command with piped stdio.
    pub async fn spawn(config: &ProcessConfig) -> Result<Self, ToolClientError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);

        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| spawn_error(&config.command, e))?;

        let stdin = child.stdin.take().ok_or_else(|| ToolClientError::Connection {
            transport: TransportKind::Process.to_string(),
            reason: format!("failed to capture stdin of '{}'", config.command),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ToolClientError::Connection {
            transport: TransportKind::Process.to_string(),
            reason: format!("failed to capture stdout of '{}'", config.command),
        })?;

        let stderr_tail = Arc::new(std::sync::Mutex::new(String::new()));
        if let Some(stderr) = child.stderr.take() {
            drain_stderr(stderr, config.command.clone(), Arc::clone(&stderr_tail));
        }

        tracing::info!(
            command = %config.command,
            pid = child.id(),
            "spawned tool server process"
        );

        Ok(Self {
            command: config.command.clone(),
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(BufReader::new(stdout)),
            stderr_tail,
            shutdown_timeout: config.shutdown_timeout(),
        })
    }

    /// Whether the child is still running.
    pub async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        match child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// The OS process id, while the child is running.
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(|c| c.id())
    }

    async fn closed_reason(&self) -> String {
        let mut child = self.child.lock().await;
        let status = child.as_mut().and_then(|c| c.try_wait().ok().flatten());
        let mut reason = match status {
            Some(status) => format!("server stdout closed ({status})"),
            None => "server stdout closed (process may have exited)".to_string(),
        };
        if let Some(stderr) = self.diagnostics() {
            reason.push_str(" | stderr: ");
            reason.push_str(stderr.trim());
        }
        reason
    }

    fn transport_error(&self, reason: String) -> ToolClientError {
        ToolClientError::Transport {
            transport: format!("{} ({})", TransportKind::Process, self.command),
            reason,
        }
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Process
    }

    async fn write(&self, frame: &[u8]) -> Result<(), ToolClientError> {
        let mut stdin = self.stdin.lock().await;
        let writer = stdin.as_mut().ok_or_else(|| ToolClientError::Connection {
            transport: TransportKind::Process.to_string(),
            reason: "stdin already closed".into(),
        })?;

        writer
            .write_all(frame)
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))?;
        Ok(())
    }

    async fn read_line(&self) -> Result<Vec<u8>, ToolClientError> {
        let mut reader = self.stdout.lock().await;
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let bytes_read = reader
                .read_until(b'\n', &mut buf)
                .await
                .map_err(|e| self.transport_error(format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                drop(reader);
                return Err(ToolClientError::Connection {
                    transport: TransportKind::Process.to_string(),
                    reason: self.closed_reason().await,
                });
            }

            while buf.last().is_some_and(|b| b.is_ascii_whitespace()) {
                buf.pop();
            }
            if !buf.is_empty() {
                return Ok(buf);
            }
        }
    }

    async fn close(&self) {
        // EOF on stdin is enough for most servers to exit on their own.
        self.stdin.lock().await.take();

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        terminate(&mut child, self.shutdown_timeout, &self.command).await;
    }

    fn diagnostics(&self) -> Option<String> {
        let tail = self.stderr_tail.lock().ok()?;
        if tail.is_empty() {
            None
        } else {
            Some(tail.clone())
        }
    }
}

// ─── Process Helpers ─────────────────────────────────────────────────────────

fn spawn_error(command: &str, e: std::io::Error) -> ToolClientError {
    ToolClientError::Connection {
        transport: TransportKind::Process.to_string(),
        reason: format!("failed to spawn '{command}': {e}"),
    }
}

/// Forward stderr lines to the log and keep the most recent ones.
fn drain_stderr(stderr: ChildStderr, command: String, tail: Arc<std::sync::Mutex<String>>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %command, "stderr: {line}");
            if let Ok(mut tail) = tail.lock() {
                push_tail(&mut tail, &line);
            }
        }
    });
}

fn push_tail(tail: &mut String, line: &str) {
    if !tail.is_empty() {
        tail.push('\n');
    }
    tail.push_str(line);

    if tail.len() > STDERR_TAIL_LIMIT {
        let excess = tail.len() - STDERR_TAIL_LIMIT;
        let cut = (excess..=tail.len())
            .find(|i| tail.is_char_boundary(*i))
            .unwrap_or(tail.len());
        tail.drain(..cut);
    }
}

/// Terminate gracefully, then force-kill after `grace`.
async fn terminate(child: &mut Child, grace: Duration, command: &str) {
    if let Ok(Some(status)) = child.try_wait() {
        tracing::debug!(command, %status, "tool server already exited");
        return;
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: `pid` is our own un-reaped child, so it cannot have been recycled.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!(command, %status, "tool server exited"),
        _ => {
            tracing::warn!(
                command,
                grace_ms = grace.as_millis() as u64,
                "tool server did not exit in time; killing"
            );
            let _ = child.kill().await;
        }
    }
}

// ─── Factory ─────────────────────────────────────────────────────────────────

/// Spawns a fresh server process for every session.
pub struct ProcessTransportFactory {
    config: ProcessConfig,
}

impl ProcessTransportFactory {
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for ProcessTransportFactory {
    fn kind(&self) -> TransportKind {
        TransportKind::Process
    }

    async fn open(&self) -> Result<Arc<dyn Transport>, ToolClientError> {
        let transport = ProcessTransport::spawn(&self.config).await?;

        let delay = self.config.startup_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if !transport.is_alive().await {
            let reason = transport.closed_reason().await;
            transport.close().await;
            return Err(ToolClientError::Connection {
                transport: TransportKind::Process.to_string(),
                reason: format!("server exited during startup: {reason}"),
            });
        }

        Ok(Arc::new(transport))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
