//! Tool client configuration loading and validation.
//!
//! Reads `tool-client.yaml` and resolves environment variables. Every field
//! has a default, so an empty file (or no file at all) yields a client that
//! tries the local HTTP server first and falls back to spawning the
//! particle-physics server over stdio.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tool_client::errors::ToolClientError;
use crate::tool_client::transport::TransportKind;
use crate::tool_client::types::{ClientInfo, PROTOCOL_VERSION};

/// File name searched for by [`find_config_path`].
pub const CONFIG_FILE_NAME: &str = "tool-client.yaml";

/// Environment variable pointing directly at a config file.
pub const CONFIG_ENV_VAR: &str = "PHYSICS_TOOLS_CONFIG";

// ─── Public Types ────────────────────────────────────────────────────────────

/// HTTP tool server endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub base_url: String,
    /// Path that accepts JSON-RPC POSTs.
    pub rpc_path: String,
    /// Path probed with a GET before the transport is used.
    pub health_path: String,
    /// Extra headers sent with every request.
    pub headers: HashMap<String, String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8002".into(),
            rpc_path: "/mcp".into(),
            health_path: "/health".into(),
            headers: HashMap::new(),
        }
    }
}

impl HttpConfig {
    pub fn rpc_url(&self) -> String {
        join_url(&self.base_url, &self.rpc_path)
    }

    pub fn health_url(&self) -> String {
        join_url(&self.base_url, &self.health_path)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Subprocess tool server launched with piped stdio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    /// Pause between spawn and handshake.
    pub startup_delay_ms: u64,
    /// Grace period after SIGTERM before the child is killed.
    pub shutdown_timeout_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            command: "uv".into(),
            args: vec![
                "tool".into(),
                "run".into(),
                "--from".into(),
                "git+https://github.com/uzerone/ParticlePhysics-MCP-Server.git".into(),
                "pp-mcp-server".into(),
            ],
            env: HashMap::from([("PYTHONUNBUFFERED".to_string(), "1".to_string())]),
            cwd: None,
            startup_delay_ms: 1_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl ProcessConfig {
    /// A process config running `command args...` with no startup delay.
    pub fn command(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            cwd: None,
            startup_delay_ms: 0,
            shutdown_timeout_ms: 5_000,
        }
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Top-level client configuration (mirrors `tool-client.yaml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub client_name: String,
    pub client_version: String,
    pub protocol_version: String,
    /// Budget for each `tools/call` round trip.
    pub call_timeout_ms: u64,
    /// Budget for the HTTP liveness probe.
    pub probe_timeout_ms: u64,
    /// Budget for the `initialize` round trip.
    pub init_timeout_ms: u64,
    /// Transports tried in order on connect; the first that opens wins.
    pub transport_order: Vec<TransportKind>,
    /// `None` disables the HTTP transport.
    pub http: Option<HttpConfig>,
    /// `None` disables the process transport.
    pub process: Option<ProcessConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: "feynmancraft-adk".into(),
            client_version: "1.0.0".into(),
            protocol_version: PROTOCOL_VERSION.into(),
            call_timeout_ms: 10_000,
            probe_timeout_ms: 2_000,
            init_timeout_ms: 10_000,
            transport_order: vec![TransportKind::Http, TransportKind::Process],
            http: Some(HttpConfig::default()),
            process: Some(ProcessConfig::default()),
        }
    }
}

impl ClientConfig {
    /// A config that only spawns the given process.
    pub fn process_only(process: ProcessConfig) -> Self {
        Self {
            transport_order: vec![TransportKind::Process],
            http: None,
            process: Some(process),
            ..Self::default()
        }
    }

    pub fn client_info(&self) -> ClientInfo {
        ClientInfo {
            name: self.client_name.clone(),
            version: self.client_version.clone(),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    /// Reject configurations that could never produce a working session.
    pub fn validate(&self) -> Result<(), ToolClientError> {
        if self.call_timeout_ms == 0 || self.probe_timeout_ms == 0 || self.init_timeout_ms == 0 {
            return Err(config_error("timeouts must be greater than zero"));
        }
        if self.transport_order.is_empty() {
            return Err(config_error("transport_order is empty"));
        }
        if let Some(process) = &self.process {
            if process.command.trim().is_empty() {
                return Err(config_error("process.command is empty"));
            }
        }
        let usable = self.transport_order.iter().any(|kind| match kind {
            TransportKind::Http => self.http.is_some(),
            TransportKind::Process => self.process.is_some(),
        });
        if !usable {
            return Err(config_error(
                "no transport in transport_order has a matching config section",
            ));
        }
        Ok(())
    }
}

fn config_error(reason: &str) -> ToolClientError {
    ToolClientError::Config {
        reason: reason.to_string(),
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Checks `PHYSICS_TOOLS_CONFIG` first, then walks upward from `start`
/// looking for `tool-client.yaml`.
pub fn find_config_path(start: &Path) -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(path);
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Load, interpolate and validate a config file.
pub fn load_config(path: &Path) -> Result<ClientConfig, ToolClientError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ToolClientError::Config {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_config(&raw)
}

/// Parse config YAML after `${VAR}` interpolation.
pub fn parse_config(raw: &str) -> Result<ClientConfig, ToolClientError> {
    let interpolated = interpolate_env_vars(raw);
    let config: ClientConfig = if interpolated.trim().is_empty() {
        ClientConfig::default()
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| ToolClientError::Config {
            reason: format!("failed to parse config: {e}"),
        })?
    };
    config.validate()?;
    Ok(config)
}

/// Find and load the config from the current directory, falling back to the
/// built-in defaults when no file exists.
pub fn load_default_config() -> Result<ClientConfig, ToolClientError> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    match find_config_path(&cwd) {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading tool client config");
            load_config(&path)
        }
        None => Ok(ClientConfig::default()),
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
