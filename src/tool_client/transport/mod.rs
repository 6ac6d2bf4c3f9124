//! Byte-stream transports carrying protocol frames.
//!
//! A [`Transport`] writes whole frames and hands back whole lines. Two
//! variants exist:
//! - [`process::ProcessTransport`]: a spawned child with piped stdio.
//! - [`http::HttpTransport`]: one POST per frame; response bodies are queued
//!   and handed out by `read_line`, so the correlator sees the same contract
//!   for both.
//!
//! Transports are created by [`TransportFactory`] implementations, which the
//! session tries in configured order. Opening is where liveness is decided:
//! the HTTP factory probes its health endpoint, the process factory spawns.

pub mod http;
pub mod process;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::errors::ToolClientError;
use crate::config::ClientConfig;

/// Which transport variant carries a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    Process,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Http => f.write_str("http"),
            TransportKind::Process => f.write_str("process"),
        }
    }
}

/// Bidirectional frame transport.
///
/// `write` may be called concurrently and must keep frames whole. `read_line`
/// is only ever driven by one reader task at a time.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Write one newline-terminated frame. Fails on a broken pipe or a
    /// closed transport.
    async fn write(&self, frame: &[u8]) -> Result<(), ToolClientError>;

    /// Wait for the next non-empty line. Fails once the stream is closed.
    async fn read_line(&self) -> Result<Vec<u8>, ToolClientError>;

    /// Release the underlying resources. Idempotent.
    async fn close(&self);

    /// Recent diagnostic output from the server, if the transport has any.
    fn diagnostics(&self) -> Option<String> {
        None
    }
}

/// Creates a fresh [`Transport`] on every call.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn open(&self) -> Result<Arc<dyn Transport>, ToolClientError>;
}

/// Build the factory list for `config.transport_order`, skipping kinds whose
/// config section is absent.
pub fn factories_from_config(config: &ClientConfig) -> Vec<Box<dyn TransportFactory>> {
    let mut factories: Vec<Box<dyn TransportFactory>> = Vec::new();

    for kind in &config.transport_order {
        match kind {
            TransportKind::Http => match &config.http {
                Some(http) => factories.push(Box::new(http::HttpTransportFactory::new(
                    http.clone(),
                    config.probe_timeout(),
                    config.call_timeout(),
                ))),
                None => tracing::debug!("http transport listed but not configured; skipping"),
            },
            TransportKind::Process => match &config.process {
                Some(process) => factories.push(Box::new(process::ProcessTransportFactory::new(
                    process.clone(),
                ))),
                None => tracing::debug!("process transport listed but not configured; skipping"),
            },
        }
    }

    factories
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessConfig;

    #[test]
    fn test_factories_follow_order() {
        let mut config = ClientConfig::default();
        config.transport_order = vec![TransportKind::Process, TransportKind::Http];
        let kinds: Vec<_> = factories_from_config(&config)
            .iter()
            .map(|f| f.kind())
            .collect();
        assert_eq!(kinds, vec![TransportKind::Process, TransportKind::Http]);
    }

    #[test]
    fn test_factories_skip_unconfigured() {
        let config = ClientConfig::process_only(ProcessConfig::command("cat", &[]));
        let kinds: Vec<_> = factories_from_config(&config)
            .iter()
            .map(|f| f.kind())
            .collect();
        assert_eq!(kinds, vec![TransportKind::Process]);
    }

    #[test]
    fn test_kind_serde_lowercase() {
        let kinds: Vec<TransportKind> = serde_json::from_str(r#"["http","process"]"#).unwrap();
        assert_eq!(kinds, vec![TransportKind::Http, TransportKind::Process]);
        assert_eq!(TransportKind::Process.to_string(), "process");
    }
}
