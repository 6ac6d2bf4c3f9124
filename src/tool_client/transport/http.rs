//! HTTP transport: each frame is one POST to the server's RPC path.
//!
//! There is no persistent stream. A response body is pushed onto an inbox
//! queue which `read_line` drains, so the correlator matches HTTP responses by
//! id exactly as it does for the process transport. Notifications usually
//! come back as `202`/`204` with an empty body and queue nothing.
//!
//! "Connecting" is a liveness probe: a GET on the health path that must
//! return a success status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use tokio::sync::{mpsc, Mutex};

use super::{Transport, TransportFactory, TransportKind};
use crate::config::HttpConfig;
use crate::tool_client::codec;
use crate::tool_client::errors::ToolClientError;

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Transport ───────────────────────────────────────────────────────────────

/// JSON-RPC over HTTP POST.
pub struct HttpTransport {
    http: HttpClient,
    config: HttpConfig,
    inbox_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl HttpTransport {
    /// Build a transport whose POSTs time out after `request_timeout`.
    pub fn new(config: HttpConfig, request_timeout: Duration) -> Result<Self, ToolClientError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| ToolClientError::Connection {
                transport: TransportKind::Http.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            http,
            config,
            inbox_tx: std::sync::Mutex::new(Some(tx)),
            inbox_rx: Mutex::new(rx),
        })
    }

    /// GET the health endpoint; any non-success status or error fails.
    pub async fn probe(&self, timeout: Duration) -> Result<(), ToolClientError> {
        let url = self.config.health_url();
        let response = self
            .http
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ToolClientError::Connection {
                transport: TransportKind::Http.to_string(),
                reason: format!("liveness probe to {url} failed: {e}"),
            })?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(url = %url, "http liveness probe ok");
            Ok(())
        } else {
            Err(ToolClientError::Connection {
                transport: TransportKind::Http.to_string(),
                reason: format!("liveness probe to {url} returned {status}"),
            })
        }
    }

    fn inbox(&self) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        self.inbox_tx.lock().ok().and_then(|tx| tx.clone())
    }

    fn closed_error() -> ToolClientError {
        ToolClientError::Connection {
            transport: TransportKind::Http.to_string(),
            reason: "transport closed".into(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn write(&self, frame: &[u8]) -> Result<(), ToolClientError> {
        let inbox = self.inbox().ok_or_else(Self::closed_error)?;
        let url = self.config.rpc_url();

        let mut request = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(frame.trim_ascii_end().to_vec());
        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| ToolClientError::Transport {
            transport: TransportKind::Http.to_string(),
            reason: format!("POST {url} failed: {e}"),
        })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| ToolClientError::Transport {
            transport: TransportKind::Http.to_string(),
            reason: format!("failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(ToolClientError::Http {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let body = body.trim_ascii();
        if body.is_empty() {
            return Ok(());
        }

        // Reject undecodable bodies here; otherwise the caller would only
        // learn about them through a timeout.
        codec::decode_frame(body)?;
        inbox.send(body.to_vec()).map_err(|_| Self::closed_error())
    }

    async fn read_line(&self) -> Result<Vec<u8>, ToolClientError> {
        let mut rx = self.inbox_rx.lock().await;
        rx.recv().await.ok_or_else(Self::closed_error)
    }

    async fn close(&self) {
        if let Ok(mut tx) = self.inbox_tx.lock() {
            tx.take();
        }
    }
}

// ─── Factory ─────────────────────────────────────────────────────────────────

/// Opens an HTTP transport once its liveness probe passes.
pub struct HttpTransportFactory {
    config: HttpConfig,
    probe_timeout: Duration,
    request_timeout: Duration,
}

impl HttpTransportFactory {
    pub fn new(config: HttpConfig, probe_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            config,
            probe_timeout,
            request_timeout,
        }
    }
}

#[async_trait]
impl TransportFactory for HttpTransportFactory {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn open(&self) -> Result<Arc<dyn Transport>, ToolClientError> {
        let transport = HttpTransport::new(self.config.clone(), self.request_timeout)?;
        transport.probe(self.probe_timeout).await?;
        tracing::info!(base_url = %self.config.base_url, "connected to HTTP tool server");
        Ok(Arc::new(transport))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
