//! Session manager: transport selection, handshake, readiness.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──opened──▶ Handshaking ──initialized──▶ Ready
//!       ▲                       │                       │                        │
//!       │                       └───────── failure ─────┴──▶ Failed              │
//!       └──────────────── disconnect / transport closed ◀────────────────────────┘
//! ```
//!
//! A session owns exactly one transport at a time. Every exit from a state
//! that holds a transport (failed handshake, disconnect, reconnect) closes it,
//! which for the process transport means terminate-then-kill.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use super::codec;
use super::correlator::Correlator;
use super::errors::ToolClientError;
use super::transport::{Transport, TransportFactory, TransportKind};
use super::types::{methods, ClientInfo, InitializeParams, InitializeResult, ServerInfo};
use crate::config::ClientConfig;

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Ready => "ready",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// One logical connection to a tool server.
pub struct Session {
    id: Uuid,
    state: SessionState,
    correlator: Option<Arc<Correlator>>,
    transport_kind: Option<TransportKind>,
    init: Option<InitializeResult>,
    /// Bumped on every successful connect.
    generation: u64,
    protocol_version: String,
    client_info: ClientInfo,
    init_timeout: Duration,
}

impl Session {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Disconnected,
            correlator: None,
            transport_kind: None,
            init: None,
            generation: 0,
            protocol_version: config.protocol_version.clone(),
            client_info: config.client_info(),
            init_timeout: config.init_timeout(),
        }
    }

    /// Current state. A ready session whose transport has since closed
    /// reports `Disconnected`.
    pub fn state(&self) -> SessionState {
        match (&self.state, &self.correlator) {
            (SessionState::Ready, Some(c)) if c.is_closed() => SessionState::Disconnected,
            (state, _) => *state,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The transport carrying the current session, if connected.
    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.transport_kind
    }

    /// Server identity from the last successful handshake.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.init.as_ref().and_then(|i| i.server_info.as_ref())
    }

    /// The full `initialize` result from the last successful handshake.
    pub fn initialize_result(&self) -> Option<&InitializeResult> {
        self.init.as_ref()
    }

    pub fn in_flight(&self) -> usize {
        self.correlator.as_ref().map_or(0, |c| c.in_flight())
    }

    /// The correlator for issuing calls; fails unless the session is ready.
    pub fn correlator(&self) -> Result<Arc<Correlator>, ToolClientError> {
        match (&self.correlator, self.state()) {
            (Some(c), SessionState::Ready) => Ok(Arc::clone(c)),
            (_, state) => Err(ToolClientError::NotReady {
                state: state.to_string(),
            }),
        }
    }

    /// Open the first transport that works and perform the handshake.
    ///
    /// Factories are tried in order; the first whose `open` succeeds is used.
    /// A handshake failure does not fall through to the next factory: the
    /// transport is released and the session is left `Failed`.
    pub async fn connect(
        &mut self,
        factories: &[Box<dyn TransportFactory>],
    ) -> Result<(), ToolClientError> {
        if self.is_ready() {
            return Ok(());
        }
        // Release anything left over from a broken or failed session.
        self.disconnect().await;

        self.state = SessionState::Connecting;
        let transport = match open_first(factories).await {
            Ok(transport) => transport,
            Err(e) => {
                self.state = SessionState::Failed;
                return Err(e);
            }
        };
        let kind = transport.kind();

        self.state = SessionState::Handshaking;
        let correlator = Arc::new(Correlator::start(Arc::clone(&transport)));

        match self.handshake(&correlator).await {
            Ok(init) => {
                self.id = Uuid::new_v4();
                self.generation += 1;
                self.correlator = Some(correlator);
                self.transport_kind = Some(kind);
                tracing::info!(
                    session = %self.id,
                    transport = %kind,
                    generation = self.generation,
                    server = init
                        .server_info
                        .as_ref()
                        .and_then(|s| s.name.as_deref())
                        .unwrap_or("unknown"),
                    "tool session ready"
                );
                self.init = Some(init);
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(e) => {
                correlator.shutdown();
                let stderr = transport.diagnostics();
                transport.close().await;
                self.state = SessionState::Failed;

                if let Some(stderr) = &stderr {
                    tracing::warn!(transport = %kind, stderr = %stderr, "server output captured on failure");
                }
                let reason = format!("handshake failed: {e}{}", stderr_suffix(stderr.as_deref()));
                tracing::error!(transport = %kind, reason = %reason, "tool session failed");
                Err(ToolClientError::Connection {
                    transport: kind.to_string(),
                    reason,
                })
            }
        }
    }

    /// Release the transport and return to `Disconnected`. Idempotent.
    pub async fn disconnect(&mut self) {
        if let Some(correlator) = self.correlator.take() {
            correlator.shutdown();
            correlator.transport().close().await;
            tracing::info!(
                session = %self.id,
                transport = ?self.transport_kind,
                "tool session disconnected"
            );
        }
        self.transport_kind = None;
        self.init = None;
        self.state = SessionState::Disconnected;
    }

    /// `initialize` round trip followed by the `initialized` notification.
    async fn handshake(&self, correlator: &Correlator) -> Result<InitializeResult, ToolClientError> {
        let params = InitializeParams::tools_only(&self.protocol_version, self.client_info.clone());
        let params = serde_json::to_value(params).map_err(|e| ToolClientError::Protocol {
            reason: format!("failed to encode initialize params: {e}"),
        })?;

        let response = correlator
            .submit(methods::INITIALIZE, Some(params), self.init_timeout)
            .await?;
        let result = codec::into_result(response)?;

        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| ToolClientError::Protocol {
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        if let Some(version) = &init.protocol_version {
            if version != &self.protocol_version {
                tracing::warn!(
                    requested = %self.protocol_version,
                    negotiated = %version,
                    "server negotiated a different protocol version"
                );
            }
        }

        correlator
            .notify(methods::INITIALIZED, None, self.init_timeout)
            .await?;
        Ok(init)
    }
}

/// Try each factory in order; return the first transport that opens.
async fn open_first(
    factories: &[Box<dyn TransportFactory>],
) -> Result<Arc<dyn Transport>, ToolClientError> {
    let mut failures = Vec::new();

    for factory in factories {
        match factory.open().await {
            Ok(transport) => {
                tracing::debug!(transport = %factory.kind(), "transport opened");
                return Ok(transport);
            }
            Err(e) => {
                tracing::warn!(transport = %factory.kind(), error = %e, "transport unavailable; trying next");
                failures.push(format!("{}: {e}", factory.kind()));
            }
        }
    }

    Err(ToolClientError::Connection {
        transport: "any".into(),
        reason: if failures.is_empty() {
            "no transports configured".into()
        } else {
            format!("no transport available ({})", failures.join("; "))
        },
    })
}

fn stderr_suffix(stderr: Option<&str>) -> String {
    match stderr.map(str::trim) {
        Some(s) if !s.is_empty() => format!(" | stderr: {s}"),
        _ => String::new(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use serde_json::json;

    use super::*;
    use crate::tool_client::testing::{tool_server, Reply, ScriptedFactory};

    fn config() -> ClientConfig {
        ClientConfig {
            init_timeout_ms: 500,
            ..ClientConfig::default()
        }
    }

    fn boxed(factory: ScriptedFactory) -> Vec<Box<dyn TransportFactory>> {
        vec![Box::new(factory)]
    }

    #[tokio::test]
    async fn test_handshake_sends_initialize_then_initialized() {
        let factory = ScriptedFactory::new(|_, req| tool_server(req, |_| Reply::Silent));
        let opened = factory.opened();
        let mut session = Session::new(&config());

        session.connect(&boxed(factory)).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.generation(), 1);
        assert_eq!(session.server_info().unwrap().name.as_deref(), Some("scripted"));

        // The notification is written after the initialize round trip returns.
        tokio::task::yield_now().await;
        let transport = Arc::clone(&opened.lock().unwrap()[0]);
        assert_eq!(
            transport.methods(),
            vec!["initialize", "notifications/initialized"]
        );

        let init = &transport.written()[0];
        assert_eq!(init["params"]["protocolVersion"], "2024-11-05");
        assert_eq!(init["params"]["capabilities"], json!({"tools": {}}));
        assert_eq!(init["params"]["clientInfo"]["name"], "feynmancraft-adk");
        assert_eq!(init["id"], 1);
        assert!(transport.written()[1].get("id").is_none());
    }

    #[tokio::test]
    async fn test_not_ready_before_connect() {
        let session = Session::new(&config());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(matches!(
            session.correlator().err().unwrap(),
            ToolClientError::NotReady { .. }
        ));
    }

    #[tokio::test]
    async fn test_falls_back_to_next_factory() {
        let http = ScriptedFactory::unreachable(TransportKind::Http);
        let http_opens = http.open_counter();
        let process = ScriptedFactory::new(|_, req| tool_server(req, |_| Reply::Silent));
        let factories: Vec<Box<dyn TransportFactory>> = vec![Box::new(http), Box::new(process)];

        let mut session = Session::new(&config());
        session.connect(&factories).await.unwrap();
        assert_eq!(http_opens.load(Ordering::SeqCst), 1);
        assert_eq!(session.transport_kind(), Some(TransportKind::Process));
    }

    #[tokio::test]
    async fn test_no_transport_available() {
        let factories: Vec<Box<dyn TransportFactory>> = vec![
            Box::new(ScriptedFactory::unreachable(TransportKind::Http)),
            Box::new(ScriptedFactory::unreachable(TransportKind::Process)),
        ];
        let mut session = Session::new(&config());
        let err = session.connect(&factories).await.unwrap_err();
        assert!(err.to_string().contains("no transport available"));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_handshake_error_response_fails_session() {
        let factory = ScriptedFactory::new(|_, req| {
            Reply::Respond(json!({
                "jsonrpc": "2.0",
                "id": req["id"],
                "error": {"code": -32602, "message": "unsupported protocol version"}
            }))
        });
        let opened = factory.opened();
        let mut session = Session::new(&config());

        let err = session.connect(&boxed(factory)).await.unwrap_err();
        match err {
            ToolClientError::Connection { reason, .. } => {
                assert!(reason.contains("unsupported protocol version"));
            }
            other => panic!("expected Connection, got {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Failed);
        assert!(opened.lock().unwrap()[0].is_closed());
    }

    #[tokio::test]
    async fn test_server_exit_during_handshake_is_connection_error() {
        let factory = ScriptedFactory::new(|_, _| Reply::Close);
        let mut session = Session::new(&config());

        let started = std::time::Instant::now();
        let err = session.connect(&boxed(factory)).await.unwrap_err();
        assert!(matches!(err, ToolClientError::Connection { .. }));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_silent_server_handshake_is_bounded() {
        let factory = ScriptedFactory::new(|_, _| Reply::Silent);
        let mut session = Session::new(&ClientConfig {
            init_timeout_ms: 50,
            ..ClientConfig::default()
        });

        let err = session.connect(&boxed(factory)).await.unwrap_err();
        assert!(matches!(err, ToolClientError::Connection { .. }));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_disconnect_then_connect_opens_fresh_transport() {
        let factory = ScriptedFactory::new(|_, req| tool_server(req, |_| Reply::Silent));
        let opened = factory.opened();
        let factories = boxed(factory);
        let mut session = Session::new(&config());

        session.connect(&factories).await.unwrap();
        let first_id = session.id();
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.server_info().is_none());

        session.connect(&factories).await.unwrap();
        assert_ne!(session.id(), first_id);
        assert_eq!(session.generation(), 2);

        let opened = opened.lock().unwrap();
        assert_eq!(opened.len(), 2);
        assert!(opened[0].is_closed());
        assert!(!opened[1].is_closed());
    }

    #[tokio::test]
    async fn test_closed_transport_reports_disconnected() {
        let factory = ScriptedFactory::new(|_, req| {
            tool_server(req, |_| Reply::Close)
        });
        let factories = boxed(factory);
        let mut session = Session::new(&config());
        session.connect(&factories).await.unwrap();

        let correlator = session.correlator().unwrap();
        let err = correlator
            .submit("tools/call", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_no_response());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.correlator().is_err());
    }
}
