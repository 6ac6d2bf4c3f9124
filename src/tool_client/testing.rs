//! In-memory scripted tool server for tests.
//!
//! [`ScriptedTransport`] calls a handler for every frame the client writes and
//! queues whatever the handler answers for `read_line`. [`ScriptedFactory`]
//! hands out a fresh scripted transport on every `open`, counting attempts.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::errors::ToolClientError;
use super::transport::{Transport, TransportFactory, TransportKind};

/// What the scripted server does in answer to one written frame.
pub enum Reply {
    /// Queue this value as one line.
    Respond(Value),
    /// Queue these raw lines in order.
    Lines(Vec<String>),
    /// Queue the value after a delay, without blocking later frames.
    Delayed(Duration, Value),
    /// Say nothing.
    Silent,
    /// Close the read side, as a crashed server would.
    Close,
    /// Never finish the write, as with a server that stopped reading stdin.
    Stall,
}

type Handler = Box<dyn Fn(&Value) -> Reply + Send + Sync>;

pub struct ScriptedTransport {
    kind: TransportKind,
    handler: Handler,
    written: Mutex<Vec<Value>>,
    inbox_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: AtomicBool,
}

impl ScriptedTransport {
    pub fn new(handler: impl Fn(&Value) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Self::with_kind(TransportKind::Process, handler)
    }

    pub fn with_kind(
        kind: TransportKind,
        handler: impl Fn(&Value) -> Reply + Send + Sync + 'static,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            kind,
            handler: Box::new(handler),
            written: Mutex::new(Vec::new()),
            inbox_tx: Mutex::new(Some(tx)),
            inbox_rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        })
    }

    /// Every frame written so far, decoded.
    pub fn written(&self) -> Vec<Value> {
        self.written.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Methods of the written requests and notifications, in order.
    pub fn methods(&self) -> Vec<String> {
        self.written()
            .iter()
            .filter_map(|f| f["method"].as_str().map(str::to_string))
            .collect()
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        self.inbox_tx.lock().ok().and_then(|tx| tx.clone())
    }

    fn hang_up(&self) {
        if let Ok(mut tx) = self.inbox_tx.lock() {
            tx.take();
        }
    }

    fn closed_error(&self) -> ToolClientError {
        ToolClientError::Transport {
            transport: self.kind.to_string(),
            reason: "broken pipe".into(),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn write(&self, frame: &[u8]) -> Result<(), ToolClientError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let Some(tx) = self.sender() else {
            return Err(self.closed_error());
        };

        let value: Value = serde_json::from_slice(frame).map_err(|e| ToolClientError::Protocol {
            reason: format!("client wrote invalid JSON: {e}"),
        })?;
        if let Ok(mut written) = self.written.lock() {
            written.push(value.clone());
        }

        match (self.handler)(&value) {
            Reply::Respond(v) => {
                let _ = tx.send(v.to_string().into_bytes());
            }
            Reply::Lines(lines) => {
                for line in lines {
                    let _ = tx.send(line.into_bytes());
                }
            }
            Reply::Delayed(delay, v) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(v.to_string().into_bytes());
                });
            }
            Reply::Silent => {}
            Reply::Close => {
                drop(tx);
                self.hang_up();
            }
            Reply::Stall => std::future::pending::<()>().await,
        }
        Ok(())
    }

    async fn read_line(&self) -> Result<Vec<u8>, ToolClientError> {
        let mut rx = self.inbox_rx.lock().await;
        rx.recv().await.ok_or_else(|| ToolClientError::Connection {
            transport: self.kind.to_string(),
            reason: "server closed the stream".into(),
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.hang_up();
    }

    fn diagnostics(&self) -> Option<String> {
        Some("scripted server".into())
    }
}

// ─── Factory ─────────────────────────────────────────────────────────────────

type SessionHandler = Arc<dyn Fn(usize, &Value) -> Reply + Send + Sync>;

/// Hands out a new [`ScriptedTransport`] per `open`. The handler also gets the
/// 1-based attempt number so tests can script "first session breaks, second
/// works".
pub struct ScriptedFactory {
    kind: TransportKind,
    handler: SessionHandler,
    fail_opens: bool,
    opens: Arc<AtomicUsize>,
    transports: Arc<Mutex<Vec<Arc<ScriptedTransport>>>>,
}

impl ScriptedFactory {
    pub fn new(handler: impl Fn(usize, &Value) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            kind: TransportKind::Process,
            handler: Arc::new(handler),
            fail_opens: false,
            opens: Arc::new(AtomicUsize::new(0)),
            transports: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A factory whose `open` always fails, like an unreachable HTTP server.
    pub fn unreachable(kind: TransportKind) -> Self {
        Self {
            kind,
            fail_opens: true,
            ..Self::new(|_, _| Reply::Silent)
        }
    }

    pub fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    /// Shared counter of `open` calls, readable after the factory is moved.
    pub fn open_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.opens)
    }

    /// Every transport opened so far, readable after the factory is moved.
    pub fn opened(&self) -> Arc<Mutex<Vec<Arc<ScriptedTransport>>>> {
        Arc::clone(&self.transports)
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn open(&self) -> Result<Arc<dyn Transport>, ToolClientError> {
        let attempt = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_opens {
            return Err(ToolClientError::Connection {
                transport: self.kind.to_string(),
                reason: "connection refused".into(),
            });
        }

        let handler = Arc::clone(&self.handler);
        let transport = ScriptedTransport::with_kind(self.kind, move |req| handler(attempt, req));
        if let Ok(mut all) = self.transports.lock() {
            all.push(Arc::clone(&transport));
        }
        Ok(transport)
    }
}

// ─── Canned Server Behavior ──────────────────────────────────────────────────

/// Answer `initialize` like a well-behaved server, ignore notifications, and
/// pass `tools/call` to `on_call`.
pub fn tool_server(req: &Value, on_call: impl FnOnce(&Value) -> Reply) -> Reply {
    match req["method"].as_str() {
        Some("initialize") => Reply::Respond(json!({
            "jsonrpc": "2.0",
            "id": req["id"],
            "result": {
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "scripted", "version": "0.1.0"}
            }
        })),
        Some("tools/call") => on_call(req),
        _ => Reply::Silent,
    }
}

/// A `tools/call` result whose single content item carries `text`.
pub fn text_result(req: &Value, text: &str) -> Reply {
    Reply::Respond(json!({
        "jsonrpc": "2.0",
        "id": req["id"],
        "result": {"content": [{"type": "text", "text": text}]}
    }))
}
