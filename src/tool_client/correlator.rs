//! Request correlator: ids, in-flight calls, timeouts.
//!
//! One background reader task owns the transport's read side and routes every
//! decoded response to the pending call named by its id, so concurrent callers
//! sharing a session are never handed each other's responses. Writes go
//! through the transport, which keeps frames whole and in submission order.
//!
//! When the read side ends (server exit, closed stream) every pending call is
//! failed with a connection error and the correlator refuses new requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::codec::{self, Frame};
use super::errors::ToolClientError;
use super::transport::{Transport, TransportKind};
use super::types::{
    error_codes, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, JsonRpcResponseOut,
    RequestId,
};

type Outcome = Result<JsonRpcResponse, ToolClientError>;

/// A request awaiting its response.
struct PendingCall {
    method: String,
    submitted_at: Instant,
    timeout: Duration,
    slot: oneshot::Sender<Outcome>,
}

/// Pending calls plus the closed flag, guarded together so a call can never
/// be registered after the reader has drained the table.
#[derive(Default)]
struct PendingTable {
    calls: HashMap<RequestId, PendingCall>,
    closed: bool,
}

type SharedTable = Arc<Mutex<PendingTable>>;

fn lock(table: &SharedTable) -> std::sync::MutexGuard<'_, PendingTable> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

/// Removes a call from the table when its `submit` future finishes or is
/// dropped. A no-op once the reader has already resolved the call.
struct PendingGuard<'a> {
    table: &'a SharedTable,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.table).calls.remove(&self.id);
    }
}

// ─── Correlator ──────────────────────────────────────────────────────────────

/// Matches responses to requests by id for one session.
pub struct Correlator {
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    table: SharedTable,
    stopped: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Correlator {
    /// Take over the read side of `transport` and start routing responses.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(transport: Arc<dyn Transport>) -> Self {
        let table: SharedTable = Arc::new(Mutex::new(PendingTable::default()));
        let stopped = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(reader_loop(
            Arc::clone(&transport),
            Arc::clone(&table),
            Arc::clone(&stopped),
        ));

        Self {
            transport,
            next_id: AtomicU64::new(1),
            table,
            stopped,
            reader,
        }
    }

    /// Send a request and wait for its response.
    ///
    /// `timeout` bounds the write and the wait together, so a server that
    /// stops reading cannot stall the caller. Fails with `Timeout` when
    /// nothing arrives in time, and with `Connection` when the transport
    /// closes first. An error-shaped response is returned as `Ok`;
    /// interpreting it is the caller's business.
    ///
    /// Dropping the returned future releases the pending entry.
    pub async fn submit(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, ToolClientError> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let frame = codec::encode_request(&JsonRpcRequest::new(id.clone(), method, params))?;
        let (tx, rx) = oneshot::channel();

        {
            let mut table = lock(&self.table);
            if table.closed {
                return Err(self.closed_error());
            }
            table.calls.insert(
                id.clone(),
                PendingCall {
                    method: method.to_string(),
                    submitted_at: Instant::now(),
                    timeout,
                    slot: tx,
                },
            );
        }
        let _pending = PendingGuard {
            table: &self.table,
            id: id.clone(),
        };

        tracing::debug!(id = %id, method, "sending request");

        let exchange = async {
            if let Err(e) = self.transport.write(&frame).await {
                return Err(e);
            }
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(ToolClientError::Connection {
                    transport: self.transport.kind().to_string(),
                    reason: format!("connection closed before response to request {id}"),
                }),
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => {
                // A write cut short here may leave a partial frame on the
                // wire; callers drop the session on timeout.
                tracing::warn!(id = %id, method, timeout_ms = timeout.as_millis() as u64, "request timed out");
                Err(ToolClientError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a notification; returns once it is written, or fails with
    /// `Timeout` if the write does not finish within `timeout`.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<(), ToolClientError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let frame = codec::encode_notification(&JsonRpcNotification::new(method, params))?;
        tracing::debug!(method, "sending notification");
        tokio::time::timeout(timeout, self.transport.write(&frame))
            .await
            .map_err(|_| ToolClientError::Timeout {
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    /// Number of requests awaiting a response.
    pub fn in_flight(&self) -> usize {
        lock(&self.table).calls.len()
    }

    /// Whether the read side has ended or the correlator was shut down.
    pub fn is_closed(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Stop routing and fail every pending call. Does not close the transport.
    pub fn shutdown(&self) {
        self.reader.abort();
        fail_all(&self.table, &self.stopped, self.transport.kind(), "session closed");
    }

    fn closed_error(&self) -> ToolClientError {
        ToolClientError::Connection {
            transport: self.transport.kind().to_string(),
            reason: "transport closed".into(),
        }
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// ─── Reader Loop ─────────────────────────────────────────────────────────────

/// Single owner of the transport's read side.
async fn reader_loop(transport: Arc<dyn Transport>, table: SharedTable, stopped: Arc<AtomicBool>) {
    let reason = loop {
        let line = match transport.read_line().await {
            Ok(line) => line,
            Err(e) => break e.to_string(),
        };

        match codec::decode_frame(&line) {
            Ok(Frame::Response(response)) => dispatch(&table, response),
            Ok(Frame::Request { id, method }) => answer_server_request(&transport, id, &method).await,
            Ok(Frame::Notification { method, .. }) => {
                tracing::trace!(method = %method, "ignoring server notification");
            }
            Err(e) => match codec::frame_id(&line) {
                Some(id) => resolve(&table, &id, Err(e)),
                None => {
                    // Typically log output on the server's stdout.
                    tracing::debug!(
                        line = %String::from_utf8_lossy(&line),
                        "skipping non-protocol line"
                    );
                }
            },
        }
    };

    tracing::info!(transport = %transport.kind(), reason = %reason, "reader loop ended");
    fail_all(&table, &stopped, transport.kind(), &reason);
}

fn dispatch(table: &SharedTable, response: JsonRpcResponse) {
    let Some(id) = response.id.clone() else {
        tracing::warn!(error = ?response.error, "response without id; dropping");
        return;
    };
    resolve(table, &id, Ok(response));
}

fn resolve(table: &SharedTable, id: &RequestId, outcome: Outcome) {
    let call = {
        let mut table = lock(table);
        table.calls.remove(id).or_else(|| match id {
            // Some servers echo numeric ids back as strings.
            RequestId::Text(s) => s
                .parse::<u64>()
                .ok()
                .and_then(|n| table.calls.remove(&RequestId::Number(n))),
            RequestId::Number(_) => None,
        })
    };

    match call {
        Some(call) => {
            let elapsed = call.submitted_at.elapsed();
            tracing::debug!(
                id = %id,
                method = %call.method,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = call.timeout.as_millis() as u64,
                "response received"
            );
            let _ = call.slot.send(outcome);
        }
        None => tracing::debug!(id = %id, "no pending call for response; dropping"),
    }
}

fn fail_all(table: &SharedTable, stopped: &AtomicBool, kind: TransportKind, reason: &str) {
    let drained: Vec<_> = {
        let mut table = lock(table);
        table.closed = true;
        stopped.store(true, Ordering::SeqCst);
        table.calls.drain().collect()
    };

    for (id, call) in drained {
        tracing::debug!(id = %id, method = %call.method, "failing pending call");
        let _ = call.slot.send(Err(ToolClientError::Connection {
            transport: kind.to_string(),
            reason: format!("{reason} (request {id} unanswered)"),
        }));
    }
}

/// Servers may ping the client; answer that and refuse anything else so the
/// server is never left waiting.
async fn answer_server_request(transport: &Arc<dyn Transport>, id: RequestId, method: &str) {
    let reply = if method == "ping" {
        JsonRpcResponseOut::success(id, serde_json::json!({}))
    } else {
        tracing::debug!(method, "rejecting server-initiated request");
        JsonRpcResponseOut::failure(
            id,
            error_codes::METHOD_NOT_FOUND,
            format!("client does not handle '{method}'"),
        )
    };

    match codec::encode_response(&reply) {
        Ok(frame) => {
            if let Err(e) = transport.write(&frame).await {
                tracing::warn!(error = %e, "failed to answer server request");
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to encode reply"),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
