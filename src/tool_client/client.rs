//! Tool client facade: the one entry point domain code uses.
//!
//! Owns at most one [`Session`], created lazily on the first call under a
//! lock so concurrent first callers share a single connect. Once the session
//! is ready the lock is released and calls run concurrently through the
//! session's correlator.
//!
//! Failure policy for a call:
//! - No response (timeout, dropped transport): disconnect, reconnect and
//!   resend exactly once, then surface.
//! - Protocol violation: disconnect the session and surface.
//! - Server error: surface; the session stays ready.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::codec;
use super::correlator::Correlator;
use super::envelope;
use super::errors::{ErrorKind, ToolClientError};
use super::session::{Session, SessionState};
use super::transport::{factories_from_config, TransportFactory, TransportKind};
use super::types::{methods, CallToolParams, ServerInfo};
use crate::config::ClientConfig;

/// Snapshot of the client for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub state: SessionState,
    pub transport: Option<TransportKind>,
    pub session_id: Option<Uuid>,
    pub in_flight: usize,
    /// Number of successful connects so far.
    pub generation: u64,
    pub server: Option<ServerInfo>,
}

// ─── ToolClient ──────────────────────────────────────────────────────────────

pub struct ToolClient {
    config: ClientConfig,
    factories: Vec<Box<dyn TransportFactory>>,
    session: Mutex<Session>,
}

impl ToolClient {
    /// Build a client whose transports come from `config.transport_order`.
    pub fn new(config: ClientConfig) -> Result<Self, ToolClientError> {
        config.validate()?;
        let factories = factories_from_config(&config);
        Ok(Self::with_factories(config, factories))
    }

    /// Build a client over an explicit, ordered list of transport factories.
    pub fn with_factories(config: ClientConfig, factories: Vec<Box<dyn TransportFactory>>) -> Self {
        let session = Session::new(&config);
        Self {
            config,
            factories,
            session: Mutex::new(session),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect and handshake if not already ready.
    pub async fn connect(&self) -> Result<(), ToolClientError> {
        self.session.lock().await.connect(&self.factories).await
    }

    /// Release the session and its transport. The next call reconnects.
    pub async fn disconnect(&self) {
        self.session.lock().await.disconnect().await;
    }

    /// Transport carrying the current session, if any.
    pub async fn transport_kind(&self) -> Option<TransportKind> {
        self.session.lock().await.transport_kind()
    }

    pub async fn status(&self) -> ClientStatus {
        let session = self.session.lock().await;
        let ready = session.is_ready();
        ClientStatus {
            state: session.state(),
            transport: session.transport_kind(),
            session_id: ready.then(|| session.id()),
            in_flight: session.in_flight(),
            generation: session.generation(),
            server: session.server_info().cloned(),
        }
    }

    /// Invoke a tool and return its normalized result, or the uniform
    /// `{"error": message}` value on any failure.
    pub async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> serde_json::Value {
        match self.try_call_tool(name, arguments).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(tool = name, kind = ?e.kind(), error = %e, "tool call failed");
                e.to_error_value()
            }
        }
    }

    /// Invoke a tool, returning typed failures.
    ///
    /// The `Ok` value has already had its content envelope unwrapped and its
    /// non-finite numbers sanitized.
    pub async fn try_call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolClientError> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })
        .map_err(|e| ToolClientError::Protocol {
            reason: format!("failed to encode arguments for '{name}': {e}"),
        })?;

        let start = Instant::now();
        let (correlator, generation) = self.ready_correlator().await?;

        let outcome = match self.call_once(&correlator, &params).await {
            Err(e) if e.is_no_response() => {
                tracing::warn!(tool = name, error = %e, "no response; reconnecting once");
                drop(correlator);
                let correlator = self.reconnect(generation).await?;
                self.call_once(&correlator, &params).await
            }
            other => other,
        };

        match outcome {
            Ok(result) => {
                tracing::debug!(
                    tool = name,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "tool call succeeded"
                );
                Ok(envelope::unwrap_content(result))
            }
            Err(e) => {
                if e.kind() == ErrorKind::Protocol && !matches!(e, ToolClientError::Http { .. }) {
                    tracing::warn!(tool = name, error = %e, "protocol violation; dropping session");
                    self.disconnect().await;
                }
                Err(e)
            }
        }
    }

    async fn call_once(
        &self,
        correlator: &Correlator,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, ToolClientError> {
        let response = correlator
            .submit(methods::TOOLS_CALL, Some(params.clone()), self.config.call_timeout())
            .await?;
        codec::into_result(response)
    }

    /// The ready session's correlator, connecting first if needed.
    async fn ready_correlator(&self) -> Result<(Arc<Correlator>, u64), ToolClientError> {
        let mut session = self.session.lock().await;
        if !session.is_ready() {
            session.connect(&self.factories).await?;
        }
        Ok((session.correlator()?, session.generation()))
    }

    /// Tear down the session that failed and connect a fresh one.
    ///
    /// If another caller already replaced the session of `failed_generation`,
    /// its replacement is used as-is.
    async fn reconnect(&self, failed_generation: u64) -> Result<Arc<Correlator>, ToolClientError> {
        let mut session = self.session.lock().await;
        if session.generation() == failed_generation || !session.is_ready() {
            session.disconnect().await;
            session.connect(&self.factories).await?;
        }
        session.correlator()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::*;
    use crate::tool_client::testing::{text_result, tool_server, Reply, ScriptedFactory};

    fn config() -> ClientConfig {
        ClientConfig {
            call_timeout_ms: 100,
            init_timeout_ms: 500,
            ..ClientConfig::default()
        }
    }

    fn client(factory: ScriptedFactory) -> ToolClient {
        ToolClient::with_factories(config(), vec![Box::new(factory)])
    }

    #[tokio::test]
    async fn test_search_particle_envelope_is_unwrapped() {
        let factory = ScriptedFactory::new(|_, req| {
            tool_server(req, |req| {
                assert_eq!(req["params"]["name"], "search_particle");
                assert_eq!(req["params"]["arguments"], json!({"query": "electron"}));
                text_result(req, r#"{"results":[{"name":"e-"}],"total_found":1}"#)
            })
        });
        let client = client(factory);

        let result = client
            .call_tool("search_particle", json!({"query": "electron"}))
            .await;
        assert_eq!(result, json!({"results": [{"name": "e-"}], "total_found": 1}));
    }

    #[tokio::test]
    async fn test_infinite_mass_is_sanitized() {
        let factory = ScriptedFactory::new(|_, req| {
            tool_server(req, |req| {
                Reply::Lines(vec![format!(
                    r#"{{"jsonrpc":"2.0","id":{},"result":{{"mass": Infinity}}}}"#,
                    req["id"]
                )])
            })
        });
        let client = client(factory);

        let result = client.call_tool("get_particle_properties", json!({})).await;
        assert_eq!(result, json!({"mass": "infinity"}));
    }

    #[tokio::test]
    async fn test_overflowing_mass_is_sanitized() {
        let factory = ScriptedFactory::new(|_, req| {
            tool_server(req, |req| {
                Reply::Lines(vec![format!(
                    r#"{{"jsonrpc":"2.0","id":{},"result":{{"mass":1e999}}}}"#,
                    req["id"]
                )])
            })
        });
        let opens = factory.open_counter();
        let client = client(factory);

        let result = client.call_tool("get_particle_properties", json!({})).await;
        assert_eq!(result, json!({"mass": "infinity"}));
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_null_result_is_success() {
        let factory = ScriptedFactory::new(|_, req| {
            tool_server(req, |req| {
                Reply::Respond(json!({"jsonrpc": "2.0", "id": req["id"], "result": null}))
            })
        });
        let client = client(factory);

        let result = client.try_call_tool("check_particle_properties", json!({})).await.unwrap();
        assert_eq!(result, Value::Null);
        assert_eq!(client.status().await.state, SessionState::Ready);
    }

    #[tokio::test]
    async fn test_server_error_is_uniform_and_session_stays_ready() {
        let factory = ScriptedFactory::new(|_, req| {
            tool_server(req, |req| {
                Reply::Respond(json!({
                    "jsonrpc": "2.0",
                    "id": req["id"],
                    "error": {"code": -32602, "message": "particle not found"}
                }))
            })
        });
        let opens = factory.open_counter();
        let client = client(factory);

        let result = client.call_tool("get_particle_properties", json!({"name": "x"})).await;
        assert_eq!(result, json!({"error": "particle not found"}));

        let status = client.status().await;
        assert_eq!(status.state, SessionState::Ready);
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_response_reconnects_once_and_resends() {
        let factory = ScriptedFactory::new(|attempt, req| {
            tool_server(req, |req| {
                if attempt == 1 {
                    Reply::Silent
                } else {
                    text_result(req, r#"{"ok": true}"#)
                }
            })
        });
        let opens = factory.open_counter();
        let opened = factory.opened();
        let client = client(factory);

        let result = client.try_call_tool("search_particle", json!({})).await.unwrap();
        assert_eq!(result, json!({"ok": true}));
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert!(opened.lock().unwrap()[0].is_closed());

        let resent = opened.lock().unwrap()[1].methods();
        assert_eq!(
            resent,
            vec!["initialize", "notifications/initialized", "tools/call"]
        );
    }

    #[tokio::test]
    async fn test_persistent_failure_is_not_retried_twice() {
        let factory = ScriptedFactory::new(|_, req| tool_server(req, |_| Reply::Silent));
        let opens = factory.open_counter();
        let client = client(factory);

        let err = client.try_call_tool("search_particle", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_connection_is_recovered() {
        let factory = ScriptedFactory::new(|attempt, req| {
            tool_server(req, |req| {
                if attempt == 1 {
                    Reply::Close
                } else {
                    text_result(req, "[]")
                }
            })
        });
        let opens = factory.open_counter();
        let client = client(factory);

        let result = client.call_tool("search_particle", json!({})).await;
        assert_eq!(result, json!([]));
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_protocol_error_disconnects_without_retry() {
        let factory = ScriptedFactory::new(|_, req| {
            tool_server(req, |req| {
                Reply::Respond(json!({"jsonrpc": "2.0", "id": req["id"]}))
            })
        });
        let opens = factory.open_counter();
        let client = client(factory);

        let err = client.try_call_tool("search_particle", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(client.status().await.state, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_concurrent_first_callers_share_one_session() {
        let factory = ScriptedFactory::new(|_, req| {
            tool_server(req, |req| {
                let query = req["params"]["arguments"]["query"].clone();
                let body = json!({"jsonrpc": "2.0", "id": req["id"], "result": {"echo": query}});
                // Answer in reverse order of arrival.
                let delay = 80u64.saturating_sub(req["id"].as_u64().unwrap_or(0) * 10);
                Reply::Delayed(Duration::from_millis(delay), body)
            })
        });
        let opens = factory.open_counter();
        let client = Arc::new(ToolClient::with_factories(
            ClientConfig {
                call_timeout_ms: 2_000,
                ..config()
            },
            vec![Box::new(factory)],
        ));

        let calls: Vec<_> = (0..6)
            .map(|i| {
                let client = Arc::clone(&client);
                tokio::spawn(async move {
                    let query = format!("q{i}");
                    let result = client.call_tool("search_particle", json!({"query": query})).await;
                    (query, result)
                })
            })
            .collect();

        for call in calls {
            let (query, result) = call.await.unwrap();
            assert_eq!(result, json!({"echo": query}));
        }
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_then_call_uses_fresh_transport() {
        let factory = ScriptedFactory::new(|_, req| tool_server(req, |req| text_result(req, "{}")));
        let opens = factory.open_counter();
        let opened = factory.opened();
        let client = client(factory);

        client.connect().await.unwrap();
        client.disconnect().await;
        assert_eq!(client.status().await.state, SessionState::Disconnected);

        let result = client.call_tool("search_particle", json!({})).await;
        assert_eq!(result, json!({}));
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert!(opened.lock().unwrap()[0].is_closed());
    }

    #[tokio::test]
    async fn test_unreachable_servers_give_error_shape() {
        let client = ToolClient::with_factories(
            config(),
            vec![
                Box::new(ScriptedFactory::unreachable(TransportKind::Http)),
                Box::new(ScriptedFactory::unreachable(TransportKind::Process)),
            ],
        );

        let result = client.call_tool("search_particle", json!({})).await;
        let message = result["error"].as_str().unwrap();
        assert!(message.contains("no transport available"));
        assert_eq!(client.status().await.state, SessionState::Failed);
    }

    #[tokio::test]
    async fn test_status_reports_transport_and_server() {
        let factory = ScriptedFactory::new(|_, req| tool_server(req, |_| Reply::Silent))
            .with_kind(TransportKind::Http);
        let client = client(factory);

        let before = client.status().await;
        assert_eq!(before.state, SessionState::Disconnected);
        assert!(before.session_id.is_none());

        client.connect().await.unwrap();
        let status = client.status().await;
        assert_eq!(status.state, SessionState::Ready);
        assert_eq!(status.transport, Some(TransportKind::Http));
        assert_eq!(status.generation, 1);
        assert_eq!(status.server.unwrap().name.as_deref(), Some("scripted"));

        let json: Value = serde_json::to_value(client.status().await).unwrap();
        assert_eq!(json["state"], "ready");
        assert_eq!(json["transport"], "http");
    }

    // ─── Real child process ──────────────────────────────────────────────

    #[cfg(unix)]
    const SH_SERVER: &str = r#"
echo "particle server starting"
echo "loading tables" >&2
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"sh-server","version":"0.0.1"}}}\n' "$id" ;;
    *'"method":"tools/call"'*'"search_particle"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"{\\"results\\":[{\\"name\\":\\"e-\\"}],\\"total_found\\":1}"}]}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"mass": Infinity}}\n' "$id" ;;
  esac
done
"#;

    #[cfg(unix)]
    fn sh_client(dir: &tempfile::TempDir) -> ToolClient {
        let script = dir.path().join("server.sh");
        std::fs::write(&script, SH_SERVER).unwrap();
        let process = crate::config::ProcessConfig::command("sh", &[script.to_str().unwrap()]);
        ToolClient::new(ClientConfig {
            call_timeout_ms: 5_000,
            init_timeout_ms: 5_000,
            ..ClientConfig::process_only(process)
        })
        .unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_server_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let client = sh_client(&dir);

        let found = client
            .call_tool("search_particle", json!({"query": "electron"}))
            .await;
        assert_eq!(found, json!({"results": [{"name": "e-"}], "total_found": 1}));

        let props = client.call_tool("get_particle_properties", json!({})).await;
        assert_eq!(props, json!({"mass": "infinity"}));

        let status = client.status().await;
        assert_eq!(status.transport, Some(TransportKind::Process));
        assert_eq!(status.server.unwrap().name.as_deref(), Some("sh-server"));

        client.disconnect().await;
        client.connect().await.unwrap();
        assert_eq!(client.status().await.generation, 2);
        client.disconnect().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exit_before_handshake_is_connection_error() {
        let process = crate::config::ProcessConfig::command("sh", &["-c", "echo 'bad config' >&2; exit 2"]);
        let client = ToolClient::new(ClientConfig {
            init_timeout_ms: 5_000,
            ..ClientConfig::process_only(process)
        })
        .unwrap();

        let started = Instant::now();
        let err = client.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(client.status().await.state, SessionState::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_server_that_stops_reading_still_times_out() {
        // Answers the handshake, then never reads stdin again.
        const DEAF_SERVER: &str = r#"
IFS= read -r line
id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
printf '{"jsonrpc":"2.0","id":%s,"result":{"serverInfo":{"name":"deaf"}}}\n' "$id"
exec sleep 1000
"#;
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("deaf.sh");
        std::fs::write(&script, DEAF_SERVER).unwrap();
        let process = crate::config::ProcessConfig {
            shutdown_timeout_ms: 200,
            ..crate::config::ProcessConfig::command("sh", &[script.to_str().unwrap()])
        };
        let client = ToolClient::new(ClientConfig {
            call_timeout_ms: 300,
            init_timeout_ms: 5_000,
            ..ClientConfig::process_only(process)
        })
        .unwrap();

        // Far larger than a pipe buffer, so the write itself blocks.
        let query = "x".repeat(300_000);
        let err = tokio::time::timeout(
            Duration::from_secs(10),
            client.try_call_tool("search_particle", json!({"query": query})),
        )
        .await
        .expect("call outlived its timeout")
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        client.disconnect().await;
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = ClientConfig {
            transport_order: vec![],
            ..ClientConfig::default()
        };
        assert!(matches!(
            ToolClient::new(config).err().unwrap(),
            ToolClientError::Config { .. }
        ));
    }
}
