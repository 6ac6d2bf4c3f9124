//! Tool client error types.
//!
//! Every failure the client can produce is one of these variants. Callers that
//! want a single failure shape regardless of transport use
//! [`ToolClientError::to_error_value`].

use thiserror::Error;

/// Errors that can occur while talking to a tool server.
#[derive(Debug, Error)]
pub enum ToolClientError {
    /// The transport could not be established, the handshake failed, or the
    /// connection dropped while a call was in flight.
    #[error("connection failed ({transport}): {reason}")]
    Connection {
        transport: String,
        reason: String,
    },

    /// No response arrived within the call's budget.
    #[error("'{method}' timed out after {timeout_ms}ms")]
    Timeout {
        method: String,
        timeout_ms: u64,
    },

    /// A frame could not be decoded or violated the JSON-RPC response shape.
    #[error("protocol error: {reason}")]
    Protocol {
        reason: String,
    },

    /// The server answered a specific call with an error-shaped response.
    #[error("server error [{code}]: {message}")]
    Tool {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Low-level I/O failure on the transport (broken pipe, closed stream).
    #[error("transport error ({transport}): {reason}")]
    Transport {
        transport: String,
        reason: String,
    },

    /// Non-2xx HTTP status from the tool server.
    #[error("HTTP {status}: {body}")]
    Http {
        status: u16,
        body: String,
    },

    /// A call was attempted on a session that has not completed its handshake.
    #[error("session not ready (state: {state})")]
    NotReady {
        state: String,
    },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    Config {
        reason: String,
    },
}

/// Coarse failure classes callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Timeout,
    Protocol,
    Tool,
}

impl ToolClientError {
    /// Whether this failure means the server never answered the call.
    ///
    /// These are the failures the facade answers with a single
    /// reconnect-and-resend.
    pub fn is_no_response(&self) -> bool {
        matches!(
            self,
            ToolClientError::Timeout { .. }
                | ToolClientError::Connection { .. }
                | ToolClientError::Transport { .. }
        )
    }

    /// Map onto the four-way failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolClientError::Timeout { .. } => ErrorKind::Timeout,
            ToolClientError::Protocol { .. } => ErrorKind::Protocol,
            ToolClientError::Tool { .. } => ErrorKind::Tool,
            ToolClientError::Http { status, .. } if *status < 500 => ErrorKind::Protocol,
            ToolClientError::Connection { .. }
            | ToolClientError::Transport { .. }
            | ToolClientError::Http { .. }
            | ToolClientError::NotReady { .. }
            | ToolClientError::Config { .. } => ErrorKind::Connection,
        }
    }

    /// The uniform `{"error": message}` value handed to domain callers.
    ///
    /// Server-side tool errors carry only the server's message; everything
    /// else uses the full display string.
    pub fn to_error_value(&self) -> serde_json::Value {
        let message = match self {
            ToolClientError::Tool { message, .. } => message.clone(),
            other => other.to_string(),
        };
        serde_json::json!({ "error": message })
    }
}
