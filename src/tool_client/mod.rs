//! Tool client: JSON-RPC sessions with external tool servers.
//!
//! Layers, leaf to root:
//! - [`transport`]: child-process stdio or HTTP POST, behind one trait.
//! - [`codec`]: newline-delimited frames and non-finite number sanitization.
//! - [`correlator`]: ids, in-flight calls, timeouts, one reader task.
//! - [`session`]: transport selection, `initialize` handshake, state machine.
//! - [`client`]: `call_tool`, reconnect-once, uniform `{"error": ...}` shape.
//!
//! Typical use:
//!
//! ```no_run
//! # async fn demo() -> Result<(), physics_tool_client::tool_client::ToolClientError> {
//! use physics_tool_client::config::load_default_config;
//! use physics_tool_client::tool_client::ToolClient;
//!
//! let client = ToolClient::new(load_default_config()?)?;
//! let result = client
//!     .call_tool("search_particle", serde_json::json!({"query": "electron"}))
//!     .await;
//! # Ok(()) }
//! ```

pub mod client;
pub mod codec;
pub mod correlator;
pub mod envelope;
pub mod errors;
pub mod session;
pub mod shared;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ClientStatus, ToolClient};
pub use errors::{ErrorKind, ToolClientError};
pub use session::SessionState;
pub use shared::{install_shared_client, shared_client, shutdown_shared_client};
pub use transport::TransportKind;
