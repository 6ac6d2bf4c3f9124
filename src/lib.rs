//! Client for external JSON-RPC tool servers used by the physics diagram
//! agents.
//!
//! - [`tool_client`]: sessions, handshake, correlation, reconnect, result
//!   normalization.
//! - [`config`]: `tool-client.yaml` loading.
//! - [`logging`]: tracing subscriber setup for hosts and the CLI.
//! - [`particles`]: typed helpers for the particle-physics server's tools.

pub mod config;
pub mod logging;
pub mod particles;
pub mod tool_client;

pub use tool_client::{ToolClient, ToolClientError};
