//! Lazily-created process-wide client.
//!
//! Hosts that cannot thread a [`ToolClient`] handle through to every caller
//! use this instead. The client is created once, from the default config
//! unless one was installed first, and connected under the session lock so
//! concurrent first callers never spawn duplicate servers.

use std::sync::Arc;

use tokio::sync::OnceCell;

use super::client::ToolClient;
use super::errors::ToolClientError;
use crate::config;

static SHARED: OnceCell<Arc<ToolClient>> = OnceCell::const_new();

/// The shared client, created and connected on first use.
pub async fn shared_client() -> Result<Arc<ToolClient>, ToolClientError> {
    let client = SHARED
        .get_or_try_init(|| async {
            let config = config::load_default_config()?;
            ToolClient::new(config).map(Arc::new)
        })
        .await?;
    client.connect().await?;
    Ok(Arc::clone(client))
}

/// Install a specific client as the shared one. Fails if one already exists.
pub fn install_shared_client(client: ToolClient) -> Result<Arc<ToolClient>, ToolClientError> {
    let client = Arc::new(client);
    SHARED
        .set(Arc::clone(&client))
        .map_err(|_| ToolClientError::Config {
            reason: "shared tool client already initialized".into(),
        })?;
    Ok(client)
}

/// Disconnect the shared client, if it was ever created. Call on host shutdown.
pub async fn shutdown_shared_client() {
    if let Some(client) = SHARED.get() {
        client.disconnect().await;
    }
}
