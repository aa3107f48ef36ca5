//! CLI command implementation for `flashpipe serve`

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::core::registry::InFlightDevices;
use crate::infra::devices::SystemInventory;
use crate::server::{self, AppState};

use super::AppContext;

/// Execute the serve command
pub async fn execute(ctx: &AppContext, listen: Option<String>) -> Result<()> {
    let addr = listen.unwrap_or_else(|| ctx.config.listen_addr().to_string());
    let orchestrator = ctx.orchestrator(Arc::new(InFlightDevices::new()))?;
    let state = AppState::new(orchestrator, Arc::new(SystemInventory::new()));

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    eprintln!("flashpipe listening on http://{}", listener.local_addr()?);

    server::serve(listener, state).await?;
    Ok(())
}
