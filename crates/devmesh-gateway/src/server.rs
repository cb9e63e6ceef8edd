//! Gateway server assembly.

use std::net::SocketAddr;

use devmesh_error::{DevmeshError, Result};
use tokio::net::TcpListener;
use tracing::info;

use crate::http::router;
use crate::state::GatewayState;

/// Background task handles, aborted on shutdown in reverse order.
pub struct BackgroundTasks {
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Abort every task, last started first.
    pub fn shutdown(mut self) {
        while let Some(handle) = self.handles.pop() {
            handle.abort();
        }
    }
}

/// Start the gateway's background loops: the first composition pass,
/// the periodic recomposer, and rate-limiter housekeeping.
pub async fn start_background(state: &GatewayState) -> BackgroundTasks {
    // First composition runs inline so the server starts routable.
    state.composer.recompose().await;

    let recompose = state
        .composer
        .spawn_loop(state.config.recompose_interval());

    let limiter = state.limiter.clone();
    let prune = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(120));
        loop {
            ticker.tick().await;
            limiter.prune();
        }
    });

    BackgroundTasks {
        handles: vec![recompose, prune],
    }
}

/// Serve until the process exits.
///
/// # Errors
///
/// Returns an error if the listener cannot bind.
pub async fn serve(state: GatewayState, addr: SocketAddr) -> Result<()> {
    let app = router(state)
        .into_make_service_with_connect_info::<SocketAddr>();

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| DevmeshError::config(format!("failed to bind {addr}: {e}")))?;

    info!(%addr, "gateway listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| DevmeshError::internal(format!("server error: {e}")))?;
    Ok(())
}
