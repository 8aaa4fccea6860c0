//! Serving the façade.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use log::info;
use tokio::net::TcpListener;

use crate::http::routes::{router, AppState};

/// Binds `addr` and serves the façade until `shutdown` resolves.
///
/// The core of the system is OS-thread based; callers typically run
/// this future on a small runtime owned by the main thread (see the
/// binary) or a dedicated server thread.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("http façade listening on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server failed")
}
