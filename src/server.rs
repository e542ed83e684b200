//! HTTP server assembly
//!
//! One router serves both surfaces: the admin REST API and the
//! `/app/{key}` WebSocket endpoint.

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::api;
use crate::session;
use crate::supervisor::Supervisor;

pub const DEFAULT_PORT: u16 = 8111;

/// The full application router.
pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .merge(api::router())
        .merge(session::router())
        .with_state(supervisor)
}

/// Bind the configured address and serve until ctrl-c.
pub async fn run(supervisor: Arc<Supervisor>) -> std::io::Result<()> {
    let config = supervisor.config();
    let host = if config.host.is_empty() {
        "0.0.0.0"
    } else {
        config.host.as_str()
    };
    let port = if config.port == 0 {
        DEFAULT_PORT
    } else {
        config.port
    };

    if !config.certificate.is_empty() {
        // Certificate material is validated at config load; termination
        // itself belongs to a fronting proxy.
        warn!("TLS termination is delegated to a fronting proxy; serving plaintext");
    }

    let listener = TcpListener::bind((host, port)).await?;
    info!(
        host,
        port,
        num_applications = config.applications.len(),
        distributed = config.distributed(),
        "starting server"
    );

    axum::serve(listener, router(supervisor.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
