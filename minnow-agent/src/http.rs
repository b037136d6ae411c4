//! Liveness probe
//!
//! - `GET /`       204 when the last heartbeat write succeeded, 503 otherwise
//! - `GET /status` health snapshot and store connection status as JSON

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::connection::{ConnectionHandle, ConnectionStatus};
use crate::health::{HealthExporter, HealthSnapshot};

#[derive(Clone)]
pub struct ProbeState {
    pub health: HealthExporter,
    pub connection: ConnectionHandle,
}

#[derive(Debug, Serialize)]
struct StatusView {
    heartbeat: HealthSnapshot,
    store: ConnectionStatus,
}

pub fn build_router(state: ProbeState) -> Router {
    Router::new()
        .route("/", get(ping))
        .route("/status", get(status))
        .with_state(state)
}

async fn ping(State(state): State<ProbeState>) -> StatusCode {
    if state.health.last_heartbeat_failed() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::NO_CONTENT
    }
}

async fn status(State(state): State<ProbeState>) -> Json<StatusView> {
    Json(StatusView {
        heartbeat: state.health.snapshot(),
        store: state.connection.status(),
    })
}

/// Serve the probe until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, state: ProbeState, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "health probe listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
