//! HTTP health endpoints, served beside the WebSocket listener.
//!
//! - `/health` — status, version, uptime, live stats.
//! - `/health/live` — static liveness.
//! - `/health/ready` — OK only once storage (and the pub/sub bus, when
//!   enabled) pass their health checks and the server is not draining.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::server::SyncServer;

/// Resident set size in bytes, best effort.
fn memory_usage_bytes() -> u64 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    let resident_pages: u64 = statm
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    resident_pages * 4096
}

async fn health_handler(State(server): State<Arc<SyncServer>>) -> Json<Value> {
    let stats = server.stats().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": server.uptime().as_secs(),
        "stats": {
            "connections": stats.active_connections,
            "documents": stats.documents,
            "memoryUsage": memory_usage_bytes(),
        },
    }))
}

async fn live_handler() -> &'static str {
    "OK"
}

async fn ready_handler(State(server): State<Arc<SyncServer>>) -> (StatusCode, &'static str) {
    if !server.ready_flag().load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "draining");
    }
    if server.storage().health_check().await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable");
    }
    if server.config().pubsub.enabled && server.pubsub().health_check().await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "pubsub unavailable");
    }
    (StatusCode::OK, "OK")
}

/// Build the health router over the server handle.
pub fn build_router(server: Arc<SyncServer>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(live_handler))
        .route("/health/ready", get(ready_handler))
        .with_state(server)
}

/// Serve the health router on its own port until the process exits.
pub async fn serve(server: Arc<SyncServer>, http_port: u16) {
    let addr = format!("{}:{}", server.config().host, http_port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("health endpoint bind failed on {addr}: {e}");
            return;
        }
    };
    log::info!("health endpoints on {addr}");
    if let Err(e) = axum::serve(listener, build_router(server)).await {
        log::error!("health server failed: {e}");
    }
}
