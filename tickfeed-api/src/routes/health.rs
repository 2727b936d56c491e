//! Health check endpoints

use axum::{extract::State, response::Json, routing::get, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    /// Connections with at least one subscription
    connections: usize,
    /// Symbols with at least one subscriber
    symbols: usize,
    active_streams: usize,
    running_consumers: usize,
    uptime_secs: u64,
    server_time: DateTime<Utc>,
}

/// Health check handler
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let subscriptions = &state.feed.subscriptions;

    Json(HealthResponse {
        status: "healthy",
        connections: subscriptions.total_connections(),
        symbols: subscriptions.total_symbols(),
        active_streams: subscriptions.active_streams(),
        running_consumers: state.feed.supervisor.running_consumers(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        server_time: Utc::now(),
    })
}

/// Simple liveness check (always returns OK if server is running)
async fn liveness() -> &'static str {
    "OK"
}

/// Create health routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/live", get(liveness))
}
