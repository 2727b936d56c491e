//! API route definitions

mod health;
mod streams;
pub mod ws;

use axum::{
    http::{header, Method},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::AppState;

/// Create all API routes
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(streams::routes())
}

/// Create WebSocket routes (separate from API)
pub fn ws_routes(path: &str) -> Router<AppState> {
    ws::routes(path)
}

/// Full application router with middleware
pub fn app(state: AppState, ws_path: &str) -> Router {
    // Browser clients connect from arbitrary origins
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .nest("/api", api_routes())
        .merge(ws_routes(ws_path))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
