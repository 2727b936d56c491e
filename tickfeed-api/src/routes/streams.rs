//! Publishing events into symbol streams

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::AppState;

/// Response for a published event
#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub id: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Create stream routes
pub fn routes() -> Router<AppState> {
    Router::new().route("/streams/{symbol}", post(publish_event))
}

/// Append the request body as an event on the symbol's stream
///
/// POST /api/streams/{symbol}
async fn publish_event(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    let symbol = symbol.trim();
    if symbol.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Symbol must not be empty".to_string(),
            }),
        )
            .into_response();
    }

    match state.source.publish_event(symbol, payload.to_string()).await {
        Ok(id) => {
            debug!("Published event {} on {}", id, symbol);
            (StatusCode::CREATED, Json(PublishResponse { id: id.to_string() })).into_response()
        }
        Err(e) => {
            warn!("Failed to publish event on {}: {}", symbol, e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}
