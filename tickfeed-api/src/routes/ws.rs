//! WebSocket route handler
//!
//! Handles the WebSocket upgrade and adapts the axum socket to the
//! tungstenite message types the feed sessions work with.

use std::io;

use axum::{
    extract::{
        ws::{self, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{future, SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{
    self,
    protocol::{frame::coding::CloseCode, CloseFrame},
    Message,
};
use tracing::info;

use crate::AppState;

/// Create WebSocket routes
pub fn routes(path: &str) -> Router<AppState> {
    Router::new().route(path, get(ws_handler))
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket upgrade request received");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle an established WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sender, receiver) = socket.split();

    let sink = sender
        .sink_map_err(transport_error)
        .with(|message: Message| future::ready(to_axum(message)));
    let stream = receiver.map(|result| result.map(from_axum).map_err(transport_error));

    let reason = state.feed.handle_split(sink, stream).await;
    info!("WebSocket session ended: {}", reason);
}

fn transport_error(e: axum::Error) -> tungstenite::Error {
    tungstenite::Error::Io(io::Error::other(e))
}

fn from_axum(message: ws::Message) -> Message {
    match message {
        ws::Message::Text(text) => Message::text(text.as_str()),
        ws::Message::Binary(data) => Message::Binary(data),
        ws::Message::Ping(data) => Message::Ping(data),
        ws::Message::Pong(data) => Message::Pong(data),
        ws::Message::Close(frame) => Message::Close(frame.map(|frame| CloseFrame {
            code: CloseCode::from(frame.code),
            reason: frame.reason.as_str().to_string().into(),
        })),
    }
}

fn to_axum(message: Message) -> Result<ws::Message, tungstenite::Error> {
    let message = match message {
        Message::Text(text) => ws::Message::Text(text.as_str().to_string().into()),
        Message::Binary(data) => ws::Message::Binary(data),
        Message::Ping(data) => ws::Message::Ping(data),
        Message::Pong(data) => ws::Message::Pong(data),
        Message::Close(frame) => ws::Message::Close(frame.map(|frame| ws::CloseFrame {
            code: frame.code.into(),
            reason: frame.reason.as_str().to_string().into(),
        })),
        Message::Frame(_) => {
            return Err(tungstenite::Error::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                "raw frames cannot be written",
            )))
        }
    };
    Ok(message)
}
