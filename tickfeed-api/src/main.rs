//! Tick Feed API Server
//!
//! WebSocket server that fans out per-symbol tick streams to subscribed clients.

mod config;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tickfeed_services::{
    FeedState, MemoryStreamSource, RedisStreamSource, StreamSource, SubscriptionRegistry,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::ServerConfig;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub feed: FeedState,
    /// Stream source backing the feed; the publish route appends to it
    pub source: Arc<dyn StreamSource>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(feed: FeedState, source: Arc<dyn StreamSource>) -> Self {
        Self {
            feed,
            source,
            started_at: Instant::now(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env.local file
    if let Err(e) = dotenvy::from_filename(".env.local") {
        // Not an error if the file doesn't exist
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env.local: {}", e);
        }
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,tickfeed_api=debug,tickfeed_services=debug")
        }))
        .init();

    info!("Starting Tick Feed API");

    let config = ServerConfig::from_env()?;
    info!("Loaded configuration: {:?}", config);

    let source: Arc<dyn StreamSource> = match config.redis_stream() {
        Some(redis) => Arc::new(
            RedisStreamSource::connect(redis)
                .await
                .context("Failed to connect to Redis")?,
        ),
        None => {
            info!("REDIS_URL not set, using the in-process stream source");
            Arc::new(MemoryStreamSource::new(config.stream.clone()))
        }
    };
    let subscriptions = Arc::new(SubscriptionRegistry::with_buckets(config.registry_buckets));
    let feed = FeedState::new(
        subscriptions,
        source.clone(),
        config.session.clone(),
        config.consumer.clone(),
    );

    let state = AppState::new(feed, source);
    let app = routes::app(state, &config.ws_path);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(
        "Server listening on http://{} (WebSocket at {})",
        addr, config.ws_path
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
