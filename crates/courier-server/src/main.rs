//! # Courier Server
//!
//! Realtime chat delivery server: WebSocket event relay, cross-process
//! fan-out over Redis, and the call signaling API.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! COURIER_JWT_SECRET=... courier
//!
//! # Run with environment variables
//! COURIER_PORT=8080 COURIER_HOST=0.0.0.0 COURIER_JWT_SECRET=... courier
//! ```

mod config;
mod metrics;
mod redis;
mod routes;
mod store;
mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use courier_core::bridge::PubSubBridge;
use courier_core::bus::EventBus;
use courier_core::calls::CallSignalingService;
use courier_core::registry::ConnectionRegistry;
use courier_core::router::EventRouter;
use courier_core::{RateLimiter, TokenGate};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;
    if config.auth.jwt_secret.is_empty() {
        anyhow::bail!("auth.jwt_secret (or COURIER_JWT_SECRET) must be set");
    }

    tracing::info!("Starting Courier server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Connect backends
    let backend = crate::redis::RedisBackend::connect(&config.backends.redis_url)
        .await
        .context("Redis is required for pub/sub, rate limiting and call snapshots")?;
    let call_store = store::SqliteCallStore::open(&config.backends.database_path)
        .context("Failed to open the call database")?;

    // Assemble the relay
    let registry = Arc::new(ConnectionRegistry::new());
    let bus: Arc<dyn EventBus> = Arc::new(backend.clone());
    let bridge = Arc::new(PubSubBridge::new(bus.clone(), registry.clone()));
    let limiter = RateLimiter::new(Arc::new(backend.clone()));
    let gate = Arc::new(TokenGate::new(
        config.auth.jwt_secret.as_bytes(),
        Arc::new(backend.clone()),
    ));
    let router = Arc::new(EventRouter::new(
        registry.clone(),
        bridge.clone(),
        limiter.clone(),
    ));
    let calls = Arc::new(CallSignalingService::new(
        Arc::new(call_store),
        Arc::new(backend),
        bus,
        limiter.clone(),
    ));

    let state = Arc::new(routes::AppState {
        registry,
        bridge,
        router,
        gate,
        limiter,
        calls,
        config,
    });

    // Start the server
    routes::run_server(state).await?;

    Ok(())
}
