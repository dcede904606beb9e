//! meshdeck - control plane for a P2P port mapping overlay.
//!
//! Owns the node and mapping registries, drives multi-hop tunnel lifecycles
//! against an external engine, and serves telemetry to the dashboard.

mod config;
mod db;
mod engine;
mod error;
mod lifecycle;
mod registry;
mod scheduler;
mod telemetry;
mod web;

use config::ServerConfig;
use db::{Store, TelemetryStore};
use engine::{DetachedEngine, Engine, HttpEngine};
use scheduler::{PresenceMonitor, RetentionManager, Scheduler};
use web::{AppState, Server};

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Per-request bound for engine control calls made by the HTTP engine.
const ENGINE_HTTP_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("meshdeck=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting meshdeck on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);
    if cfg.api_tokens.is_empty() {
        tracing::warn!("No MESHDECK_API_TOKENS configured; every API request will be rejected");
    }

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    let telemetry = TelemetryStore::open(&cfg.db_path)?;
    tracing::info!("Database initialized successfully");

    let engine: Arc<dyn Engine> = match &cfg.engine_url {
        Some(url) => {
            tracing::info!("Using engine at {}", url);
            Arc::new(HttpEngine::new(url, cfg.engine_token.clone(), ENGINE_HTTP_TIMEOUT)?)
        }
        None => {
            tracing::warn!("No MESHDECK_ENGINE_URL set; running detached, tunnels cannot start");
            Arc::new(DetachedEngine)
        }
    };

    let scheduler_cfg = cfg.scheduler();
    let state = AppState::new(cfg, store.clone(), telemetry.clone(), engine.clone());

    // Operations cut short by the previous shutdown never finished
    state.controller.recover()?;

    let scheduler = Scheduler::new(
        engine,
        state.dispatcher.clone(),
        PresenceMonitor::new(store, scheduler_cfg.node_stale),
        RetentionManager::new(telemetry, scheduler_cfg.retention),
        scheduler_cfg,
    );
    scheduler.start();

    // Start web server
    let aggregator = state.aggregator.clone();
    let server = Server::new(state);
    server.start(shutdown_signal()).await?;

    tracing::info!("Shutting down");
    scheduler.stop();
    if let Err(e) = aggregator.flush().await {
        tracing::error!("Failed to flush buffered telemetry: {}", e);
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
