//! ProxyGauge - SOCKS5 Proxy Connectivity and Performance Tester
//!
//! Tests proxy endpoints for reachability, latency, external IP and
//! download throughput, and keeps their stored status in sync.

mod config;
mod db;
mod probe;
mod runner;
mod web;

use config::ServerConfig;
use db::Store;
use probe::ProbeSettings;
use runner::{Reconciler, Runner};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("proxygauge=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting ProxyGauge on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Wire up the test pipeline
    let settings = ProbeSettings::from_config(&cfg);
    let runner = Arc::new(Runner::new(
        store.clone(),
        settings,
        cfg.test_deleted_targets,
    ));
    let reconciler = Arc::new(Reconciler::new(store.clone(), store.clone()));

    // Start web server
    let server = Server::new(cfg, runner, reconciler);
    server.start().await?;

    Ok(())
}
