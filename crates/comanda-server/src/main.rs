//! Comanda - Customer automation service entry point

use anyhow::Result;
use comanda_api::AppState;
use comanda_common::config::{Config, LoggingConfig};
use comanda_core::{
    AutomationOrchestrator, DeliveryWorker, EmailTransport, Metrics, TransportRegistry,
    WhatsAppTransport,
};
use comanda_storage::{DatabasePool, Repositories};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    init_logging(&config.logging);

    info!("Starting Comanda automation service...");

    // Initialize database
    let db_pool = DatabasePool::new(&config.database).await?;
    info!("Database connection established");

    // Run migrations
    db_pool.migrate().await?;
    info!("Database migrations completed");

    let repos = Repositories::postgres(db_pool.clone());
    let metrics = Arc::new(Metrics::new()?);

    // Outbound channels
    let timeout = Duration::from_secs(config.delivery.transport_timeout_secs);
    let transports = TransportRegistry::new()
        .with(Arc::new(WhatsAppTransport::new(timeout)?))
        .with(Arc::new(EmailTransport::new(timeout)));

    let orchestrator = Arc::new(AutomationOrchestrator::new(
        repos.clone(),
        config.automation.clone(),
        config.segmentation.clone(),
        metrics.clone(),
    ));

    let worker = Arc::new(DeliveryWorker::new(
        repos.clone(),
        transports,
        metrics.clone(),
        config.delivery.clone(),
    ));

    // Start delivery worker if enabled
    let worker_handle = if config.delivery.worker_enabled {
        let worker = worker.clone();
        info!(
            "Starting delivery worker (poll every {}s)",
            config.delivery.poll_interval_secs
        );
        Some(tokio::spawn(async move {
            worker.run().await;
        }))
    } else {
        info!("Delivery worker disabled");
        None
    };

    // Start daily scheduler if enabled
    let scheduler_handle = if config.automation.scheduler_enabled {
        let orchestrator = orchestrator.clone();
        info!(
            "Starting daily scheduler at {:02}:00 UTC",
            config.automation.daily_run_hour_utc
        );
        Some(tokio::spawn(async move {
            orchestrator.run_scheduled().await;
        }))
    } else {
        info!("Daily scheduler disabled, runs only via API");
        None
    };

    // Start API server
    let api_handle = {
        let state = AppState {
            repos,
            orchestrator,
            worker,
            metrics,
            job_secret: config.api.job_secret.clone(),
            db_pool: Some(db_pool),
        };
        if state.job_secret.is_none() {
            tracing::warn!("No job secret configured, job endpoints will reject every request");
        }

        let addr = format!("{}:{}", config.server.bind_address, config.api.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("Starting API server on {}", addr);

        tokio::spawn(async move {
            let app = comanda_api::create_router(state);
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("API server error: {}", e);
            }
        })
    };

    info!("Comanda service started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    api_handle.abort();
    if let Some(handle) = worker_handle {
        handle.abort();
    }
    if let Some(handle) = scheduler_handle {
        handle.abort();
    }

    info!("Comanda service shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},comanda=debug", config.level)));

    let registry = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
