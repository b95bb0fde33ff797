//! Bulkmail Web Server - campaign intake and status API.
//!
//! This binary provides a thin web server that:
//! - Accepts campaigns, stores them and enqueues a dispatch run
//! - Reports campaign and run progress from the shared database
//! - Sends single test messages through the SMTP relay
//!
//! Dispatching happens in the background worker.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bulkmail::web::{router, AppState};
use bulkmail::{Config, Intake, Publisher, SmtpTransport, SqliteStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        port = config.port,
        database_path = %config.database_path,
        smtp_host = %config.smtp_host,
        max_recipients = config.max_recipients,
        "config_loaded"
    );

    let store = Arc::new(
        SqliteStore::open(&config.database_path)
            .await
            .context("Failed to open database")?,
    );

    // Create RabbitMQ publisher
    let publisher = Publisher::new(config.cloudamqp_url.clone());
    info!("rabbitmq_publisher_created");

    let transport = Arc::new(
        SmtpTransport::new(&config.smtp_settings()).context("Failed to create SMTP transport")?,
    );

    let intake = Intake::new(
        store.clone(),
        store.clone(),
        Arc::new(publisher.clone()),
        config.max_recipients,
    );

    // Create application state
    let state = AppState::new(intake, store.clone(), store, transport);

    let app = router(state);

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Close publisher connection
    publisher.close().await;

    info!("web_server_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("web_server_shutting_down");
}
