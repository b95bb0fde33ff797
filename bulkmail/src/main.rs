//! Bulkmail Worker - RabbitMQ consumer that runs campaign dispatches.
//!
//! This worker consumes dispatch jobs from the campaign_dispatch queue and,
//! for each, sends the campaign's message to every pending recipient through
//! the SMTP relay, recording outcomes and progress in the shared database.

mod consumer;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bulkmail::{Config, Dispatcher, SmtpTransport, SqliteStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    tracing::info!("worker_starting");

    // Load configuration from environment
    let config = Config::from_env();
    tracing::info!(
        cloudamqp_url_set = !config.cloudamqp_url.is_empty(),
        database_path = %config.database_path,
        smtp_host = %config.smtp_host,
        smtp_port = config.smtp_port,
        batch_size = config.batch_size,
        batch_delay_ms = config.batch_delay_ms,
        dispatch_concurrency = config.dispatch_concurrency,
        worker_concurrency = config.worker_concurrency,
        "config_loaded"
    );

    let store = Arc::new(
        SqliteStore::open(&config.database_path)
            .await
            .context("Failed to open database")?,
    );

    let transport = Arc::new(
        SmtpTransport::new(&config.smtp_settings()).context("Failed to create SMTP transport")?,
    );

    let dispatcher = Dispatcher::new(
        store.clone(),
        transport,
        store,
        config.dispatch_settings(),
    );

    // Start the consumer
    consumer::run(config, dispatcher).await?;

    Ok(())
}
