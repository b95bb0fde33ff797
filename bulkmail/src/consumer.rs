//! RabbitMQ consumer module using lapin.
//!
//! This module handles connecting to RabbitMQ, consuming dispatch jobs from
//! the campaign_dispatch queue, and spawning one task per run. A message is
//! acknowledged only after its run finishes, so a worker that dies mid-run
//! has the job redelivered and the next run resumes from pending recipients.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use futures::StreamExt;
use lapin::{
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel, Connection, ConnectionProperties,
};
use tokio::signal;
use tracing::{error, info, warn};

use bulkmail::{Config, DispatchError, DispatchJob, Dispatcher, DISPATCH_QUEUE};

/// Run ids currently executing in this process.
#[derive(Clone, Default)]
struct InFlight {
    runs: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    /// Claim a run id. False if it is already executing.
    fn claim(&self, run_id: &str) -> bool {
        self.runs
            .lock()
            .map(|mut runs| runs.insert(run_id.to_string()))
            .unwrap_or(false)
    }

    fn release(&self, run_id: &str) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.remove(run_id);
        }
    }
}

/// Run the RabbitMQ consumer.
///
/// This function:
/// 1. Connects to RabbitMQ using the configured URL
/// 2. Sets up QoS so at most `worker_concurrency` runs are in flight
/// 3. Declares the queue (idempotent operation)
/// 4. Starts consuming messages, spawning a task for each run
/// 5. Handles graceful shutdown on SIGINT/SIGTERM
pub async fn run(config: Config, dispatcher: Dispatcher) -> Result<()> {
    let dispatcher = Arc::new(dispatcher);

    info!(url_length = config.cloudamqp_url.len(), "rabbitmq_connecting");

    let conn = Connection::connect(&config.cloudamqp_url, ConnectionProperties::default())
        .await
        .context("Failed to connect to RabbitMQ")?;

    info!("rabbitmq_connected");

    let channel = conn.create_channel().await.context("Failed to create channel")?;

    info!("rabbitmq_channel_created");

    // Each unacked message is one running campaign, so prefetch bounds concurrency.
    let prefetch_count = config.worker_concurrency.clamp(1, u16::MAX as usize) as u16;
    channel
        .basic_qos(prefetch_count, BasicQosOptions::default())
        .await
        .context("Failed to set QoS")?;

    info!(prefetch_count = prefetch_count, "rabbitmq_qos_set");

    channel
        .queue_declare(
            DISPATCH_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("Failed to declare queue")?;

    info!(queue = DISPATCH_QUEUE, "rabbitmq_queue_declared");

    let mut consumer = channel
        .basic_consume(
            DISPATCH_QUEUE,
            "bulkmail-worker",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("Failed to start consumer")?;

    info!(queue = DISPATCH_QUEUE, "rabbitmq_consumer_started");
    info!("worker_ready");

    let channel = Arc::new(channel);
    let in_flight = InFlight::default();

    let shutdown = async {
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
    };

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                // Unacked runs are redelivered to the next worker and resume there.
                info!("worker_stopping");
                break;
            }
            delivery = consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        let delivery_tag = delivery.delivery_tag;

                        let job: DispatchJob = match serde_json::from_slice(&delivery.data) {
                            Ok(job) => job,
                            Err(e) => {
                                error!(
                                    delivery_tag = delivery_tag,
                                    error = %e,
                                    "rabbitmq_job_parse_failed"
                                );
                                // Unparseable payloads would fail again; drop them.
                                nack(&channel, delivery_tag, false).await;
                                continue;
                            }
                        };

                        info!(
                            queue = DISPATCH_QUEUE,
                            run_id = %job.run_id,
                            campaign_id = job.campaign_id,
                            delivery_tag = delivery_tag,
                            "rabbitmq_job_received"
                        );

                        if !in_flight.claim(&job.run_id) {
                            warn!(run_id = %job.run_id, "dispatch_run_already_in_flight");
                            ack(&channel, delivery_tag).await;
                            continue;
                        }

                        let dispatcher = Arc::clone(&dispatcher);
                        let channel = Arc::clone(&channel);
                        let in_flight = in_flight.clone();

                        tokio::spawn(async move {
                            match dispatcher.run(&job.run_id, job.campaign_id).await {
                                Ok(summary) => info!(
                                    run_id = %job.run_id,
                                    campaign_id = job.campaign_id,
                                    sent = summary.sent,
                                    failed = summary.failed,
                                    skipped = summary.skipped,
                                    "rabbitmq_job_completed"
                                ),
                                Err(DispatchError::CampaignNotFound(id)) => warn!(
                                    run_id = %job.run_id,
                                    campaign_id = id,
                                    "rabbitmq_job_campaign_missing"
                                ),
                                Err(e) => error!(
                                    run_id = %job.run_id,
                                    campaign_id = job.campaign_id,
                                    error = %e,
                                    "rabbitmq_job_failed"
                                ),
                            }

                            in_flight.release(&job.run_id);
                            ack(&channel, delivery_tag).await;
                        });
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "rabbitmq_delivery_error");
                    }
                    None => {
                        warn!("rabbitmq_consumer_closed");
                        break;
                    }
                }
            }
        }
    }

    info!("worker_shutdown_complete");
    Ok(())
}

async fn ack(channel: &Channel, delivery_tag: u64) {
    if let Err(e) = channel
        .basic_ack(delivery_tag, BasicAckOptions::default())
        .await
    {
        error!(delivery_tag = delivery_tag, error = %e, "rabbitmq_ack_failed");
    }
}

async fn nack(channel: &Channel, delivery_tag: u64, requeue: bool) {
    if let Err(e) = channel
        .basic_nack(
            delivery_tag,
            BasicNackOptions {
                requeue,
                ..Default::default()
            },
        )
        .await
    {
        error!(delivery_tag = delivery_tag, error = %e, "rabbitmq_nack_failed");
    }
}
