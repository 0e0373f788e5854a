//! Per-queue consumer loop: claim, execute the stub workload, record the
//! outcome, and route failures through the retry/DLQ lanes.
//!
//! Implements the worker's message handler exactly: a malformed body is
//! dead-lettered outright; a failed claim (task no longer `PENDING`, e.g.
//! already cancelled) is a silent ack; an execution failure (raised by
//! `execute` or by `complete` immediately after it) transitions the task to
//! `FAILED` and republishes to the *delayed* retry lane, since the retry is
//! a best-effort re-enqueue rather than a real re-execution (the conditional
//! claim will just no-op once the task reaches `FAILED`); an infrastructure
//! failure (the claim call itself erroring, task state untouched) rolls
//! back and republishes to the *same* primary queue immediately, so another
//! worker can attempt the claim without waiting out a delay lane. Both
//! retry paths fall through to the DLQ once `x-retry-count` exceeds
//! `MAX_RETRIES`.

use futures_lite::StreamExt;
use lapin::{message::Delivery, options::BasicAckOptions, Channel, Connection, ConnectionProperties};
use serde::Deserialize;
use std::sync::Arc;
use task_core::TaskStore;
use taskdisp_broker::{create_consumer, declare_topology, retry_count_from_headers, BrokerPublisher};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{config::Config, metrics};

#[derive(Debug, Deserialize)]
struct TaskMessage {
    task_id: Uuid,
}

/// Supervisory loop: reconnect and keep consuming `queue` until `shutdown`
/// fires, following the pack's webhook-dispatcher `run`/`run_inner` split.
pub async fn run(
    queue: String,
    config: Arc<Config>,
    tasks: Arc<dyn TaskStore>,
    broker: Arc<BrokerPublisher>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let mut shutdown_clone = shutdown_rx.resubscribe();
        match run_inner(&queue, &config, &tasks, &broker, &mut shutdown_clone).await {
            Ok(()) => return,
            Err(e) => {
                if shutdown_rx.try_recv().is_ok() {
                    return;
                }
                error!(queue = %queue, error = %e, "consumer error, restarting in 5s");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        }
    }
}

async fn run_inner(
    queue: &str,
    config: &Config,
    tasks: &Arc<dyn TaskStore>,
    broker: &Arc<BrokerPublisher>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<(), anyhow::Error> {
    let conn = Connection::connect(&config.broker.url, ConnectionProperties::default()).await?;
    let channel = conn.create_channel().await?;

    declare_topology(&channel, &config.worker.queues, &config.broker.retry_delays_seconds).await?;

    let mut consumer = create_consumer(
        &channel,
        queue,
        &format!("worker-{queue}"),
        config.worker.prefetch,
    )
    .await?;

    let mut in_flight = JoinSet::new();
    let max_concurrent = config.worker.prefetch as usize;

    info!(queue = %queue, prefetch = config.worker.prefetch, "worker consumer started");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!(queue = %queue, "shutting down consumer");
                break;
            }

            Some(res) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = res {
                    error!(queue = %queue, error = %e, "delivery handler task panicked");
                }
            }

            delivery = consumer.next(), if in_flight.len() < max_concurrent => {
                match delivery {
                    Some(Ok(delivery)) => {
                        let queue = queue.to_string();
                        let tasks = tasks.clone();
                        let channel = channel.clone();
                        let broker = broker.clone();
                        let max_retries = config.worker.max_retries;
                        in_flight.spawn(async move {
                            handle_delivery(&queue, delivery, &tasks, &channel, &broker, max_retries).await;
                        });
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                }
            }
        }
    }

    while let Some(res) = in_flight.join_next().await {
        if let Err(e) = res {
            error!(queue = %queue, error = %e, "delivery handler task panicked during drain");
        }
    }

    Ok(())
}

async fn handle_delivery(
    queue: &str,
    delivery: Delivery,
    tasks: &Arc<dyn TaskStore>,
    channel: &Channel,
    broker: &Arc<BrokerPublisher>,
    max_retries: u32,
) {
    let task_id = match serde_json::from_slice::<TaskMessage>(&delivery.data) {
        Ok(msg) => msg.task_id,
        Err(e) => {
            warn!(queue = %queue, error = %e, "malformed delivery, routing to DLQ");
            metrics::record_dlq(queue, "malformed");
            if let Err(e) = broker.publish_dlq(&delivery.data, delivery.properties.headers().clone().unwrap_or_default()).await {
                error!(queue = %queue, error = %e, "failed to publish malformed delivery to DLQ");
            }
            ack(&delivery).await;
            return;
        }
    };

    match tasks.claim(task_id).await {
        Ok(0) => {
            info!(queue = %queue, task_id = %task_id, "task no longer pending, skipping");
            metrics::record_claim(queue, "skipped");
            ack(&delivery).await;
        }
        Ok(_) => {
            metrics::record_claim(queue, "claimed");
            info!(queue = %queue, task_id = %task_id, "processing task");

            let outcome = match execute(task_id) {
                Ok(result) => tasks.complete(task_id, &result).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            match outcome {
                Ok(_) => {
                    info!(queue = %queue, task_id = %task_id, "task completed");
                }
                Err(err) => {
                    // The task already transitioned to IN_PROGRESS, so this is
                    // an execution failure, not an infrastructure one: it
                    // takes the delayed retry lane rather than an immediate
                    // same-queue republish.
                    warn!(queue = %queue, task_id = %task_id, error = %err, "task execution failed");
                    if let Err(fail_err) = tasks.fail(task_id, &err).await {
                        error!(queue = %queue, task_id = %task_id, error = %fail_err, "failed to record task failure");
                    }

                    let retry_count = retry_count_from_headers(delivery.properties.headers()) + 1;
                    if retry_count > max_retries {
                        metrics::record_dlq(queue, "retries_exhausted");
                        if let Err(e) = broker
                            .publish_dlq(&delivery.data, delivery.properties.headers().clone().unwrap_or_default())
                            .await
                        {
                            error!(queue = %queue, task_id = %task_id, error = %e, "failed to publish exhausted delivery to DLQ");
                        }
                    } else if let Err(e) = broker.publish_retry(queue, &delivery.data, retry_count).await {
                        error!(queue = %queue, task_id = %task_id, error = %e, "failed to republish to retry lane");
                    }
                }
            }
            ack(&delivery).await;
        }
        Err(e) => {
            // Claim itself failed (DB/connection trouble) - task state is
            // untouched, so another worker should be free to retry the
            // claim immediately rather than waiting out a delay lane.
            let retry_count = retry_count_from_headers(delivery.properties.headers()) + 1;
            warn!(queue = %queue, task_id = %task_id, error = %e, retry_count, "claim failed, treating as infrastructure error");

            if retry_count > max_retries {
                metrics::record_dlq(queue, "retries_exhausted");
                if let Err(e) = broker
                    .publish_dlq(&delivery.data, delivery.properties.headers().clone().unwrap_or_default())
                    .await
                {
                    error!(queue = %queue, task_id = %task_id, error = %e, "failed to publish exhausted delivery to DLQ");
                }
            } else if let Err(e) = broker.republish_immediate(queue, &delivery.data, retry_count).await {
                error!(queue = %queue, task_id = %task_id, error = %e, "failed to republish to primary queue");
            }
            ack(&delivery).await;
        }
    }
}

/// The pluggable workload. Always succeeds in this deployment; returns a
/// `Result` so the execution-failure branch above stays real rather than
/// unreachable dead code.
fn execute(task_id: Uuid) -> Result<String, anyhow::Error> {
    Ok(format!("ok:{task_id}"))
}

async fn ack(delivery: &Delivery) {
    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
        error!(error = %e, delivery_tag = delivery.delivery_tag, "failed to ack delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_is_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(execute(id).unwrap(), format!("ok:{id}"));
        assert_eq!(execute(id).unwrap(), execute(id).unwrap());
    }

    #[test]
    fn test_task_message_parses_task_id() {
        let id = Uuid::new_v4();
        let body = serde_json::json!({ "task_id": id }).to_string();
        let parsed: TaskMessage = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.task_id, id);
    }

    #[test]
    fn test_task_message_rejects_malformed_body() {
        let result = serde_json::from_slice::<TaskMessage>(b"not json");
        assert!(result.is_err());

        let missing_field = serde_json::from_slice::<TaskMessage>(b"{}");
        assert!(missing_field.is_err());
    }
}
