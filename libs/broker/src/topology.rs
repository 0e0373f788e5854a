//! Queue topology declaration: primary priority queues, a DLQ, and a
//! per-queue retry lane for each configured delay.
//!
//! A retry lane is a durable queue with a message TTL and a dead-letter
//! exchange pointing back at the primary queue: publishing to
//! `tasks.high.retry.30s` parks a message for 30 seconds, after which
//! RabbitMQ dead-letters it straight back onto `tasks.high`. This gives
//! delayed redelivery without an in-process timer.

use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, LongString},
    Channel,
};
use tracing::debug;

use crate::error::BrokerError;

pub const DLQ_NAME: &str = "tasks.dlq";

pub fn retry_queue_name(primary: &str, delay_seconds: u64) -> String {
    format!("{primary}.retry.{delay_seconds}s")
}

async fn declare_durable(channel: &Channel, queue: &str, args: FieldTable) -> Result<(), BrokerError> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            args,
        )
        .await
        .map_err(|source| BrokerError::QueueDeclarationFailed {
            queue: queue.to_string(),
            source,
        })?;
    Ok(())
}

/// Idempotently declare the primary queues, the DLQ, and a retry lane per
/// `(primary queue, delay)` pair. Safe to call on every startup.
pub async fn declare_topology(
    channel: &Channel,
    primary_queues: &[String],
    retry_delays_seconds: &[u64],
) -> Result<(), BrokerError> {
    for queue in primary_queues {
        declare_durable(channel, queue, FieldTable::default()).await?;
        debug!(queue = %queue, "declared primary queue");
    }

    declare_durable(channel, DLQ_NAME, FieldTable::default()).await?;
    debug!(queue = DLQ_NAME, "declared dead-letter queue");

    for primary in primary_queues {
        for delay in retry_delays_seconds {
            let name = retry_queue_name(primary, *delay);
            let mut args = FieldTable::default();
            args.insert(
                "x-message-ttl".into(),
                AMQPValue::LongInt((*delay as i32) * 1000),
            );
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(LongString::from("")),
            );
            args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(LongString::from(primary.as_str())),
            );
            declare_durable(channel, &name, args).await?;
            debug!(queue = %name, delay_seconds = delay, "declared retry lane");
        }
    }

    Ok(())
}
