//! AMQP (RabbitMQ) adapter for the task dispatch broker.
//!
//! The generic outbox engine is built around a broker-agnostic
//! `OutboxPublisher` trait; Kafka cannot express the per-message-TTL +
//! dead-letter-exchange retry lanes this system needs, so this adapter is
//! built on `lapin` instead.

mod error;
pub mod topology;

pub use error::BrokerError;
pub use topology::{declare_topology, retry_queue_name, DLQ_NAME};

use async_trait::async_trait;
use lapin::{
    options::{BasicConsumeOptions, BasicPublishOptions, BasicQosOptions},
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;
use transactional_outbox::{OutboxEvent, OutboxPublisher, OutboxResult};

pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Connect to the broker, retrying once per second up to `max_attempts`
/// times (60 attempts for the publisher, 120 for the worker).
pub async fn connect_with_retry(amqp_url: &str, max_attempts: u32) -> Result<Connection, BrokerError> {
    let mut last_err = None;
    for attempt in 1..=max_attempts {
        match Connection::connect(amqp_url, ConnectionProperties::default()).await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(attempt, max_attempts, error = %e, "broker connect attempt failed");
                last_err = Some(e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    Err(BrokerError::ConnectionFailed(
        last_err.map(|e| e.to_string()).unwrap_or_default(),
    ))
}

/// Publishes to the primary queues, the DLQ, and per-queue retry lanes.
///
/// Holds a single lazily-established connection/channel behind a mutex,
/// torn down and reconnected on the next publish if a send fails.
pub struct BrokerPublisher {
    amqp_url: String,
    primary_queues: Vec<String>,
    retry_delays_seconds: Vec<u64>,
    connect_attempts: u32,
    inner: Mutex<Option<(Connection, Channel)>>,
}

impl BrokerPublisher {
    pub fn new(
        amqp_url: String,
        primary_queues: Vec<String>,
        retry_delays_seconds: Vec<u64>,
        connect_attempts: u32,
    ) -> Self {
        Self {
            amqp_url,
            primary_queues,
            retry_delays_seconds,
            connect_attempts,
            inner: Mutex::new(None),
        }
    }

    async fn ensure_channel(&self) -> Result<Channel, BrokerError> {
        let mut guard = self.inner.lock().await;

        if let Some((conn, channel)) = guard.as_ref() {
            if conn.status().connected() && channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let conn = connect_with_retry(&self.amqp_url, self.connect_attempts).await?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| BrokerError::ChannelFailed(e.to_string()))?;

        declare_topology(&channel, &self.primary_queues, &self.retry_delays_seconds).await?;

        let channel_clone = channel.clone();
        *guard = Some((conn, channel));
        Ok(channel_clone)
    }

    async fn invalidate(&self) {
        let mut guard = self.inner.lock().await;
        *guard = None;
    }

    async fn publish_raw(&self, routing_key: &str, body: &[u8], headers: FieldTable) -> Result<(), BrokerError> {
        let channel = self.ensure_channel().await?;

        let props = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_headers(headers);

        let result = channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                body,
                props,
            )
            .await;

        match result {
            Ok(confirm) => {
                confirm
                    .await
                    .map_err(|e| BrokerError::PublishFailed(e.to_string()))?;
                Ok(())
            }
            Err(e) => {
                self.invalidate().await;
                Err(BrokerError::PublishFailed(e.to_string()))
            }
        }
    }

    /// Publish a message to a named queue (direct routing, default exchange).
    pub async fn publish(&self, routing_key: &str, body: &[u8]) -> Result<(), BrokerError> {
        self.publish_raw(routing_key, body, FieldTable::default()).await
    }

    /// Publish a message to the dead-letter queue.
    pub async fn publish_dlq(&self, body: &[u8], headers: FieldTable) -> Result<(), BrokerError> {
        self.publish_raw(DLQ_NAME, body, headers).await
    }

    /// Publish to the retry lane matching `retry_count` (1-indexed), falling
    /// back to the longest configured delay once `retry_count` exceeds the
    /// number of lanes.
    pub async fn publish_retry(
        &self,
        primary_queue: &str,
        body: &[u8],
        retry_count: u32,
    ) -> Result<(), BrokerError> {
        let idx = (retry_count.saturating_sub(1) as usize).min(self.retry_delays_seconds.len() - 1);
        let delay = self.retry_delays_seconds[idx];
        let queue = retry_queue_name(primary_queue, delay);

        let mut headers = FieldTable::default();
        headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongUInt(retry_count));

        self.publish_raw(&queue, body, headers).await
    }

    /// Republish to the same primary queue, no delay lane, because the task
    /// row never transitioned — used for infrastructure failures where
    /// another worker should be free to attempt the claim immediately.
    pub async fn republish_immediate(
        &self,
        primary_queue: &str,
        body: &[u8],
        retry_count: u32,
    ) -> Result<(), BrokerError> {
        let mut headers = FieldTable::default();
        headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongUInt(retry_count));
        self.publish_raw(primary_queue, body, headers).await
    }
}

#[async_trait]
impl OutboxPublisher for BrokerPublisher {
    async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()> {
        let body = serde_json::to_vec(&event.payload)
            .map_err(transactional_outbox::OutboxError::SerializationError)?;

        BrokerPublisher::publish(self, &event.routing_key, &body)
            .await
            .map_err(|e| transactional_outbox::OutboxError::PublishFailed(e.to_string()))
    }
}

/// Open a consumer on `queue` with manual ack and the given prefetch count.
pub async fn create_consumer(
    channel: &Channel,
    queue: &str,
    consumer_tag: &str,
    prefetch: u16,
) -> Result<Consumer, BrokerError> {
    channel
        .basic_qos(prefetch, BasicQosOptions::default())
        .await
        .map_err(|e| BrokerError::ChannelFailed(e.to_string()))?;

    channel
        .basic_consume(
            queue,
            consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::ChannelFailed(e.to_string()))
}

/// Read the `x-retry-count` header off a delivery, defaulting to 0.
pub fn retry_count_from_headers(headers: &Option<FieldTable>) -> u32 {
    let Some(table) = headers.as_ref() else {
        return 0;
    };
    match table.inner().get(RETRY_COUNT_HEADER) {
        Some(AMQPValue::LongUInt(n)) => *n,
        Some(AMQPValue::LongInt(n)) => (*n).try_into().unwrap_or(0),
        Some(AMQPValue::LongLongInt(n)) => (*n).try_into().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_queue_name() {
        assert_eq!(retry_queue_name("tasks.high", 30), "tasks.high.retry.30s");
    }

    #[test]
    fn test_retry_count_from_headers_missing() {
        assert_eq!(retry_count_from_headers(&None), 0);
    }

    #[test]
    fn test_retry_count_from_headers_present() {
        let mut table = FieldTable::default();
        table.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongUInt(3));
        assert_eq!(retry_count_from_headers(&Some(table)), 3);
    }

    #[test]
    fn test_retry_lane_index_clamps_past_configured_delays() {
        let delays = vec![1u64, 5, 30, 120];
        let idx = |retry_count: u32| (retry_count.saturating_sub(1) as usize).min(delays.len() - 1);

        assert_eq!(idx(1), 0);
        assert_eq!(idx(4), 3);
        // Past the last configured lane, clamp to the longest delay rather
        // than panicking on an out-of-bounds index.
        assert_eq!(idx(9), 3);
    }
}
