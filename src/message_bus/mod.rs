//! Event Bus Abstraction
//!
//! Supports multiple backends:
//! - Redis Streams (development / single-box deployments)
//! - NATS JetStream (production)
//!
//! Every topic named in the spec's external interfaces maps to one
//! underlying stream per bus type; routing within a stream is by the
//! `PipelineEvent` variant's own topic.

mod redis_streams;
mod nats_adapter;

pub use redis_streams::RedisStreamsBus;
pub use nats_adapter::NatsBus;

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use crate::events::PipelineEvent;
use crate::metrics;

/// Message envelope with delivery metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Message<T> {
    pub id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub correlation_id: String,
    pub topic: String,
    pub payload: T,
    pub retry_count: u32,
}

/// Result of a publish operation.
#[derive(Debug)]
pub struct PublishResult {
    pub message_id: String,
    pub stream_id: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

/// Configuration for a message bus connection.
#[derive(Debug, Clone)]
pub struct MessageBusConfig {
    pub stream_name: String,
    pub max_len: Option<u64>,
    pub ack_timeout: Duration,
    pub max_retries: u32,
    pub batch_size: usize,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            stream_name: "pipeline:events".to_string(),
            max_len: Some(100_000),
            ack_timeout: Duration::from_secs(30),
            max_retries: 3,
            batch_size: 100,
        }
    }
}

/// Event bus interface. A single stream per process carries every topic;
/// consumers filter by `PipelineEvent::topic()` after deserializing.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, event: &PipelineEvent) -> anyhow::Result<PublishResult>;

    async fn publish_batch(&self, events: &[PipelineEvent]) -> anyhow::Result<Vec<PublishResult>>;

    async fn subscribe(&self, consumer_group: &str, consumer_name: &str) -> anyhow::Result<Box<dyn MessageConsumer>>;

    async fn is_healthy(&self) -> bool;

    fn bus_type(&self) -> &'static str;

    async fn close(&self) -> anyhow::Result<()>;
}

/// Consumer interface for reading events off the bus.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    async fn read(&mut self, count: usize, timeout: Duration) -> anyhow::Result<Vec<Message<PipelineEvent>>>;

    async fn ack(&self, message_id: &str) -> anyhow::Result<()>;

    async fn nack(&self, message_id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MessageBusType {
    Redis,
    Nats,
}

impl std::str::FromStr for MessageBusType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "redis" | "redis_streams" => Ok(Self::Redis),
            "nats" | "nats_jetstream" => Ok(Self::Nats),
            _ => anyhow::bail!("Unknown message bus type: {}", s),
        }
    }
}

/// Creates a message bus based on configuration.
pub async fn create_message_bus(
    bus_type: MessageBusType,
    connection_url: &str,
    config: MessageBusConfig,
) -> anyhow::Result<Box<dyn MessageBus>> {
    match bus_type {
        MessageBusType::Redis => {
            let bus = RedisStreamsBus::connect(connection_url, config).await?;
            Ok(Box::new(bus))
        }
        MessageBusType::Nats => {
            let bus = NatsBus::connect(connection_url, config).await?;
            Ok(Box::new(bus))
        }
    }
}

/// Publisher with retry logic and metrics, wrapping any bus implementation.
/// Holds the bus behind an `Arc` (rather than a `Box`) so one connection
/// can be shared and cloned across every worker, the scheduler, and the
/// admin surface instead of each opening its own.
#[derive(Clone)]
pub struct ResilientPublisher {
    bus: std::sync::Arc<dyn MessageBus>,
    max_retries: u32,
    retry_delay: Duration,
}

impl ResilientPublisher {
    pub fn new(bus: std::sync::Arc<dyn MessageBus>, max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            bus,
            max_retries,
            retry_delay,
        }
    }

    pub async fn publish(&self, event: &PipelineEvent) -> anyhow::Result<PublishResult> {
        let mut last_error = None;
        let bus_type = self.bus.bus_type();

        for attempt in 0..=self.max_retries {
            let start = std::time::Instant::now();

            match self.bus.publish(event).await {
                Ok(result) if result.success => {
                    metrics::record_publish_latency(bus_type, start.elapsed().as_secs_f64());
                    metrics::record_publish_success(bus_type);
                    return Ok(result);
                }
                Ok(result) => {
                    last_error = result.error;
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                }
            }

            if attempt < self.max_retries {
                let delay = self.retry_delay * (attempt + 1);
                tokio::time::sleep(delay).await;
            }
        }

        metrics::record_publish_failure(bus_type);
        anyhow::bail!("Publish failed after {} retries: {:?}", self.max_retries, last_error)
    }

    pub async fn publish_batch(&self, events: &[PipelineEvent]) -> anyhow::Result<Vec<PublishResult>> {
        let bus_type = self.bus.bus_type();
        let start = std::time::Instant::now();

        match self.bus.publish_batch(events).await {
            Ok(results) => {
                let success_count = results.iter().filter(|r| r.success).count();
                metrics::record_publish_latency(bus_type, start.elapsed().as_secs_f64());

                for result in &results {
                    if result.success {
                        metrics::record_publish_success(bus_type);
                    } else {
                        metrics::record_publish_failure(bus_type);
                    }
                }

                if success_count == events.len() {
                    return Ok(results);
                }

                let mut final_results = results;
                for (i, result) in final_results.iter_mut().enumerate() {
                    if !result.success {
                        if let Ok(retry_result) = self.publish(&events[i]).await {
                            *result = retry_result;
                        }
                    }
                }

                Ok(final_results)
            }
            Err(_) => {
                let mut results = Vec::with_capacity(events.len());
                for event in events {
                    results.push(self.publish(event).await?);
                }
                Ok(results)
            }
        }
    }

    pub async fn is_healthy(&self) -> bool {
        self.bus.is_healthy().await
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.bus.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_bus_type_parsing() {
        assert_eq!("redis".parse::<MessageBusType>().unwrap(), MessageBusType::Redis);
        assert_eq!("nats".parse::<MessageBusType>().unwrap(), MessageBusType::Nats);
        assert!("unknown".parse::<MessageBusType>().is_err());
    }
}
