pub mod memory;
pub mod queue;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::config::BrokerSettings;
use crate::orchestrator::events::{Delivery, EventMessage, StatusEvent};

// Re-export common types
pub use memory::MemoryBroker;
pub use queue::RedisBroker;

/// Inbound side of the broker
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Take the next message, or `None` when the poll timed out
    async fn receive(&self) -> Result<Option<Delivery>>;

    /// The message was handled and must not be delivered again
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Give the message back; with `requeue` it is delivered again later
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()>;
}

/// Outbound side of the broker
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &StatusEvent) -> Result<()>;
}

/// Entry point used by producers to enqueue lifecycle commands
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn submit(&self, message: &EventMessage) -> Result<()>;
}

/// A connected broker, selected by `broker_type`
#[derive(Clone)]
pub enum Broker {
    Redis(Arc<RedisBroker>),
    Memory(Arc<MemoryBroker>),
}

impl Broker {
    pub async fn connect(settings: &BrokerSettings) -> Result<Self> {
        match settings.broker_type.as_str() {
            "redis" => Ok(Broker::Redis(Arc::new(RedisBroker::new(settings).await?))),
            "memory" => Ok(Broker::Memory(Arc::new(MemoryBroker::new(
                Duration::from_secs(settings.poll_timeout.max(1)),
            )))),
            other => anyhow::bail!("Unsupported broker type: {}", other),
        }
    }

    pub fn source(&self) -> Arc<dyn EventSource> {
        match self {
            Broker::Redis(broker) => broker.clone(),
            Broker::Memory(broker) => broker.clone(),
        }
    }

    pub fn publisher(&self) -> Arc<dyn EventPublisher> {
        match self {
            Broker::Redis(broker) => broker.clone(),
            Broker::Memory(broker) => broker.clone(),
        }
    }

    pub fn sink(&self) -> Arc<dyn CommandSink> {
        match self {
            Broker::Redis(broker) => broker.clone(),
            Broker::Memory(broker) => broker.clone(),
        }
    }

    /// Requeue messages a previous worker left unacknowledged
    pub async fn recover_in_flight(&self) -> Result<usize> {
        match self {
            Broker::Redis(broker) => broker.recover_in_flight().await,
            Broker::Memory(_) => Ok(0),
        }
    }
}

/// Identify a raw body, falling back to a fresh id when it has none
pub(crate) fn delivery_from_raw(raw: String) -> Delivery {
    let parsed: Option<Value> = serde_json::from_str(&raw).ok();
    let field = |key: &str| parsed.as_ref().and_then(|value| value.get(key).cloned());

    Delivery {
        message_id: field("message_id")
            .and_then(|id| id.as_str().map(str::to_string))
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        redelivery_count: field("redelivery_count")
            .and_then(|count| count.as_u64())
            .unwrap_or(0) as u32,
        raw,
    }
}

/// Body to push back on the queue, with the redelivery counter bumped
pub(crate) fn redelivered_body(delivery: &Delivery) -> String {
    match serde_json::from_str::<Value>(&delivery.raw) {
        Ok(Value::Object(mut object)) => {
            object.insert("message_id".into(), Value::from(delivery.message_id.clone()));
            object.insert("redelivery_count".into(), Value::from(delivery.redelivery_count + 1));
            Value::Object(object).to_string()
        }
        _ => delivery.raw.clone(),
    }
}
