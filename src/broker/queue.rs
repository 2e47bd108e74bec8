use anyhow::{Result, Context};
use async_trait::async_trait;
use redis::{Client, aio::MultiplexedConnection};
use tracing::{debug, info, warn};
use tokio::sync::Mutex;

use crate::broker::{delivery_from_raw, redelivered_body, CommandSink, EventPublisher, EventSource};
use crate::cli::config::BrokerSettings;
use crate::orchestrator::events::{Delivery, EventMessage, StatusEvent};

/// Redis-backed broker.
///
/// Commands are JSON strings in a list. Receiving moves a message atomically into a
/// processing list where it stays until acknowledged, so a crashed worker's messages can be
/// recovered. Status events are pushed to a separate list with a TTL.
pub struct RedisBroker {
    /// Connection used for blocking receives
    receiver: Mutex<MultiplexedConnection>,

    /// Connection for everything else
    conn: Mutex<MultiplexedConnection>,

    command_queue: String,
    processing_queue: String,
    status_queue: String,

    /// Blocking receive timeout in seconds
    poll_timeout: u64,

    /// Status event TTL in seconds
    status_ttl: u64,
}

impl RedisBroker {
    /// Connect to Redis
    pub async fn new(settings: &BrokerSettings) -> Result<Self> {
        let client = Client::open(settings.redis_url.clone())
            .context(format!("Failed to connect to Redis at {}", settings.redis_url))?;

        let receiver = client.get_multiplexed_async_connection().await
            .context("Failed to get Redis connection")?;
        let conn = client.get_multiplexed_async_connection().await
            .context("Failed to get Redis connection")?;

        Ok(Self {
            receiver: Mutex::new(receiver),
            conn: Mutex::new(conn),
            command_queue: settings.command_queue.clone(),
            processing_queue: format!("{}:processing", settings.command_queue),
            status_queue: settings.status_queue.clone(),
            poll_timeout: settings.poll_timeout.max(1),
            status_ttl: settings.status_ttl,
        })
    }

    /// Requeue messages left in the processing list by a worker that died, returning how many
    pub async fn recover_in_flight(&self) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let mut recovered = 0;

        loop {
            let moved: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(&self.processing_queue)
                .arg(&self.command_queue)
                .query_async(&mut *conn)
                .await
                .context("Failed to recover in-flight messages")?;

            match moved {
                Some(_) => recovered += 1,
                None => break,
            }
        }

        if recovered > 0 {
            info!("Recovered {} in-flight messages", recovered);
        }

        Ok(recovered)
    }

    async fn remove_in_flight(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.conn.lock().await;

        let removed: i64 = redis::cmd("LREM")
            .arg(&self.processing_queue)
            .arg(1)
            .arg(&delivery.raw)
            .query_async(&mut *conn)
            .await
            .context("Failed to remove message from processing list")?;

        if removed == 0 {
            warn!(message_id = %delivery.message_id, "Message was not in the processing list");
        }

        Ok(())
    }
}

#[async_trait]
impl EventSource for RedisBroker {
    async fn receive(&self) -> Result<Option<Delivery>> {
        let mut conn = self.receiver.lock().await;

        let raw: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.command_queue)
            .arg(&self.processing_queue)
            .arg(self.poll_timeout)
            .query_async(&mut *conn)
            .await
            .context("Failed to receive message from Redis")?;

        Ok(raw.map(|raw| {
            let delivery = delivery_from_raw(raw);
            debug!(message_id = %delivery.message_id, "Received message");
            delivery
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.remove_in_flight(delivery).await?;
        debug!(message_id = %delivery.message_id, "Acknowledged message");
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.remove_in_flight(delivery).await?;

        if requeue {
            let mut conn = self.conn.lock().await;
            redis::cmd("LPUSH")
                .arg(&self.command_queue)
                .arg(redelivered_body(delivery))
                .query_async::<_, ()>(&mut *conn)
                .await
                .context("Failed to requeue message")?;
            debug!(message_id = %delivery.message_id, "Requeued message");
        }

        Ok(())
    }
}

#[async_trait]
impl EventPublisher for RedisBroker {
    async fn publish(&self, event: &StatusEvent) -> Result<()> {
        let body = serde_json::to_string(event)
            .context("Failed to serialize status event")?;

        let mut conn = self.conn.lock().await;

        redis::cmd("LPUSH")
            .arg(&self.status_queue)
            .arg(&body)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to publish status event")?;

        redis::cmd("EXPIRE")
            .arg(&self.status_queue)
            .arg(self.status_ttl)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to set TTL on status queue")?;

        debug!(routing_key = %event.routing_key, job_id = %event.job_id, "Published status event");

        Ok(())
    }
}

#[async_trait]
impl CommandSink for RedisBroker {
    async fn submit(&self, message: &EventMessage) -> Result<()> {
        let body = serde_json::to_string(message)
            .context("Failed to serialize command")?;

        let mut conn = self.conn.lock().await;

        redis::cmd("LPUSH")
            .arg(&self.command_queue)
            .arg(&body)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to submit command")?;

        debug!(job_id = %message.job_id, "Submitted {}", message.command.as_str());

        Ok(())
    }
}
