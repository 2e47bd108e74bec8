use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use crate::broker::{delivery_from_raw, redelivered_body, CommandSink, EventPublisher, EventSource};
use crate::orchestrator::events::{Delivery, EventMessage, StatusEvent};

/// In-process broker with the same delivery semantics as the Redis one
pub struct MemoryBroker {
    queue: Mutex<VecDeque<String>>,
    in_flight: Mutex<Vec<Delivery>>,
    published: Mutex<Vec<StatusEvent>>,
    ready: Notify,
    poll_timeout: Duration,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl MemoryBroker {
    pub fn new(poll_timeout: Duration) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            ready: Notify::new(),
            poll_timeout,
        }
    }

    /// Enqueue a raw body, bypassing serialization
    pub async fn push_raw(&self, raw: impl Into<String>) {
        self.queue.lock().await.push_back(raw.into());
        self.ready.notify_one();
    }

    /// Status events published so far
    pub async fn published(&self) -> Vec<StatusEvent> {
        self.published.lock().await.clone()
    }

    pub async fn pending_count(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    async fn take_in_flight(&self, delivery: &Delivery) {
        let mut in_flight = self.in_flight.lock().await;
        if let Some(position) = in_flight
            .iter()
            .position(|d| d.message_id == delivery.message_id)
        {
            in_flight.remove(position);
        }
    }
}

#[async_trait]
impl EventSource for MemoryBroker {
    async fn receive(&self) -> Result<Option<Delivery>> {
        loop {
            let notified = self.ready.notified();

            if let Some(raw) = self.queue.lock().await.pop_front() {
                let delivery = delivery_from_raw(raw);
                self.in_flight.lock().await.push(delivery.clone());
                return Ok(Some(delivery));
            }

            if tokio::time::timeout(self.poll_timeout, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.take_in_flight(delivery).await;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.take_in_flight(delivery).await;
        if requeue {
            self.push_raw(redelivered_body(delivery)).await;
        }
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for MemoryBroker {
    async fn publish(&self, event: &StatusEvent) -> Result<()> {
        self.published.lock().await.push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl CommandSink for MemoryBroker {
    async fn submit(&self, message: &EventMessage) -> Result<()> {
        let body = serde_json::to_string(message).context("Failed to serialize command")?;
        self.push_raw(body).await;
        Ok(())
    }
}
