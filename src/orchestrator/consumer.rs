use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::EventSource;
use crate::orchestrator::events::Delivery;
use crate::orchestrator::handler::{Orchestrator, Outcome};
use crate::utils::metrics::{EventDisposition, MetricsCollector};

/// Pause after a failed receive before polling again
const RECEIVE_BACKOFF: Duration = Duration::from_millis(500);

/// Pulls deliveries off the broker and feeds them to the orchestrator.
///
/// Up to `max_in_flight` deliveries are handled at once; ordering within a job is left to the
/// orchestrator's per-job lock. A delivery is acknowledged only after its handling finished.
#[derive(Clone)]
pub struct EventConsumer {
    source: Arc<dyn EventSource>,
    orchestrator: Arc<Orchestrator>,
    metrics: MetricsCollector,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    max_redeliveries: u32,
    cancel: CancellationToken,
}

impl EventConsumer {
    pub fn new(
        source: Arc<dyn EventSource>,
        orchestrator: Arc<Orchestrator>,
        max_in_flight: usize,
        max_redeliveries: u32,
    ) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            source,
            metrics: orchestrator.metrics().clone(),
            orchestrator,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            max_redeliveries,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that ends `run` when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Consume until cancelled, then wait for deliveries still being handled
    pub async fn run(&self) -> Result<()> {
        info!(max_in_flight = self.max_in_flight, "Consuming lifecycle events");

        loop {
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => {
                    permit.context("Consumer permits closed")?
                }
            };

            let delivery = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.source.receive() => match received {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("Receive failed: {:#}", e);
                        tokio::time::sleep(RECEIVE_BACKOFF).await;
                        continue;
                    }
                },
            };

            let consumer = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                consumer.process(delivery).await;
            });
        }

        debug!("Waiting for in-flight deliveries");
        let _drained = self
            .permits
            .acquire_many(self.max_in_flight as u32)
            .await
            .context("Consumer permits closed")?;

        info!("Consumer stopped");
        Ok(())
    }

    /// Handle one delivery and settle it with the broker
    pub async fn process(&self, delivery: Delivery) -> EventDisposition {
        let message = match delivery.parse() {
            Ok(message) => message,
            Err(e) => {
                self.metrics.record_received(None).await;
                warn!(message_id = %delivery.message_id, "Dropping malformed message: {}", e);
                self.settle(&delivery, EventDisposition::Malformed).await;
                return EventDisposition::Malformed;
            }
        };

        self.metrics.record_received(Some(message.command.as_str())).await;
        let job_id = message.job_id.clone();

        // Run the handler on its own task so a panic only costs this delivery
        let orchestrator = self.orchestrator.clone();
        let handled = tokio::spawn(async move { orchestrator.handle(message).await }).await;

        let disposition = match handled {
            Ok(Ok(Outcome::Applied(_))) => EventDisposition::Applied,
            Ok(Ok(Outcome::NoOp(_))) => EventDisposition::NoOp,
            Ok(Ok(Outcome::Discarded(_))) => EventDisposition::Discarded,
            Ok(Err(e)) if e.is_transient() && delivery.redelivery_count < self.max_redeliveries => {
                warn!(
                    job_id = %job_id,
                    redelivery = delivery.redelivery_count + 1,
                    "Requeueing after transient failure: {}",
                    e
                );
                EventDisposition::Requeued
            }
            Ok(Err(e)) if e.is_transient() => {
                error!(
                    job_id = %job_id,
                    message_id = %delivery.message_id,
                    alert = true,
                    "Dropping message after {} redeliveries: {}",
                    delivery.redelivery_count,
                    e
                );
                self.metrics.record_alert().await;
                EventDisposition::DeadLettered
            }
            Ok(Err(_)) => EventDisposition::Rejected,
            Err(e) => {
                error!(job_id = %job_id, alert = true, "Event handler panicked: {}", e);
                self.metrics.record_alert().await;
                EventDisposition::Rejected
            }
        };

        self.settle(&delivery, disposition).await;
        disposition
    }

    async fn settle(&self, delivery: &Delivery, disposition: EventDisposition) {
        let settled = match disposition {
            EventDisposition::Requeued => self.source.nack(delivery, true).await,
            EventDisposition::Malformed => self.source.nack(delivery, false).await,
            _ => self.source.ack(delivery).await,
        };

        if let Err(e) = settled {
            warn!(message_id = %delivery.message_id, "Could not settle delivery: {:#}", e);
        }
        self.metrics.record_disposition(disposition).await;
    }
}
