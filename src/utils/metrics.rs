use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use tracing::info;

/// How the consumer disposed of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDisposition {
    /// The job changed status
    Applied,
    /// Valid but nothing to do (e.g. duplicate START)
    NoOp,
    /// Event for a job that already finished
    Discarded,
    /// Handled locally with a non-retryable error
    Rejected,
    /// Body could not be parsed
    Malformed,
    /// Put back on the queue after a transient failure
    Requeued,
    /// Dropped after too many redeliveries
    DeadLettered,
}

/// Orchestrator metrics collector
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    /// In-memory metrics store
    metrics: Arc<Mutex<Metrics>>,
}

/// Metrics data structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metrics {
    /// Start time of the metrics collection
    pub start_time: DateTime<Utc>,

    /// Deliveries taken off the broker
    pub events_received: usize,

    /// Deliveries per disposition
    pub dispositions: HashMap<EventDisposition, usize>,

    /// Events received per command type
    pub commands: HashMap<String, usize>,

    /// Extra attempts spent on store and broker writes
    pub persistence_retries: usize,

    /// Failures that exhausted their retries
    pub alerts: usize,

    /// Crawls that reached a terminal state, by job status
    pub finished_jobs: HashMap<String, usize>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        let metrics = Metrics {
            start_time: Utc::now(),
            ..Default::default()
        };

        Self {
            metrics: Arc::new(Mutex::new(metrics)),
        }
    }

    /// Record a delivery taken off the broker
    pub async fn record_received(&self, command: Option<&str>) {
        let mut metrics = self.metrics.lock().await;
        metrics.events_received += 1;
        if let Some(command) = command {
            *metrics.commands.entry(command.to_string()).or_default() += 1;
        }
    }

    pub async fn record_disposition(&self, disposition: EventDisposition) {
        let mut metrics = self.metrics.lock().await;
        *metrics.dispositions.entry(disposition).or_default() += 1;
    }

    pub async fn record_retries(&self, retries: usize) {
        if retries > 0 {
            self.metrics.lock().await.persistence_retries += retries;
        }
    }

    pub async fn record_alert(&self) {
        self.metrics.lock().await.alerts += 1;
    }

    pub async fn record_finished(&self, status: &str) {
        let mut metrics = self.metrics.lock().await;
        *metrics.finished_jobs.entry(status.to_string()).or_default() += 1;
    }

    /// Get all metrics
    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.lock().await.clone()
    }

    /// Log a one-line summary
    pub async fn log_summary(&self) {
        let metrics = self.get_metrics().await;
        let count = |d: EventDisposition| metrics.dispositions.get(&d).copied().unwrap_or(0);

        info!(
            uptime_secs = (Utc::now() - metrics.start_time).num_seconds(),
            received = metrics.events_received,
            applied = count(EventDisposition::Applied),
            no_op = count(EventDisposition::NoOp),
            discarded = count(EventDisposition::Discarded),
            rejected = count(EventDisposition::Rejected) + count(EventDisposition::Malformed),
            requeued = count(EventDisposition::Requeued),
            retries = metrics.persistence_retries,
            alerts = metrics.alerts,
            "Orchestrator metrics"
        );
    }

    /// Reset metrics
    pub async fn reset(&self) {
        let mut metrics = self.metrics.lock().await;
        *metrics = Metrics {
            start_time: Utc::now(),
            ..Default::default()
        };
    }
}
