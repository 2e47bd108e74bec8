use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use url::Url;

use crate::crawler::config::CrawlerConfig;
use crate::error::CrawlerError;

/// Execution state of a crawler instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    Idle,
    Running,
    Paused,
    Stopping,
    Stopped,
    /// The crawl ran out of work on its own
    Completed,
    Error,
}

impl RuntimeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeState::Idle => "idle",
            RuntimeState::Running => "running",
            RuntimeState::Paused => "paused",
            RuntimeState::Stopping => "stopping",
            RuntimeState::Stopped => "stopped",
            RuntimeState::Completed => "completed",
            RuntimeState::Error => "error",
        }
    }

    /// The execution context has exited and will not change state again
    pub fn is_terminal(&self) -> bool {
        matches!(self, RuntimeState::Stopped | RuntimeState::Completed | RuntimeState::Error)
    }

    /// Work is scheduled or in progress
    pub fn is_active(&self) -> bool {
        matches!(self, RuntimeState::Running | RuntimeState::Paused | RuntimeState::Stopping)
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters maintained by a running crawl
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrawlerStats {
    pub pages_visited: u64,
    pub items_produced: u64,
    pub errors_count: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub name: String,
    pub kind: String,
    pub runtime_state: RuntimeState,
    pub stats: CrawlerStats,
    pub last_error: Option<String>,
    /// Success payload, present once the crawl completed
    pub result: Option<Value>,
}

impl StatusSnapshot {
    pub fn idle(name: &str, kind: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            runtime_state: RuntimeState::Idle,
            stats: CrawlerStats::default(),
            last_error: None,
            result: None,
        }
    }
}

/// Inputs for one crawl
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlParams {
    /// Bare domain (`example.com`) or absolute seed URL
    pub domain: String,

    /// Maximum link distance from the seed
    pub depth: u32,
}

impl CrawlParams {
    pub fn new(domain: impl Into<String>, depth: u32) -> Self {
        Self {
            domain: domain.into(),
            depth,
        }
    }

    /// Seed URL derived from the domain, defaulting to https
    pub fn seed_url(&self) -> Result<Url, CrawlerError> {
        let domain = self.domain.trim();
        let raw = if domain.contains("://") {
            domain.to_string()
        } else {
            format!("https://{}/", domain.trim_end_matches('/'))
        };

        let url = Url::parse(&raw)
            .map_err(|e| CrawlerError::Config(format!("invalid domain '{}': {}", self.domain, e)))?;

        if url.host_str().map_or(true, str::is_empty) {
            return Err(CrawlerError::Config(format!("domain '{}' has no host", self.domain)));
        }

        Ok(url)
    }
}

/// Lifecycle contract every crawler backend satisfies.
///
/// Implementations run their crawl on a separate task so `stop`/`pause` stay responsive, and
/// publish every state change through the `watch` channel returned by `subscribe`.
#[async_trait]
pub trait Crawler: Send + Sync {
    /// Unique instance name
    fn name(&self) -> &str;

    /// Registry kind this instance was built from
    fn kind(&self) -> &str;

    fn supports_pause(&self) -> bool {
        true
    }

    /// Pure check of a configuration against this backend
    fn validate_config(&self, config: &CrawlerConfig) -> Result<(), CrawlerError>;

    /// Replace the configuration; rejected while a crawl is in progress
    async fn configure(&self, config: CrawlerConfig) -> Result<(), CrawlerError>;

    /// Begin crawling; a no-op when already running
    async fn start(&self, params: CrawlParams) -> Result<(), CrawlerError>;

    /// Request cooperative cancellation; a no-op once stopped
    async fn stop(&self) -> Result<(), CrawlerError>;

    async fn pause(&self) -> Result<(), CrawlerError>;

    async fn resume(&self) -> Result<(), CrawlerError>;

    /// Latest snapshot, never waits on the crawl itself
    async fn get_status(&self) -> StatusSnapshot;

    /// Receiver that observes every published snapshot
    fn subscribe(&self) -> watch::Receiver<StatusSnapshot>;
}
