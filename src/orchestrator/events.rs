use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crawler::backend::CrawlerStats;
use crate::error::{CrawlerError, JobError};
use crate::orchestrator::job::{Job, JobParameters, JobStatus};

/// Lifecycle command carried by a broker message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandType {
    #[serde(rename = "START_CRAWLER", alias = "START")]
    Start,
    #[serde(rename = "STOP_CRAWLER", alias = "STOP")]
    Stop,
    #[serde(rename = "PAUSE_CRAWLER", alias = "PAUSE")]
    Pause,
    #[serde(rename = "RESUME_CRAWLER", alias = "RESUME")]
    Resume,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Start => "START_CRAWLER",
            CommandType::Stop => "STOP_CRAWLER",
            CommandType::Pause => "PAUSE_CRAWLER",
            CommandType::Resume => "RESUME_CRAWLER",
        }
    }
}

/// Inbound broker message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(rename = "type")]
    pub command: CommandType,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub redelivery_count: u32,
}

impl EventMessage {
    pub fn new(command: CommandType, job_id: impl Into<String>) -> Self {
        Self {
            command,
            job_id: job_id.into(),
            payload: None,
            message_id: Some(uuid::Uuid::new_v4().to_string()),
            redelivery_count: 0,
        }
    }

    pub fn start(job_id: impl Into<String>, payload: &StartPayload) -> Self {
        let mut message = Self::new(CommandType::Start, job_id);
        message.payload = serde_json::to_value(payload).ok();
        message
    }

    /// Parse the START payload, rejecting unknown keys
    pub fn start_payload(&self) -> Result<StartPayload, CrawlerError> {
        let payload = self
            .payload
            .clone()
            .ok_or_else(|| CrawlerError::Config("START requires a payload".into()))?;

        serde_json::from_value(payload)
            .map_err(|e| CrawlerError::Config(format!("invalid START payload: {}", e)))
    }
}

fn default_depth() -> u32 {
    1
}

/// Body of a START message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartPayload {
    pub domain: String,
    #[serde(default = "default_depth")]
    pub depth: u32,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl From<StartPayload> for JobParameters {
    fn from(payload: StartPayload) -> Self {
        Self {
            domain: payload.domain,
            depth: payload.depth,
            kind: payload.kind,
            extra: payload.extra,
        }
    }
}

impl From<&JobParameters> for StartPayload {
    fn from(parameters: &JobParameters) -> Self {
        Self {
            domain: parameters.domain.clone(),
            depth: parameters.depth,
            kind: parameters.kind.clone(),
            extra: parameters.extra.clone(),
        }
    }
}

/// A message as handed out by a broker, not yet acknowledged
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message_id: String,
    pub redelivery_count: u32,
    /// Body exactly as received, used for ack/requeue
    pub raw: String,
}

impl Delivery {
    pub fn parse(&self) -> Result<EventMessage, serde_json::Error> {
        let mut message: EventMessage = serde_json::from_str(&self.raw)?;
        message.redelivery_count = message.redelivery_count.max(self.redelivery_count);
        if message.message_id.is_none() {
            message.message_id = Some(self.message_id.clone());
        }
        Ok(message)
    }
}

/// Outbound notification published after a job changes status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusEventType {
    CrawlerStarted,
    CrawlerPaused,
    CrawlerResumed,
    CrawlerStopping,
    CrawlerStopped,
    CrawlerCompleted,
    CrawlerFailed,
    /// Running stats of a live job; carries no status change
    CrawlerProgress,
}

impl StatusEventType {
    /// Event announcing that a job reached `status`
    pub fn for_transition(from: JobStatus, to: JobStatus) -> Option<Self> {
        match to {
            JobStatus::Running if from == JobStatus::Paused => Some(StatusEventType::CrawlerResumed),
            JobStatus::Running => Some(StatusEventType::CrawlerStarted),
            JobStatus::Paused => Some(StatusEventType::CrawlerPaused),
            JobStatus::Stopping => Some(StatusEventType::CrawlerStopping),
            JobStatus::Stopped => Some(StatusEventType::CrawlerStopped),
            JobStatus::Completed => Some(StatusEventType::CrawlerCompleted),
            JobStatus::Failed => Some(StatusEventType::CrawlerFailed),
            JobStatus::Pending | JobStatus::Queued => None,
        }
    }

    pub fn routing_suffix(&self) -> &'static str {
        match self {
            StatusEventType::CrawlerStarted => "started",
            StatusEventType::CrawlerPaused => "paused",
            StatusEventType::CrawlerResumed => "resumed",
            StatusEventType::CrawlerStopping => "stopping",
            StatusEventType::CrawlerStopped => "stopped",
            StatusEventType::CrawlerCompleted => "completed",
            StatusEventType::CrawlerFailed => "failed",
            StatusEventType::CrawlerProgress => "progress",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    #[serde(rename = "type")]
    pub event: StatusEventType,
    pub job_id: String,
    pub kind: String,
    pub status: JobStatus,
    pub stats: CrawlerStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub routing_key: String,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(event: StatusEventType, job: &Job) -> Self {
        Self {
            event,
            job_id: job.id.clone(),
            kind: job.kind.clone(),
            status: job.status,
            stats: job.stats.clone(),
            error: job.error.clone(),
            routing_key: format!("crawler.status.{}", event.routing_suffix()),
            timestamp: Utc::now(),
        }
    }

    /// Failure notice for a START that never produced a job record
    pub fn rejected(job_id: &str, kind: &str, error: &CrawlerError) -> Self {
        let event = StatusEventType::CrawlerFailed;
        Self {
            event,
            job_id: job_id.to_string(),
            kind: kind.to_string(),
            status: JobStatus::Failed,
            stats: CrawlerStats::default(),
            error: Some(JobError::from(error)),
            routing_key: format!("crawler.status.{}", event.routing_suffix()),
            timestamp: Utc::now(),
        }
    }
}
