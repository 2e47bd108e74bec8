use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crawler::backend::{CrawlParams, CrawlerStats};
use crate::error::{CrawlerError, JobError};

/// Lifecycle status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Paused,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Stopping => "stopping",
            JobStatus::Stopped => "stopped",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Stopped | JobStatus::Completed | JobStatus::Failed)
    }

    /// A crawler instance exists for the job in this status
    pub fn holds_instance(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Paused | JobStatus::Stopping)
    }

    /// Edges of the job state machine
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, next),
            (Pending, Queued | Running | Failed | Stopped)
                | (Queued, Running | Failed | Stopped)
                | (Running, Paused | Stopping | Completed | Failed)
                | (Paused, Running | Stopping | Failed)
                | (Stopping, Stopped | Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CrawlerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "stopping" => Ok(JobStatus::Stopping),
            "stopped" => Ok(JobStatus::Stopped),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(CrawlerError::Config(format!("unknown job status '{}'", other))),
        }
    }
}

/// What to crawl and with which backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    pub domain: String,
    pub depth: u32,
    pub kind: String,
    /// Backend-specific settings, checked against the kind's schema
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl JobParameters {
    pub fn crawl_params(&self) -> CrawlParams {
        CrawlParams::new(self.domain.clone(), self.depth)
    }
}

/// Job record as persisted in the job store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: String,
    pub status: JobStatus,
    pub parameters: JobParameters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Only set once completed
    #[serde(default)]
    pub result: Option<Value>,

    /// Only set once failed
    #[serde(default)]
    pub error: Option<JobError>,

    #[serde(default)]
    pub stats: CrawlerStats,
}

impl Job {
    pub fn new(id: impl Into<String>, parameters: JobParameters) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind: parameters.kind.clone(),
            status: JobStatus::Pending,
            parameters,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
            stats: CrawlerStats::default(),
        }
    }

    /// Move along a state machine edge, keeping `updated_at` non-decreasing
    pub fn transition(&mut self, next: JobStatus) -> Result<(), CrawlerError> {
        if !self.status.can_transition_to(next) {
            return Err(CrawlerError::invalid_state(
                transition_verb(next),
                self.status,
            ));
        }

        self.status = next;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = self.updated_at.max(Utc::now());
    }

    pub fn fail(&mut self, error: &CrawlerError) -> Result<(), CrawlerError> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(JobError::from(error));
        self.result = None;
        Ok(())
    }
}

fn transition_verb(next: JobStatus) -> &'static str {
    match next {
        JobStatus::Pending => "reset",
        JobStatus::Queued => "queue",
        JobStatus::Running => "run",
        JobStatus::Paused => "pause",
        JobStatus::Stopping | JobStatus::Stopped => "stop",
        JobStatus::Completed => "complete",
        JobStatus::Failed => "fail",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            "j1",
            JobParameters {
                domain: "example.com".into(),
                depth: 1,
                kind: "fast-fetch".into(),
                extra: Map::new(),
            },
        )
    }

    #[test]
    fn test_state_machine_edges() {
        use JobStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Paused.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(!Running.can_transition_to(Stopped));
        assert!(!Paused.can_transition_to(Paused));
        for terminal in [Stopped, Completed, Failed] {
            for next in [Pending, Queued, Running, Paused, Stopping, Stopped, Completed, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_transition_keeps_timestamps_monotonic() {
        let mut job = job();
        let created = job.updated_at;

        job.transition(JobStatus::Running).unwrap();
        assert!(job.updated_at >= created);

        let err = job.transition(JobStatus::Queued).unwrap_err();
        assert_eq!(err, CrawlerError::invalid_state("queue", "running"));
        assert_eq!(job.status, JobStatus::Running);
    }

    #[test]
    fn test_fail_records_error() {
        let mut job = job();
        job.fail(&CrawlerError::UnknownKind("nope".into())).unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_ref().map(|e| e.kind.as_str()), Some("unknown_kind"));
        assert!(job.result.is_none());
    }

    #[test]
    fn test_status_round_trips_through_strings() {
        assert_eq!("paused".parse::<JobStatus>().unwrap(), JobStatus::Paused);
        assert!("sleeping".parse::<JobStatus>().is_err());
        assert_eq!(serde_json::to_value(JobStatus::Stopping).unwrap(), "stopping");
    }
}
