use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised by the crawler core
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CrawlerError {
    /// Bad or missing parameters, rejected before any execution
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No constructor is registered for the requested kind
    #[error("unknown crawler kind '{0}'")]
    UnknownKind(String),

    /// A constructor is already bound to this kind
    #[error("crawler kind '{0}' is already registered")]
    DuplicateKind(String),

    /// Lifecycle operation not valid from the current state
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("crawler '{0}' not found")]
    NotFound(String),

    #[error("crawler '{0}' is already managed")]
    AlreadyExists(String),

    /// Failure inside a backend's crawl logic
    #[error("execution failed: {0}")]
    Execution(String),

    /// Transient broker or job store I/O failure
    #[error("delivery failed: {0}")]
    Delivery(String),
}

impl CrawlerError {
    pub fn invalid_state(operation: &'static str, state: impl ToString) -> Self {
        Self::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    /// Wrap an I/O failure from the store or broker
    pub fn delivery(err: impl std::fmt::Display) -> Self {
        Self::Delivery(format!("{:#}", err))
    }

    /// Only delivery failures are worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Delivery(_))
    }

    /// Short machine-readable category recorded on failed jobs
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::UnknownKind(_) => "unknown_kind",
            Self::DuplicateKind(_) => "duplicate_kind",
            Self::InvalidState { .. } => "invalid_state",
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::Execution(_) => "execution",
            Self::Delivery(_) => "delivery",
        }
    }
}

/// Structured failure detail stored on a failed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Error category (see `CrawlerError::code`)
    pub kind: String,

    /// Human readable message
    pub message: String,

    /// When the failure was recorded
    pub occurred_at: DateTime<Utc>,
}

impl From<&CrawlerError> for JobError {
    fn from(err: &CrawlerError) -> Self {
        Self {
            kind: err.code().to_string(),
            message: err.to_string(),
            occurred_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_delivery_errors_are_transient() {
        assert!(CrawlerError::Delivery("redis down".into()).is_transient());
        assert!(!CrawlerError::Config("depth".into()).is_transient());
        assert!(!CrawlerError::invalid_state("pause", "stopped").is_transient());
    }

    #[test]
    fn job_error_keeps_category_and_message() {
        let err = CrawlerError::UnknownKind("unknown-kind".into());
        let record = JobError::from(&err);

        assert_eq!(record.kind, "unknown_kind");
        assert_eq!(record.message, "unknown crawler kind 'unknown-kind'");
    }
}
