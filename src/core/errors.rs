use std::time::Duration;
use thiserror::Error;

use crate::jobs::model::{Failure, JobId};
use crate::jobs::status::JobStatus;

/// Unified error type for the jobrack library
#[derive(Debug, Error)]
pub enum JobError {
    /// Invalid run mode, resource request, missing input or bad config file.
    /// Fatal, never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Duplicate name, job type mismatch, or a lost optimistic claim
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unknown job type, missing index row or missing storage path
    #[error("Not found: {0}")]
    NotFound(String),

    /// The job ran and failed; the failure is already recorded as `aborted`
    #[error("Job {job_id} failed: {failure}")]
    Execution { job_id: JobId, failure: Failure },

    #[error("Invalid status transition for job {job}: {from} -> {to}")]
    InvalidTransition {
        job: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Timed out after {waited:?} waiting for {operation}")]
    Timeout { operation: String, waited: Duration },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Index error: {0}")]
    Index(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue adapter error: {0}")]
    Queue(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse classification used by callers deciding how to react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Conflict,
    NotFound,
    Execution,
    Infrastructure,
}

impl JobError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::Yaml(_) => ErrorKind::Configuration,
            Self::Conflict(_) | Self::InvalidTransition { .. } => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Execution { .. } | Self::Cancelled(_) => ErrorKind::Execution,
            Self::Timeout { .. }
            | Self::Storage(_)
            | Self::Index(_)
            | Self::Json(_)
            | Self::Io(_)
            | Self::Queue(_)
            | Self::Internal(_)
            | Self::Other(_) => ErrorKind::Infrastructure,
        }
    }

    /// Check if a caller could sensibly retry the failed operation
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict(_) | Self::Timeout { .. } => true,
            Self::Storage(_) | Self::Index(_) | Self::Io(_) | Self::Queue(_) => true,
            _ => false,
        }
    }

    /// The recorded failure, if this error is an execution failure
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Execution { failure, .. } => Some(failure),
            _ => None,
        }
    }
}

/// Result type alias for JobError
pub type Result<T> = std::result::Result<T, JobError>;
