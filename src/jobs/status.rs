use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core::errors::{JobError, Result};

/// Job status, persisted in both the job record and the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Initialized,
    Created,
    Submitted,
    Running,
    Collect,
    Finished,
    Aborted,
    NotConverged,
    Suspended,
    Refresh,
    Busy,
}

impl JobStatus {
    pub const ALL: [JobStatus; 11] = [
        JobStatus::Initialized,
        JobStatus::Created,
        JobStatus::Submitted,
        JobStatus::Running,
        JobStatus::Collect,
        JobStatus::Finished,
        JobStatus::Aborted,
        JobStatus::NotConverged,
        JobStatus::Suspended,
        JobStatus::Refresh,
        JobStatus::Busy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Initialized => "initialized",
            JobStatus::Created => "created",
            JobStatus::Submitted => "submitted",
            JobStatus::Running => "running",
            JobStatus::Collect => "collect",
            JobStatus::Finished => "finished",
            JobStatus::Aborted => "aborted",
            JobStatus::NotConverged => "not_converged",
            JobStatus::Suspended => "suspended",
            JobStatus::Refresh => "refresh",
            JobStatus::Busy => "busy",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Aborted | JobStatus::NotConverged
        )
    }

    /// Terminal and successful from a master's point of view
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::NotConverged)
    }

    /// Statuses in which the job owns its working directory and must not be
    /// submitted again.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Submitted
                | JobStatus::Running
                | JobStatus::Busy
                | JobStatus::Collect
                | JobStatus::Refresh
        )
    }

    /// Statuses from which a process may claim the job. A `running` job
    /// always belongs to the process that claimed it.
    pub fn is_resumable(&self) -> bool {
        matches!(self, JobStatus::Submitted | JobStatus::Refresh)
    }

    pub fn successors(&self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Initialized => &[Created, Aborted],
            Created => &[Submitted, Suspended, Aborted],
            Submitted => &[Busy, Running, Suspended, Aborted],
            Running => &[Busy, Collect, Suspended, Aborted],
            Busy => &[Running, Aborted],
            Collect => &[Finished, NotConverged, Aborted],
            Suspended => &[Refresh, Aborted],
            Refresh => &[Busy, Submitted, Aborted],
            Finished | Aborted | NotConverged => &[],
        }
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        self.successors().contains(&next)
    }

    /// Validate a transition, naming the job in the error
    pub fn check_transition(&self, next: JobStatus, job: &str) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(JobError::InvalidTransition {
                job: job.to_string(),
                from: *self,
                to: next,
            })
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| JobError::internal(format!("Unknown job status: {}", s)))
    }
}
