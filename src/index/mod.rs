//! Job index
//!
//! A denormalized table of every job, used for listing, filtering, ID
//! allocation and the compare-and-swap status updates that arbitrate between
//! processes acting on the same job. The job record in storage stays the
//! source of truth; on disagreement the index row is repaired.

pub mod sqlite;

pub use sqlite::SqliteIndex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::errors::Result;
use crate::jobs::model::JobId;
use crate::jobs::status::JobStatus;

/// One row of the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub id: JobId,
    pub project: PathBuf,
    pub job_name: String,
    pub job_type: String,
    pub status: JobStatus,
    pub working_directory: PathBuf,
    pub storage_path: PathBuf,
    pub master_id: Option<JobId>,
    pub queue_id: Option<String>,
    /// Short failure reason for aborted jobs
    pub reason: Option<String>,
    pub cancel_requested: bool,
    pub claim_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Row to insert; the index assigns the ID
#[derive(Debug, Clone)]
pub struct NewIndexRecord {
    pub project: PathBuf,
    pub job_name: String,
    pub job_type: String,
    pub status: JobStatus,
    pub working_directory: PathBuf,
    pub storage_path: PathBuf,
    pub master_id: Option<JobId>,
}

/// Partial update of the non-status columns. `None` leaves a column alone,
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct IndexUpdate {
    pub master_id: Option<Option<JobId>>,
    pub queue_id: Option<Option<String>>,
    pub reason: Option<Option<String>>,
}

impl IndexUpdate {
    pub fn master_id(mut self, master_id: Option<JobId>) -> Self {
        self.master_id = Some(master_id);
        self
    }

    pub fn queue_id(mut self, queue_id: Option<String>) -> Self {
        self.queue_id = Some(queue_id);
        self
    }

    pub fn reason(mut self, reason: Option<String>) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.master_id.is_none() && self.queue_id.is_none() && self.reason.is_none()
    }
}

/// Filters for listing jobs; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub project: Option<PathBuf>,
    /// Include jobs of sub-projects
    pub recursive: bool,
    pub statuses: Vec<JobStatus>,
    /// Glob on the job name (`*` and `?`)
    pub name_pattern: Option<String>,
    pub job_type: Option<String>,
    pub master_id: Option<JobId>,
    pub created_before: Option<DateTime<Utc>>,
    pub created_after: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl JobFilter {
    pub fn project(project: impl Into<PathBuf>) -> Self {
        Self {
            project: Some(project.into()),
            ..Default::default()
        }
    }

    pub fn children_of(master_id: JobId) -> Self {
        Self {
            master_id: Some(master_id),
            ..Default::default()
        }
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    /// Shell-style, case-sensitive pattern (`*`, `?`, `[...]`) on the job name
    pub fn name_like(mut self, pattern: impl Into<String>) -> Self {
        self.name_pattern = Some(pattern.into());
        self
    }

    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Narrow CRUD interface over the relational index
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Insert a row and return the newly allocated ID. A taken
    /// `(project, job_name)` pair is a conflict.
    async fn insert_job(&self, record: &NewIndexRecord) -> Result<JobId>;

    /// Re-insert a row with a known ID (index rebuild)
    async fn restore_job(&self, record: &IndexRecord) -> Result<()>;

    async fn get(&self, id: JobId) -> Result<Option<IndexRecord>>;

    async fn find_by_name(&self, project: &std::path::Path, job_name: &str) -> Result<Option<IndexRecord>>;

    /// Atomic compare-and-swap of the status. Returns `false` when the row is
    /// missing or its status is no longer `old`.
    async fn update_status(&self, id: JobId, old: JobStatus, new: JobStatus) -> Result<bool>;

    /// Unconditional status write, used when repairing from storage
    async fn force_status(&self, id: JobId, status: JobStatus) -> Result<()>;

    /// CAS `expected -> busy` that also records the claimant's token
    async fn claim(&self, id: JobId, expected: JobStatus, token: &str) -> Result<bool>;

    async fn update(&self, id: JobId, update: &IndexUpdate) -> Result<()>;

    async fn request_cancel(&self, id: JobId) -> Result<bool>;

    async fn query(&self, filter: &JobFilter) -> Result<Vec<IndexRecord>>;

    async fn delete(&self, id: JobId) -> Result<bool>;
}
