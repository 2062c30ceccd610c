use std::sync::Arc;
use tracing::{info, warn};

use crate::core::errors::{JobError, Result};
use crate::index::IndexUpdate;
use crate::jobs::job::layout;
use crate::jobs::model::{Failure, JobId};
use crate::jobs::status::JobStatus;
use crate::storage::RecordHandle;
use crate::JobSystem;

/// A saved job with its record open, driven through status transitions.
///
/// Every transition writes the record first and the index second, so the
/// index never runs ahead of what storage contains.
#[derive(Clone)]
pub struct JobContext {
    pub system: Arc<JobSystem>,
    pub record: RecordHandle,
    pub job_id: JobId,
    pub job_name: String,
}

impl JobContext {
    pub async fn open(system: Arc<JobSystem>, job_id: JobId, job_name: &str, storage_path: &std::path::Path) -> Result<Self> {
        let record = system.records().open(storage_path).await?;
        Ok(Self {
            system,
            record,
            job_id,
            job_name: job_name.to_string(),
        })
    }

    fn label(&self) -> String {
        format!("{} (id {})", self.job_name, self.job_id)
    }

    /// Status according to the record
    pub fn stored_status(&self) -> Result<JobStatus> {
        self.record.read_as(layout::STATUS)
    }

    /// Move `from -> to` in storage, then in the index
    pub async fn transition(&self, from: JobStatus, to: JobStatus) -> Result<()> {
        from.check_transition(to, &self.label())?;

        let stored = self.stored_status()?;
        if stored != from && stored != to {
            return Err(JobError::conflict(format!(
                "job {} is {} in storage, expected {}",
                self.label(),
                stored,
                from
            )));
        }
        if stored == from {
            self.record.write_as(layout::STATUS, &to)?;
            self.record.sync().await?;
        }

        self.sync_index(from, to).await?;
        info!(job_id = self.job_id, job_name = %self.job_name, status = %to, "Job status changed");
        Ok(())
    }

    /// Index CAS `from -> to`; a row already at `to` counts as success
    async fn sync_index(&self, from: JobStatus, to: JobStatus) -> Result<()> {
        let index = self.system.index();
        if index.update_status(self.job_id, from, to).await? {
            return Ok(());
        }
        let row = index
            .get(self.job_id)
            .await?
            .ok_or_else(|| JobError::not_found(format!("job {} in index", self.job_id)))?;
        if row.status == to {
            Ok(())
        } else {
            Err(JobError::conflict(format!(
                "index shows job {} as {} while moving {} -> {}",
                self.label(),
                row.status,
                from,
                to
            )))
        }
    }

    /// Record `failure` and move the job to `aborted`, whatever non-terminal
    /// status it is in. Returns the status the job ends in.
    pub async fn abort(&self, failure: &Failure) -> Result<JobStatus> {
        let stored = self.stored_status()?;
        if stored.is_terminal() {
            warn!(job_id = self.job_id, status = %stored, "Not aborting a job that already finished");
            return Ok(stored);
        }

        self.record.with_scoped("", |scope| {
            scope.write_as(layout::FAILURE, failure)?;
            scope.write_as(layout::STATUS, &JobStatus::Aborted)
        })?;
        self.record.sync().await?;

        let index = self.system.index();
        if !index
            .update_status(self.job_id, stored, JobStatus::Aborted)
            .await?
        {
            // Storage wins over a lagging index row
            index.force_status(self.job_id, JobStatus::Aborted).await?;
        }
        index
            .update(
                self.job_id,
                &IndexUpdate::default().reason(Some(failure.summary())),
            )
            .await?;

        warn!(job_id = self.job_id, job_name = %self.job_name, reason = %failure, "Job aborted");
        Ok(JobStatus::Aborted)
    }

    /// `true` when someone requested cancellation through the index
    pub async fn cancel_requested(&self) -> Result<bool> {
        Ok(self
            .system
            .index()
            .get(self.job_id)
            .await?
            .map(|row| row.cancel_requested)
            .unwrap_or(false))
    }
}
