//! Reload protocol: a fresh process picks up a submitted job by ID, claims it
//! and runs the execution pipeline.

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::claim::claim;
use super::pipeline::{self, ExecutionReport};
use super::transition::JobContext;
use crate::core::errors::{JobError, Result};
use crate::index::IndexRecord;
use crate::jobs::job::Job;
use crate::jobs::model::JobId;
use crate::jobs::status::JobStatus;
use crate::JobSystem;

/// Entry point of the wrapper command. The working directory must match the
/// one indexed for `job_id`, which guards against a stale or mistyped ID.
pub async fn run_job(system: Arc<JobSystem>, working_directory: &Path, job_id: JobId) -> Result<ExecutionReport> {
    let row = indexed(&system, job_id).await?;
    if !same_directory(&row.working_directory, working_directory) {
        return Err(JobError::conflict(format!(
            "job {} works in {}, not {}",
            job_id,
            row.working_directory.display(),
            working_directory.display()
        )));
    }
    run_row(system, row).await
}

/// Reload and run a job known only by its ID
pub async fn run_job_by_id(system: Arc<JobSystem>, job_id: JobId) -> Result<ExecutionReport> {
    let row = indexed(&system, job_id).await?;
    run_row(system, row).await
}

async fn indexed(system: &JobSystem, job_id: JobId) -> Result<IndexRecord> {
    system
        .index()
        .get(job_id)
        .await?
        .ok_or_else(|| JobError::not_found(format!("job {} in index", job_id)))
}

async fn run_row(system: Arc<JobSystem>, row: IndexRecord) -> Result<ExecutionReport> {
    let mut job = Job::from_storage(Arc::clone(&system), &row.storage_path).await?;
    if job.job_id()? != row.id {
        return Err(JobError::conflict(format!(
            "record {} belongs to job {}, not {}",
            row.storage_path.display(),
            job.job_id()?,
            row.id
        )));
    }

    let ctx = JobContext::open(system, row.id, job.name(), job.storage_path()).await?;
    let won = claim(&ctx).await?;
    debug!(job_id = row.id, token = %won.token, "Claim confirmed");
    job.set_status(JobStatus::Busy);

    info!(job_id = row.id, job_name = %job.name(), from = %won.from, "Resuming job");
    pipeline::execute(&job, &ctx, JobStatus::Busy).await
}

fn same_directory(indexed: &Path, given: &Path) -> bool {
    if indexed == given {
        return true;
    }
    match (std::fs::canonicalize(indexed), std::fs::canonicalize(given)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_same_directory_resolves_relative_segments() {
        let dir = TempDir::new().unwrap();
        let wd = dir.path().join("toy_files");
        std::fs::create_dir_all(&wd).unwrap();

        assert!(same_directory(&wd, &wd));
        assert!(same_directory(&wd, &dir.path().join("toy_files/../toy_files")));
        assert!(!same_directory(&wd, dir.path()));
        assert!(!same_directory(&wd, &dir.path().join("missing")));
    }
}
