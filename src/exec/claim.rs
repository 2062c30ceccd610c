use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::transition::JobContext;
use crate::core::errors::{JobError, Result};
use crate::jobs::job::layout;
use crate::jobs::status::JobStatus;

/// A won claim on a job
#[derive(Debug, Clone)]
pub struct Claim {
    /// Status the job had when it was claimed
    pub from: JobStatus,
    pub token: String,
}

/// Claim a resumable job for this process by moving it to `busy`.
///
/// The index CAS decides between concurrent claimants; the winner is
/// confirmed by re-reading its token and only then written to storage. A CAS
/// that loses because the row moved on is retried a bounded number of times,
/// everything else fails with a conflict and nothing is executed. Every run
/// mode goes through here, so a `running` job is never claimed again.
pub async fn claim(ctx: &JobContext) -> Result<Claim> {
    let config = &ctx.system.config().execution;
    let index = ctx.system.index();
    let token = Uuid::new_v4().to_string();

    let stored = ctx.stored_status()?;
    if stored.is_terminal() {
        index.force_status(ctx.job_id, stored).await?;
        return Err(JobError::conflict(format!(
            "job {} is already {}",
            ctx.job_name, stored
        )));
    }

    for attempt in 1..=config.claim_attempts {
        let row = index
            .get(ctx.job_id)
            .await?
            .ok_or_else(|| JobError::not_found(format!("job {} in index", ctx.job_id)))?;

        // Running belongs to the claiming process; restart the job if that
        // process died
        if row.status == JobStatus::Running {
            return Err(JobError::conflict(format!(
                "job {} is running in another process",
                ctx.job_name
            )));
        }

        if !row.status.is_resumable() {
            return Err(JobError::conflict(format!(
                "job {} is {} and cannot be claimed",
                ctx.job_name, row.status
            )));
        }

        if index.claim(ctx.job_id, row.status, &token).await? {
            let confirmed = index
                .get(ctx.job_id)
                .await?
                .map(|r| r.status == JobStatus::Busy && r.claim_token.as_deref() == Some(token.as_str()))
                .unwrap_or(false);
            if !confirmed {
                return Err(JobError::conflict(format!(
                    "job {} was claimed by another process",
                    ctx.job_name
                )));
            }

            ctx.record.write_as(layout::STATUS, &JobStatus::Busy)?;
            ctx.record.sync().await?;
            info!(job_id = ctx.job_id, job_name = %ctx.job_name, from = %row.status, "Claimed job");
            return Ok(Claim {
                from: row.status,
                token,
            });
        }

        debug!(job_id = ctx.job_id, attempt, "Claim lost a race, re-checking");
        if attempt < config.claim_attempts {
            tokio::time::sleep(jittered(config.claim_retry_delay)).await;
        }
    }

    warn!(job_id = ctx.job_id, job_name = %ctx.job_name, "Giving up on claiming job");
    Err(JobError::conflict(format!(
        "could not claim job {} after {} attempts",
        ctx.job_name, config.claim_attempts
    )))
}

fn jittered(delay: Duration) -> Duration {
    let jitter = (fastrand::u32(..) as f64 / u32::MAX as f64) * 0.2 - 0.1; // ±10% jitter
    delay.mul_f64(1.0 + jitter)
}
