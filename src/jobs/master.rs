//! Master jobs own a set of children and derive their status from them.
//!
//! Children point at their master through `master_id` in both their record
//! and their index row, so a master never holds live handles: every question
//! about its children is answered by an index query.

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::core::cancel::CancelToken;
use crate::core::errors::{JobError, Result};
use crate::exec::transition::JobContext;
use crate::index::{IndexRecord, IndexUpdate, JobFilter};
use crate::jobs::job::{layout, Job};
use crate::jobs::model::{Failure, FailureReason, JobId};
use crate::jobs::status::JobStatus;
use crate::JobSystem;

/// Input key of a master job holding its [`AggregatePolicy`]
pub const POLICY_KEY: &str = "aggregate_policy";

/// How aborted children affect the master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatePolicy {
    /// The first aborted child aborts the master
    FailFast,
    /// Wait for every child; aborted children end the master as `not_converged`
    #[default]
    CollectAll,
}

/// Status a master should have given its children's statuses
pub fn aggregate_status(policy: AggregatePolicy, children: &[JobStatus]) -> JobStatus {
    let any_aborted = children.contains(&JobStatus::Aborted);
    if policy == AggregatePolicy::FailFast && any_aborted {
        return JobStatus::Aborted;
    }
    if children.iter().any(|s| !s.is_terminal()) {
        return JobStatus::Running;
    }
    if any_aborted {
        JobStatus::NotConverged
    } else {
        JobStatus::Finished
    }
}

#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    /// Give up after this long and report what is still pending
    pub timeout: Option<Duration>,
    /// First poll interval; defaults to the configured one
    pub initial_interval: Option<Duration>,
}

impl WaitOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }
}

/// Children of a master grouped by outcome
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildrenReport {
    pub finished: Vec<JobId>,
    pub not_converged: Vec<JobId>,
    pub aborted: Vec<JobId>,
    /// Children not in a terminal status yet
    pub pending: Vec<JobId>,
    /// The wait ended because of its timeout
    pub timed_out: bool,
}

impl ChildrenReport {
    pub fn from_rows(rows: &[IndexRecord]) -> Self {
        let mut report = Self::default();
        for row in rows {
            match row.status {
                JobStatus::Finished => report.finished.push(row.id),
                JobStatus::NotConverged => report.not_converged.push(row.id),
                JobStatus::Aborted => report.aborted.push(row.id),
                _ => report.pending.push(row.id),
            }
        }
        report
    }

    /// Every child reached a terminal status
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn total(&self) -> usize {
        self.finished.len() + self.not_converged.len() + self.aborted.len() + self.pending.len()
    }
}

/// Drives master jobs
pub struct MasterCoordinator {
    system: Arc<JobSystem>,
}

impl MasterCoordinator {
    pub fn new(system: Arc<JobSystem>) -> Self {
        Self { system }
    }

    /// Select how the master treats aborted children. Only allowed while the
    /// master is still editable.
    pub fn set_policy(master: &mut Job, policy: AggregatePolicy) -> Result<()> {
        master.set_input(POLICY_KEY, policy)
    }

    /// Attach `child` to `master` and save it. The master must be saved.
    pub async fn add_child(&self, master: &Job, child: &mut Job) -> Result<JobId> {
        if !master.runnable().is_master() {
            return Err(JobError::configuration(format!(
                "job {} is not a master job",
                master.name()
            )));
        }
        let master_id = master.job_id()?;
        if !child.is_editable() {
            return Err(JobError::conflict(format!(
                "job {} is {} and cannot become a child",
                child.name(),
                child.status()
            )));
        }

        child.set_master_id(Some(master_id));
        let child_id = child.save().await?;
        self.system
            .index()
            .update(child_id, &IndexUpdate::default().master_id(Some(master_id)))
            .await?;
        info!(job_id = child_id, master_id, job_name = %child.name(), "Added child job");
        Ok(child_id)
    }

    /// Index rows of all children of `master_id`
    pub async fn children(&self, master_id: JobId) -> Result<Vec<IndexRecord>> {
        self.system.index().query(&JobFilter::children_of(master_id)).await
    }

    /// Move the master to `running` and run every child that has not been
    /// started yet, each through its own run mode. A failing child does not
    /// stop its siblings. Returns the master's status afterwards.
    ///
    /// Boxed because a child may itself be a master.
    pub fn start<'a>(&'a self, master: &'a mut Job) -> BoxFuture<'a, Result<JobStatus>> {
        async move {
            if !master.runnable().is_master() {
                return Err(JobError::configuration(format!(
                    "job {} is not a master job",
                    master.name()
                )));
            }
            let master_id = master.job_id()?;

            {
                let ctx = JobContext::open(
                    Arc::clone(&self.system),
                    master_id,
                    master.name(),
                    master.storage_path(),
                )
                .await?;
                match master.status() {
                    JobStatus::Created => ctx.transition(JobStatus::Created, JobStatus::Submitted).await?,
                    JobStatus::Suspended => {
                        ctx.transition(JobStatus::Suspended, JobStatus::Refresh).await?;
                        ctx.transition(JobStatus::Refresh, JobStatus::Submitted).await?;
                    }
                    other => {
                        return Err(JobError::conflict(format!(
                            "master job {} is {} and cannot be started",
                            master.name(),
                            other
                        )))
                    }
                }
                ctx.transition(JobStatus::Submitted, JobStatus::Running).await?;
                master.set_status(JobStatus::Running);
            }

            for row in self.children(master_id).await? {
                if !matches!(row.status, JobStatus::Created | JobStatus::Suspended) {
                    continue;
                }
                let mut child = Job::load_by_id(Arc::clone(&self.system), row.id).await?;
                match child.run().await {
                    Ok(outcome) => debug!(job_id = row.id, master_id, ?outcome, "Child started"),
                    Err(e) => warn!(job_id = row.id, master_id, "Child job failed: {}", e),
                }
            }

            let status = self.refresh(master_id).await?;
            master.set_status(status);
            Ok(status)
        }
        .boxed()
    }

    /// Poll the children's index rows with growing intervals until all of
    /// them ended. On timeout the partial report is returned with
    /// `timed_out` set; a cancelled token ends the wait with an error.
    pub async fn wait_for_children(
        &self,
        master_id: JobId,
        options: WaitOptions,
        cancel: &CancelToken,
    ) -> Result<ChildrenReport> {
        let wait = &self.system.config().wait;
        let started = Instant::now();
        let mut interval = options.initial_interval.unwrap_or(wait.initial_interval);

        loop {
            let rows = self.children(master_id).await?;
            let mut report = ChildrenReport::from_rows(&rows);
            if report.is_complete() {
                return Ok(report);
            }

            if let Some(timeout) = options.timeout {
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    info!(master_id, pending = report.pending.len(), "Stopped waiting for children");
                    report.timed_out = true;
                    return Ok(report);
                }
                interval = interval.min(timeout - elapsed);
            }

            debug!(master_id, pending = report.pending.len(), ?interval, "Waiting for children");
            if cancel.sleep(interval).await {
                return Err(JobError::Cancelled(format!(
                    "waiting for children of job {}",
                    master_id
                )));
            }
            interval = wait.next_interval(interval);
        }
    }

    /// Status the master would have now, without changing it
    pub async fn aggregate(&self, master_id: JobId, policy: AggregatePolicy) -> Result<JobStatus> {
        let statuses: Vec<JobStatus> = self
            .children(master_id)
            .await?
            .iter()
            .map(|row| row.status)
            .collect();
        Ok(aggregate_status(policy, &statuses))
    }

    /// Re-derive a running master's status from its children and finalize it
    /// once they allow. Masters that are not running are left alone.
    pub async fn refresh(&self, master_id: JobId) -> Result<JobStatus> {
        let row = self
            .system
            .index()
            .get(master_id)
            .await?
            .ok_or_else(|| JobError::not_found(format!("master job {} in index", master_id)))?;
        if row.status != JobStatus::Running {
            return Ok(row.status);
        }

        let master = Job::from_storage(Arc::clone(&self.system), &row.storage_path).await?;
        let policy = policy_of(master.input())?;
        let children = self.children(master_id).await?;
        let statuses: Vec<JobStatus> = children.iter().map(|c| c.status).collect();
        let target = aggregate_status(policy, &statuses);
        if target == JobStatus::Running {
            return Ok(target);
        }

        let ctx = JobContext::open(
            Arc::clone(&self.system),
            master_id,
            master.name(),
            master.storage_path(),
        )
        .await?;
        let stored = ctx.stored_status()?;
        if stored.is_terminal() {
            return Ok(stored);
        }

        let report = ChildrenReport::from_rows(&children);
        if target == JobStatus::Aborted {
            let failure = Failure::new(
                FailureReason::ChildrenFailed,
                format!("aborted children: {:?}", report.aborted),
            );
            return ctx.abort(&failure).await;
        }

        if stored == JobStatus::Running {
            ctx.transition(JobStatus::Running, JobStatus::Collect).await?;
        }
        let output = children_output(&children, &report);
        ctx.record.with_scoped("", |scope| scope.write(layout::OUTPUT, &output))?;
        ctx.record.flush().await?;
        ctx.transition(JobStatus::Collect, target).await?;
        info!(job_id = master_id, status = %target, children = children.len(), "Master job completed");
        Ok(target)
    }
}

fn policy_of(input: &Map<String, Value>) -> Result<AggregatePolicy> {
    match input.get(POLICY_KEY) {
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
            JobError::configuration(format!("invalid {}: {}", POLICY_KEY, e))
        }),
        None => Ok(AggregatePolicy::default()),
    }
}

fn children_output(children: &[IndexRecord], report: &ChildrenReport) -> Value {
    let statuses: Map<String, Value> = children
        .iter()
        .map(|c| (c.job_name.clone(), Value::String(c.status.to_string())))
        .collect();
    json!({
        "children": statuses,
        "finished": report.finished,
        "not_converged": report.not_converged,
        "aborted": report.aborted,
    })
}
