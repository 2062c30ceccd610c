use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::command::run_executable;
use super::transition::JobContext;
use crate::core::errors::{JobError, Result};
use crate::jobs::job::{layout, Job};
use crate::jobs::master::MasterCoordinator;
use crate::jobs::model::{Failure, FailureReason, JobId};
use crate::jobs::runnable::{ExecutableJob, JobBody, JobFunction};
use crate::jobs::status::JobStatus;

/// Outcome of one execution attempt
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub failure: Option<Failure>,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Drive a claimed or submitted job to a terminal status.
///
/// `from` is the status the job is in now (`submitted` or `busy`). Failures of
/// the job itself, and infrastructure errors after the job started, end in
/// `aborted` with a recorded failure; the returned report says which. An error
/// is only returned when even the abort could not be recorded.
pub async fn execute(job: &Job, ctx: &JobContext, from: JobStatus) -> Result<ExecutionReport> {
    if matches!(job.runnable().body, JobBody::Master) {
        return Err(JobError::configuration(format!(
            "job {} is a master job; its status follows its children",
            job.name()
        )));
    }

    let report = match run_steps(job, ctx, from).await {
        Ok(status) => ExecutionReport {
            job_id: ctx.job_id,
            status,
            failure: None,
        },
        Err(StepError::Failed(failure)) => {
            let status = ctx.abort(&failure).await?;
            ExecutionReport {
                job_id: ctx.job_id,
                status,
                failure: Some(failure),
            }
        }
        Err(StepError::Infrastructure(e)) => {
            error!(job_id = ctx.job_id, job_name = %ctx.job_name, "Execution pipeline error: {}", e);
            let failure = Failure::new(FailureReason::Internal, e.to_string());
            // A failed index update after the final storage write leaves the
            // record terminal; abort keeps it and the index is left for repair
            let status = ctx.abort(&failure).await?;
            ExecutionReport {
                job_id: ctx.job_id,
                status,
                failure: (status == JobStatus::Aborted).then_some(failure),
            }
        }
    };

    if report.failure.is_none() && report.status.is_success() && ctx.system.config().execution.compress_finished {
        if let Err(e) = job.compress().await {
            warn!(job_id = ctx.job_id, "Could not compress working directory: {}", e);
        }
    }

    notify_master(job, ctx).await;
    Ok(report)
}

enum StepError {
    /// The job failed
    Failed(Failure),
    /// Storage, index or runtime failure around the job
    Infrastructure(JobError),
}

impl From<JobError> for StepError {
    fn from(e: JobError) -> Self {
        StepError::Infrastructure(e)
    }
}

async fn run_steps(job: &Job, ctx: &JobContext, from: JobStatus) -> std::result::Result<JobStatus, StepError> {
    // Write-ahead: the record says running before anything runs
    ctx.transition(from, JobStatus::Running).await?;

    if ctx.cancel_requested().await? {
        return Err(StepError::Failed(Failure::cancelled()));
    }

    let output = match &job.runnable().body {
        JobBody::Function(function) => {
            let result = call_function(Arc::clone(function), job.input().clone()).await?;
            ctx.transition(JobStatus::Running, JobStatus::Collect).await?;
            function_output(result)
        }
        JobBody::Executable(executable) => {
            run_executable(
                ctx,
                Arc::clone(executable),
                job.input(),
                job.server(),
                job.working_directory(),
            )
            .await
            .map_err(StepError::Failed)?;
            ctx.transition(JobStatus::Running, JobStatus::Collect).await?;
            collect_output(Arc::clone(executable), job).await?
        }
        JobBody::Master => {
            return Err(StepError::Infrastructure(JobError::internal(
                "master jobs are not executed",
            )))
        }
    };

    if ctx.cancel_requested().await? {
        return Err(StepError::Failed(Failure::cancelled()));
    }

    // Storage commit happens before the final index update
    let final_status = if output.get("converged") == Some(&Value::Bool(false)) {
        JobStatus::NotConverged
    } else {
        JobStatus::Finished
    };
    let output = Value::Object(output);
    ctx.record.with_scoped("", |scope| scope.write(layout::OUTPUT, &output))?;
    ctx.record.flush().await?;

    ctx.transition(JobStatus::Collect, final_status).await?;
    info!(job_id = ctx.job_id, job_name = %ctx.job_name, status = %final_status, "Job completed");
    Ok(final_status)
}

async fn call_function(
    function: Arc<JobFunction>,
    input: Map<String, Value>,
) -> std::result::Result<Value, StepError> {
    match tokio::task::spawn_blocking(move || function(&input)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(StepError::Failed(Failure::new(
            FailureReason::FunctionError,
            format!("{:#}", e),
        ))),
        Err(join_error) if join_error.is_panic() => {
            let payload = join_error.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "job function panicked".to_string());
            Err(StepError::Failed(Failure::new(FailureReason::Panicked, message)))
        }
        Err(join_error) => Err(StepError::Infrastructure(JobError::internal(format!(
            "job function task failed: {}",
            join_error
        )))),
    }
}

/// `{"result": value}`, with a top-level `converged` flag lifted from the result
fn function_output(result: Value) -> Map<String, Value> {
    let mut output = Map::new();
    if let Some(converged) = result.get("converged").filter(|v| v.is_boolean()) {
        output.insert("converged".to_string(), converged.clone());
    }
    output.insert("result".to_string(), result);
    output
}

async fn collect_output(
    executable: Arc<dyn ExecutableJob>,
    job: &Job,
) -> std::result::Result<Map<String, Value>, StepError> {
    let wd = job.working_directory().to_path_buf();
    let collected = tokio::task::spawn_blocking(move || executable.collect_output(&wd))
        .await
        .map_err(|e| {
            StepError::Failed(Failure::new(
                FailureReason::Panicked,
                format!("collect_output panicked: {}", e),
            ))
        })?
        .map_err(|e| {
            StepError::Failed(Failure::new(
                FailureReason::CollectOutputFailed,
                format!("{:#}", e),
            ))
        })?;
    Ok(match collected {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("result".to_string(), other);
            map
        }
    })
}

/// Let the master re-derive its status; failures here never affect the child
async fn notify_master(job: &Job, ctx: &JobContext) {
    let master_id = match ctx.record.read_as::<Option<JobId>>(layout::MASTER_ID) {
        Ok(Some(id)) => id,
        Ok(None) => return,
        Err(e) => {
            warn!(job_id = ctx.job_id, "Could not read master id: {}", e);
            return;
        }
    };
    let coordinator = MasterCoordinator::new(Arc::clone(job.system()));
    if let Err(e) = coordinator.refresh(master_id).await {
        warn!(job_id = ctx.job_id, master_id, "Failed to refresh master job: {}", e);
    }
}
