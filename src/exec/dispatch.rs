use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::claim::claim;
use super::pipeline::{self, ExecutionReport};
use super::transition::JobContext;
use super::wrapper;
use crate::core::cancel::CancelToken;
use crate::core::errors::{JobError, Result};
use crate::index::IndexUpdate;
use crate::jobs::job::{layout, Job};
use crate::jobs::master::{MasterCoordinator, WaitOptions};
use crate::jobs::model::{Failure, FailureReason, JobId, RestartPolicy, RunMode, RunOptions};
use crate::jobs::runnable::JobBody;
use crate::jobs::status::JobStatus;
use crate::queue::{build_request, resolve_queue, wrapper_command_line};
use crate::JobSystem;

/// What `Job::run` did with the job
#[derive(Debug)]
pub enum RunOutcome {
    /// Ran to a terminal status in this call (modal)
    Finished(ExecutionReport),
    /// Running in a background task (non-modal)
    Background(BackgroundHandle),
    /// Handed to the queuing system
    Queued { job_id: JobId, queue_id: String },
    /// Prepared for out-of-band execution with `command`
    Manual {
        job_id: JobId,
        working_directory: PathBuf,
        command: String,
    },
    /// A master job started its children; `status` is its aggregate status
    Master { job_id: JobId, status: JobStatus },
    /// Nothing to do, the job already ended
    AlreadyTerminal { job_id: JobId, status: JobStatus },
}

impl RunOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            RunOutcome::Finished(report) => report.job_id,
            RunOutcome::Background(handle) => handle.job_id,
            RunOutcome::Queued { job_id, .. }
            | RunOutcome::Manual { job_id, .. }
            | RunOutcome::Master { job_id, .. }
            | RunOutcome::AlreadyTerminal { job_id, .. } => *job_id,
        }
    }
}

/// Handle on a job running in a background task of this process
pub struct BackgroundHandle {
    job_id: JobId,
    system: Arc<JobSystem>,
    task: JoinHandle<Result<ExecutionReport>>,
}

impl fmt::Debug for BackgroundHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundHandle")
            .field("job_id", &self.job_id)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl BackgroundHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Current status according to the index
    pub async fn status(&self) -> Result<JobStatus> {
        self.system
            .index()
            .get(self.job_id)
            .await?
            .map(|row| row.status)
            .ok_or_else(|| JobError::not_found(format!("job {} in index", self.job_id)))
    }

    /// Block until the background run ends
    pub async fn wait(self) -> Result<ExecutionReport> {
        self.task
            .await
            .map_err(|e| JobError::internal(format!("background task of job {} failed: {}", self.job_id, e)))?
    }
}

/// Run a job according to its server settings.
///
/// Unsaved jobs are validated and saved first. A job that already ended is
/// left alone unless `options.allow_restart` is set, and so is one that is
/// still active, which is rejected with a conflict.
pub async fn run(job: &mut Job, options: RunOptions) -> Result<RunOutcome> {
    if job.is_editable() {
        preflight(job)?;
        job.save().await?;
    }
    let job_id = job.job_id()?;
    let status = job.refresh().await?;

    match status {
        JobStatus::Created | JobStatus::Suspended => start(job).await,
        s if s.is_terminal() => {
            if options.allow_restart {
                restart(job, options.restart_policy).await
            } else {
                info!(job_id, job_name = %job.name(), status = %s, "Job already ended, not running it again");
                Ok(RunOutcome::AlreadyTerminal { job_id, status: s })
            }
        }
        s => {
            if options.allow_restart {
                restart(job, options.restart_policy).await
            } else {
                Err(JobError::conflict(format!(
                    "job {} is already {}; allow a restart to run it again",
                    job.identity().label(),
                    s
                )))
            }
        }
    }
}

/// Checks that need no persisted state: input, server settings, queue limits
fn preflight(job: &Job) -> Result<()> {
    job.runnable().validate_input(job.name(), job.input())?;
    job.server().validate()?;
    if job.server().run_mode == RunMode::Queue && !job.runnable().is_master() {
        resolve_queue(&job.system().config().queue, job.server())?;
        if job.system().queue().is_none() {
            return Err(JobError::configuration(
                "run mode is queue but no queue adapter is configured",
            ));
        }
    }
    Ok(())
}

/// Move a created or suspended job to `submitted` and hand it off
async fn start(job: &mut Job) -> Result<RunOutcome> {
    preflight(job)?;
    let job_id = job.job_id()?;

    if job.runnable().is_master() {
        return start_master(job).await;
    }

    let ctx = JobContext::open(Arc::clone(job.system()), job_id, job.name(), job.storage_path()).await?;
    if job.status() == JobStatus::Suspended {
        ctx.transition(JobStatus::Suspended, JobStatus::Refresh).await?;
        ctx.transition(JobStatus::Refresh, JobStatus::Submitted).await?;
    } else {
        ctx.transition(JobStatus::Created, JobStatus::Submitted).await?;
    }
    job.set_status(JobStatus::Submitted);

    match job.server().run_mode {
        RunMode::Modal => run_modal(job, ctx).await,
        RunMode::NonModal => {
            drop(ctx);
            Ok(RunOutcome::Background(spawn_background(Arc::clone(job.system()), job_id)))
        }
        RunMode::Queue => submit_to_queue(job, ctx).await,
        RunMode::Manual => prepare_manual(job, ctx).await,
    }
}

async fn run_modal(job: &mut Job, ctx: JobContext) -> Result<RunOutcome> {
    // Same claim as a wrapper, so a duplicated command cannot run it as well
    claim(&ctx).await?;
    job.set_status(JobStatus::Busy);
    let report = pipeline::execute(job, &ctx, JobStatus::Busy).await?;
    job.set_status(report.status);
    match &report.failure {
        Some(failure) => Err(JobError::Execution {
            job_id: report.job_id,
            failure: failure.clone(),
        }),
        None => Ok(RunOutcome::Finished(report)),
    }
}

fn spawn_background(system: Arc<JobSystem>, job_id: JobId) -> BackgroundHandle {
    let task_system = Arc::clone(&system);
    let task = tokio::spawn(async move {
        let result = wrapper::run_job_by_id(task_system, job_id).await;
        match &result {
            Ok(report) => info!(job_id, status = %report.status, "Background job ended"),
            Err(e) => error!(job_id, "Background job could not be run: {}", e),
        }
        result
    });
    info!(job_id, "Job started in the background");
    BackgroundHandle { job_id, system, task }
}

async fn submit_to_queue(job: &mut Job, ctx: JobContext) -> Result<RunOutcome> {
    let system = Arc::clone(job.system());
    let config = &system.config().queue;
    let job_id = ctx.job_id;
    let adapter = system
        .queue()
        .cloned()
        .ok_or_else(|| JobError::configuration("run mode is queue but no queue adapter is configured"))?;
    let queue = resolve_queue(config, job.server())?;

    tokio::fs::create_dir_all(job.working_directory()).await?;
    let request = build_request(config, queue, job_id, job.working_directory(), job.server());

    match adapter.submit(&request).await {
        Ok(queue_id) => {
            job.set_queue_id(Some(queue_id.clone()));
            ctx.record.write_as(layout::SERVER, job.server())?;
            ctx.record.sync().await?;
            system
                .index()
                .update(job_id, &IndexUpdate::default().queue_id(Some(queue_id.clone())))
                .await?;
            info!(job_id, queue = %request.queue, queue_id = %queue_id, "Job submitted to the queue");
            Ok(RunOutcome::Queued { job_id, queue_id })
        }
        Err(e) => {
            let failure = Failure::new(FailureReason::QueueSubmitFailed, e.to_string());
            let status = ctx.abort(&failure).await?;
            job.set_status(status);
            Err(JobError::queue(format!("submitting job {}: {}", job.identity().label(), e)))
        }
    }
}

async fn prepare_manual(job: &mut Job, ctx: JobContext) -> Result<RunOutcome> {
    let job_id = ctx.job_id;
    let working_directory = job.working_directory().to_path_buf();
    tokio::fs::create_dir_all(&working_directory).await?;

    if let JobBody::Executable(executable) = &job.runnable().body {
        let executable = Arc::clone(executable);
        let input = job.input().clone();
        let wd = working_directory.clone();
        let written = tokio::task::spawn_blocking(move || executable.write_input(&input, &wd))
            .await
            .map_err(|e| JobError::internal(format!("write_input task failed: {}", e)))?;
        if let Err(e) = written {
            let failure = Failure::new(FailureReason::WriteInputFailed, format!("{:#}", e));
            let status = ctx.abort(&failure).await?;
            job.set_status(status);
            return Err(JobError::Execution { job_id, failure });
        }
    }

    let command = wrapper_command_line(&job.system().config().queue, &working_directory, job_id);
    info!(job_id, cmd = %command, "Job prepared for manual execution");
    Ok(RunOutcome::Manual {
        job_id,
        working_directory,
        command,
    })
}

async fn start_master(job: &mut Job) -> Result<RunOutcome> {
    let job_id = job.job_id()?;
    let coordinator = MasterCoordinator::new(Arc::clone(job.system()));
    let mut status = coordinator.start(job).await?;
    if job.server().run_mode == RunMode::Modal && !status.is_terminal() {
        let report = coordinator
            .wait_for_children(job_id, WaitOptions::default(), &CancelToken::new())
            .await?;
        info!(job_id, pending = report.pending.len(), "Children of master job ended");
        status = coordinator.refresh(job_id).await?;
        job.set_status(status);
    }
    Ok(RunOutcome::Master { job_id, status })
}

/// Run a fresh attempt of a job that ended or is stuck
async fn restart(job: &mut Job, policy: RestartPolicy) -> Result<RunOutcome> {
    if job.runnable().is_master() {
        return Err(JobError::conflict(format!(
            "master job {} cannot be restarted; restart its children instead",
            job.identity().label()
        )));
    }
    let project = job.project()?;
    let old_id = job.job_id()?;

    let fresh = match policy {
        RestartPolicy::InPlace => {
            if !job.status().is_terminal() {
                let status = project.cancel_job(old_id).await?;
                if !status.is_terminal() {
                    let ctx = JobContext::open(Arc::clone(job.system()), old_id, job.name(), job.storage_path()).await?;
                    ctx.abort(&Failure::new(FailureReason::Cancelled, "superseded by a restart"))
                        .await?;
                }
            }
            project.remove_job(old_id).await?;
            job.respawn(job.name())?
        }
        RestartPolicy::CopyToNew => {
            let name = next_restart_name(job).await?;
            job.respawn(&name)?
        }
    };

    warn!(job_id = old_id, job_name = %job.name(), new_name = %fresh.name(), ?policy, "Restarting job");
    *job = fresh;
    preflight(job)?;
    job.save().await?;
    start(job).await
}

/// First free `<name>_restart_<n>` in the job's project
async fn next_restart_name(job: &Job) -> Result<String> {
    let system = job.system();
    let extension = &system.config().storage.extension;
    let mut n = 1u32;
    loop {
        let name = format!("{}_restart_{}", job.name(), n);
        let taken_in_index = system
            .index()
            .find_by_name(job.project_path(), &name)
            .await?
            .is_some();
        let storage = job.project_path().join(format!("{}.{}", name, extension));
        if !taken_in_index && !system.records().exists(&storage) {
            return Ok(name);
        }
        n = n
            .checked_add(1)
            .ok_or_else(|| JobError::internal("no free restart name left"))?;
    }
}
