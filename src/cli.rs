//! Wrapper process entry point.
//!
//! The queuing system (or a user running a manual job) starts the wrapper
//! with a working directory and a job ID. Job types live in the application,
//! so the application's own `main` builds its registry and calls
//! [`run_wrapper_cli`]:
//!
//! ```no_run
//! # async fn app() {
//! let registry = jobrack::JobTypeRegistry::new();
//! // registry.register(...)
//! std::process::exit(jobrack::cli::run_wrapper_cli(registry, None).await);
//! # }
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use crate::core::config::JobsConfig;
use crate::core::errors::Result;
use crate::core::logging::init_logging;
use crate::exec::pipeline::ExecutionReport;
use crate::exec::wrapper;
use crate::jobs::model::JobId;
use crate::jobs::registry::JobTypeRegistry;
use crate::queue::QueueAdapter;
use crate::JobSystem;

/// Command-line arguments of the wrapper.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "jobrack-wrapper",
    version,
    about = "Reload a submitted job by ID and run it.",
    long_about = None
)]
pub struct WrapperArgs {
    /// Working directory of the job, as handed to the queuing system.
    #[arg(long, short = 'p', value_name = "DIR")]
    pub working_directory: PathBuf,

    /// Index ID of the job.
    #[arg(long, short = 'j', value_name = "ID")]
    pub job_id: JobId,

    /// YAML configuration file. Defaults apply when omitted.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(long)]
    pub debug: bool,
}

/// Build a job system from `args` and run the job through the reload protocol
pub async fn run_wrapper(
    args: &WrapperArgs,
    registry: JobTypeRegistry,
    queue: Option<Arc<dyn QueueAdapter>>,
) -> Result<ExecutionReport> {
    let config = match &args.config {
        Some(path) => JobsConfig::load(path)?,
        None => JobsConfig::default(),
    };
    let mut builder = JobSystem::builder().config(config).registry(registry);
    if let Some(queue) = queue {
        builder = builder.queue_adapter(queue);
    }
    let system = builder.build().await?;
    wrapper::run_job(system, &args.working_directory, args.job_id).await
}

/// Parse the process arguments, set up logging and run the job. Returns the
/// process exit code: 0 for a successful job, 1 for a job that ended badly,
/// 2 when the job could not be run at all.
pub async fn run_wrapper_cli(registry: JobTypeRegistry, queue: Option<Arc<dyn QueueAdapter>>) -> i32 {
    let args = WrapperArgs::parse();
    init_logging(args.debug.then_some("debug"));

    match run_wrapper(&args, registry, queue).await {
        Ok(report) if report.is_success() => {
            info!(job_id = report.job_id, status = %report.status, "Job done");
            0
        }
        Ok(report) => {
            error!(job_id = report.job_id, status = %report.status, failure = ?report.failure, "Job did not succeed");
            1
        }
        Err(e) => {
            error!(job_id = args.job_id, "Wrapper failed: {}", e);
            2
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wrapper_args() {
        let args = WrapperArgs::try_parse_from([
            "jobrack-wrapper",
            "--working-directory",
            "/scratch/project/toy_files",
            "--job-id",
            "42",
        ])
        .unwrap();
        assert_eq!(args.working_directory, PathBuf::from("/scratch/project/toy_files"));
        assert_eq!(args.job_id, 42);
        assert!(args.config.is_none());
        assert!(!args.debug);

        let args = WrapperArgs::try_parse_from(["jobrack-wrapper", "-p", "wd", "-j", "7", "--debug", "--config", "jobs.yaml"]).unwrap();
        assert_eq!(args.job_id, 7);
        assert!(args.debug);
        assert_eq!(args.config, Some(PathBuf::from("jobs.yaml")));
    }

    #[test]
    fn test_missing_job_id_is_rejected() {
        assert!(WrapperArgs::try_parse_from(["jobrack-wrapper", "--working-directory", "wd"]).is_err());
        assert!(WrapperArgs::try_parse_from(["jobrack-wrapper", "-p", "wd", "-j", "abc"]).is_err());
    }
}
