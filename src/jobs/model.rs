use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::core::errors::{JobError, Result};

pub type JobId = u64;

/// Identity of a job: index-assigned ID plus the names and paths derived
/// from its project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobIdentity {
    /// Assigned once, at the first successful save
    pub job_id: Option<JobId>,
    pub job_name: String,
    /// Registry key of the job type
    pub job_type: String,
    pub project: PathBuf,
    pub working_directory: PathBuf,
    pub storage_path: PathBuf,
}

impl JobIdentity {
    pub fn new(project: PathBuf, job_name: &str, job_type: &str, extension: &str) -> Result<Self> {
        validate_job_name(job_name)?;
        Ok(Self {
            job_id: None,
            job_name: job_name.to_string(),
            job_type: job_type.to_string(),
            working_directory: project.join(format!("{}_files", job_name)),
            storage_path: project.join(format!("{}.{}", job_name, extension)),
            project,
        })
    }

    /// Human readable label used in logs and errors
    pub fn label(&self) -> String {
        match self.job_id {
            Some(id) => format!("{} (id {})", self.job_name, id),
            None => self.job_name.clone(),
        }
    }
}

/// Job names end up in file names, so only a path-safe alphabet is accepted.
pub fn validate_job_name(job_name: &str) -> Result<()> {
    if job_name.is_empty() {
        return Err(JobError::configuration("job name must not be empty"));
    }
    if job_name.starts_with('.') || job_name.starts_with('-') {
        return Err(JobError::configuration(format!(
            "job name '{}' must start with a letter, digit or underscore",
            job_name
        )));
    }
    if let Some(bad) = job_name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(JobError::configuration(format!(
            "job name '{}' contains invalid character '{}'",
            job_name, bad
        )));
    }
    Ok(())
}

/// How a created job is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Blocking, in the current process
    Modal,
    /// Background task in the current process
    NonModal,
    /// Handed off to the external queuing system
    Queue,
    /// Prepared but not executed
    Manual,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Modal => "modal",
            RunMode::NonModal => "non_modal",
            RunMode::Queue => "queue",
            RunMode::Manual => "manual",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "modal" => Ok(RunMode::Modal),
            "non_modal" => Ok(RunMode::NonModal),
            "queue" => Ok(RunMode::Queue),
            "manual" => Ok(RunMode::Manual),
            other => Err(JobError::configuration(format!(
                "unknown run mode '{}' (expected one of: modal, non_modal, queue, manual)",
                other
            ))),
        }
    }
}

/// Per-job execution settings, stored under `generic/server`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub run_mode: RunMode,
    pub queue: Option<String>,
    pub cores: u32,
    pub threads: u32,
    pub gpus: Option<u32>,
    /// Wall-clock limit in seconds
    pub run_time: Option<u64>,
    pub memory_mb: Option<u64>,
    /// Identifier assigned by the queuing system at submission
    pub queue_id: Option<String>,
    /// Non-zero exit codes of the external command that still count as success
    pub accepted_return_codes: Vec<i32>,
    pub additional_arguments: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Modal,
            queue: None,
            cores: 1,
            threads: 1,
            gpus: None,
            run_time: None,
            memory_mb: None,
            queue_id: None,
            accepted_return_codes: Vec::new(),
            additional_arguments: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cores == 0 {
            return Err(JobError::configuration("cores must be greater than 0"));
        }
        if self.threads == 0 {
            return Err(JobError::configuration("threads must be greater than 0"));
        }
        if self.run_time == Some(0) {
            return Err(JobError::configuration("run_time must be greater than 0"));
        }
        if self.queue.as_deref() == Some("") {
            return Err(JobError::configuration("queue name must not be empty"));
        }
        Ok(())
    }

    pub fn accepts_exit_code(&self, code: i32) -> bool {
        code == 0 || self.accepted_return_codes.contains(&code)
    }
}

/// What to do when an already active or terminal job is run again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Remove the job and recreate it under the same name
    #[default]
    InPlace,
    /// Create `<name>_restart_<n>` with the same input, keep the original
    CopyToNew,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub allow_restart: bool,
    pub restart_policy: RestartPolicy,
}

impl RunOptions {
    pub fn restart(policy: RestartPolicy) -> Self {
        Self {
            allow_restart: true,
            restart_policy: policy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NonZeroExit,
    FunctionError,
    Panicked,
    WriteInputFailed,
    CollectOutputFailed,
    SpawnFailed,
    Cancelled,
    QueueSubmitFailed,
    ChildrenFailed,
    Lost,
    Internal,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::NonZeroExit => "non_zero_exit",
            FailureReason::FunctionError => "function_error",
            FailureReason::Panicked => "panicked",
            FailureReason::WriteInputFailed => "write_input_failed",
            FailureReason::CollectOutputFailed => "collect_output_failed",
            FailureReason::SpawnFailed => "spawn_failed",
            FailureReason::Cancelled => "cancelled",
            FailureReason::QueueSubmitFailed => "queue_submit_failed",
            FailureReason::ChildrenFailed => "children_failed",
            FailureReason::Lost => "lost",
            FailureReason::Internal => "internal",
        }
    }
}

/// Diagnostic payload recorded when a job is aborted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub reason: FailureReason,
    pub message: String,
    pub exit_code: Option<i32>,
    pub stderr_tail: Option<String>,
}

impl Failure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            exit_code: None,
            stderr_tail: None,
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_stderr_tail(mut self, tail: impl Into<String>) -> Self {
        self.stderr_tail = Some(tail.into());
        self
    }

    pub fn cancelled() -> Self {
        Self::new(FailureReason::Cancelled, "cancelled")
    }

    /// Short string for the index `reason` column
    pub fn summary(&self) -> String {
        let mut summary = format!("{}: {}", self.reason.as_str(), self.message);
        if summary.len() > 200 {
            let mut cut = 200;
            while !summary.is_char_boundary(cut) {
                cut -= 1;
            }
            summary.truncate(cut);
        }
        summary
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason.as_str(), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_paths_derive_from_project_and_name() {
        let identity = JobIdentity::new(PathBuf::from("/data/proj"), "toy", "Adder", "jrk").unwrap();
        assert_eq!(identity.working_directory, PathBuf::from("/data/proj/toy_files"));
        assert_eq!(identity.storage_path, PathBuf::from("/data/proj/toy.jrk"));
        assert_eq!(identity.job_id, None);
    }

    #[test]
    fn test_job_name_validation() {
        assert!(validate_job_name("toy_1-b").is_ok());
        assert!(validate_job_name("").is_err());
        assert!(validate_job_name("../escape").is_err());
        assert!(validate_job_name("a/b").is_err());
        assert!(validate_job_name(".hidden").is_err());
    }

    #[test]
    fn test_unknown_run_mode_is_configuration_error() {
        let err = "srun".parse::<RunMode>().unwrap_err();
        assert!(matches!(err, JobError::Configuration(_)));
        assert_eq!("non_modal".parse::<RunMode>().unwrap(), RunMode::NonModal);
    }

    #[test]
    fn test_server_validation() {
        let mut server = ServerConfig::default();
        assert!(server.validate().is_ok());
        server.cores = 0;
        assert!(server.validate().is_err());
        server.cores = 2;
        server.run_mode = RunMode::Queue;
        server.queue = Some(String::new());
        assert!(server.validate().is_err());
        server.queue = Some("short".to_string());
        assert!(server.validate().is_ok());
    }

    #[test]
    fn test_accepted_exit_codes() {
        let server = ServerConfig {
            accepted_return_codes: vec![3],
            ..Default::default()
        };
        assert!(server.accepts_exit_code(0));
        assert!(server.accepts_exit_code(3));
        assert!(!server.accepts_exit_code(1));
    }

    #[test]
    fn test_failure_summary_is_bounded() {
        let failure = Failure::new(FailureReason::FunctionError, "x".repeat(500));
        assert!(failure.summary().len() <= 200);
        assert!(failure.summary().starts_with("function_error: "));
    }
}
