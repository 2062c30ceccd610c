//! Queuing system boundary
//!
//! The concrete scheduler (SLURM, PBS, ...) lives behind [`QueueAdapter`]. This
//! module declares the submission request, validates resource requests against
//! declared per-queue limits before anything is submitted, and renders the batch
//! script that runs the wrapper on the compute node.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::core::config::QueueConfig;
use crate::core::errors::{JobError, Result};
use crate::jobs::model::{JobId, ServerConfig};

pub const DEFAULT_SCRIPT_TEMPLATE: &str = "#!/bin/sh\n\
# {{job_name}}: job {{job_id}} with {{cores}} core(s)\n\
cd {{working_directory}} || exit 1\n\
{{command}}\n";

/// Declared limits of one queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueLimits {
    pub cores_min: u32,
    pub cores_max: Option<u32>,
    /// Seconds
    pub run_time_max: Option<u64>,
    pub memory_max_mb: Option<u64>,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            cores_min: 1,
            cores_max: None,
            run_time_max: None,
            memory_max_mb: None,
        }
    }
}

impl QueueLimits {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.cores_min == 0 {
            return Err("cores_min must be greater than 0".to_string());
        }
        if let Some(max) = self.cores_max {
            if max < self.cores_min {
                return Err("cores_max cannot be smaller than cores_min".to_string());
            }
        }
        Ok(())
    }

    /// Reject a resource request that does not fit this queue
    pub fn check(&self, queue: &str, server: &ServerConfig) -> Result<()> {
        if server.cores < self.cores_min {
            return Err(JobError::configuration(format!(
                "queue '{}' requires at least {} cores, {} requested",
                queue, self.cores_min, server.cores
            )));
        }
        if let Some(max) = self.cores_max {
            if server.cores > max {
                return Err(JobError::configuration(format!(
                    "queue '{}' allows at most {} cores, {} requested",
                    queue, max, server.cores
                )));
            }
        }
        if let (Some(max), Some(requested)) = (self.run_time_max, server.run_time) {
            if requested > max {
                return Err(JobError::configuration(format!(
                    "queue '{}' allows at most {}s run time, {}s requested",
                    queue, max, requested
                )));
            }
        }
        if let (Some(max), Some(requested)) = (self.memory_max_mb, server.memory_mb) {
            if requested > max {
                return Err(JobError::configuration(format!(
                    "queue '{}' allows at most {} MB memory, {} MB requested",
                    queue, max, requested
                )));
            }
        }
        Ok(())
    }
}

/// Resources requested from the queuing system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cores: u32,
    pub threads: u32,
    pub gpus: Option<u32>,
    pub run_time: Option<u64>,
    pub memory_mb: Option<u64>,
}

impl From<&ServerConfig> for Resources {
    fn from(server: &ServerConfig) -> Self {
        Self {
            cores: server.cores,
            threads: server.threads,
            gpus: server.gpus,
            run_time: server.run_time,
            memory_mb: server.memory_mb,
        }
    }
}

/// Everything a queue adapter needs to submit one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub job_id: JobId,
    /// Name shown by the queuing system, `<prefix><job_id>`
    pub queue_job_name: String,
    pub queue: String,
    pub working_directory: PathBuf,
    pub resources: Resources,
    /// Wrapper command line that reloads and runs the job
    pub command: String,
    /// Rendered batch script
    pub script: String,
}

/// Job state as reported by the queuing system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Pending,
    Running,
    Done,
    Failed,
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueState::Pending => "pending",
            QueueState::Running => "running",
            QueueState::Done => "done",
            QueueState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Submit/poll/cancel capability of an external queuing system
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Submit a job and return the queue-assigned identifier
    async fn submit(&self, request: &SubmitRequest) -> Result<String>;

    async fn poll(&self, queue_id: &str) -> Result<QueueState>;

    async fn cancel(&self, queue_id: &str) -> Result<()>;
}

/// Resolve the target queue and check the request against its limits
pub fn resolve_queue(config: &QueueConfig, server: &ServerConfig) -> Result<String> {
    let queue = server
        .queue
        .clone()
        .or_else(|| config.default_queue.clone())
        .ok_or_else(|| JobError::configuration("no queue selected and no default queue configured"))?;
    let limits = config.limits.get(&queue).ok_or_else(|| {
        JobError::configuration(format!("queue '{}' is not declared in the configuration", queue))
    })?;
    limits.check(&queue, server)?;
    Ok(queue)
}

/// Command line the queuing system runs to execute a job
pub fn wrapper_command_line(config: &QueueConfig, working_directory: &Path, job_id: JobId) -> String {
    format!(
        "{} --working-directory {} --job-id {}",
        config.wrapper_command,
        shell_quote(&working_directory.to_string_lossy()),
        job_id
    )
}

/// Build the submission request for a job that passed `resolve_queue`
pub fn build_request(
    config: &QueueConfig,
    queue: String,
    job_id: JobId,
    working_directory: &Path,
    server: &ServerConfig,
) -> SubmitRequest {
    let queue_job_name = format!("{}{}", config.job_name_prefix, job_id);
    let command = wrapper_command_line(config, working_directory, job_id);
    let resources = Resources::from(server);
    let script = render_script(
        &config.script_template,
        &[
            ("command", command.clone()),
            ("job_id", job_id.to_string()),
            ("job_name", queue_job_name.clone()),
            ("working_directory", shell_quote(&working_directory.to_string_lossy())),
            ("cores", resources.cores.to_string()),
            ("threads", resources.threads.to_string()),
            ("run_time", resources.run_time.map(|t| t.to_string()).unwrap_or_default()),
            ("memory_mb", resources.memory_mb.map(|m| m.to_string()).unwrap_or_default()),
        ],
    );
    SubmitRequest {
        job_id,
        queue_job_name,
        queue,
        working_directory: working_directory.to_path_buf(),
        resources,
        command,
        script,
    }
}

/// Replace `{{name}}` placeholders; unknown placeholders are left untouched
pub fn render_script(template: &str, values: &[(&str, String)]) -> String {
    let mut script = template.to_string();
    for (name, value) in values {
        script = script.replace(&format!("{{{{{}}}}}", name), value);
    }
    script
}

/// Quote a string for POSIX sh
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn queue_config() -> QueueConfig {
        let mut limits = BTreeMap::new();
        limits.insert(
            "short".to_string(),
            QueueLimits {
                cores_min: 1,
                cores_max: Some(16),
                run_time_max: Some(3600),
                memory_max_mb: None,
            },
        );
        QueueConfig {
            limits,
            default_queue: Some("short".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_limits_reject_oversized_requests() {
        let config = queue_config();
        let mut server = ServerConfig {
            cores: 32,
            ..Default::default()
        };
        assert!(matches!(
            resolve_queue(&config, &server),
            Err(JobError::Configuration(_))
        ));
        server.cores = 8;
        server.run_time = Some(7200);
        assert!(resolve_queue(&config, &server).is_err());
        server.run_time = Some(600);
        assert_eq!(resolve_queue(&config, &server).unwrap(), "short");
    }

    #[test]
    fn test_unknown_queue_is_configuration_error() {
        let config = queue_config();
        let server = ServerConfig {
            queue: Some("gpu".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            resolve_queue(&config, &server),
            Err(JobError::Configuration(_))
        ));
    }

    #[test]
    fn test_request_carries_prefixed_name_and_wrapper_command() {
        let config = queue_config();
        let server = ServerConfig {
            cores: 4,
            ..Default::default()
        };
        let request = build_request(&config, "short".into(), 17, Path::new("/data/my proj/toy_files"), &server);
        assert_eq!(request.queue_job_name, "jr_17");
        assert_eq!(
            request.command,
            "jobrack-wrapper --working-directory '/data/my proj/toy_files' --job-id 17"
        );
        assert!(request.script.contains("jr_17: job 17 with 4 core(s)"));
        assert!(request.script.contains(&request.command));
        assert_eq!(request.resources.cores, 4);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/plain/path"), "/plain/path");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
