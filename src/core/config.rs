use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::core::errors::{JobError, Result};
use crate::jobs::model::{RunMode, ServerConfig};
use crate::queue::QueueLimits;

/// Job system configuration, constructed once at process start and shared by
/// the index, the record store and the queue adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    // Index configuration
    /// sqlx SQLite URL of the job index (e.g. "sqlite:///data/jobs.db")
    pub index_url: String,
    /// Maximum number of pooled index connections
    pub index_max_connections: u32,
    /// How long SQLite waits on a locked database before failing
    pub index_busy_timeout: Duration,

    /// Job record storage
    pub storage: StorageConfig,
    /// Defaults applied to newly created jobs
    pub server: ServerDefaults,
    /// Queuing system settings
    pub queue: QueueConfig,
    /// Execution pipeline tuning
    pub execution: ExecutionConfig,
    /// Blocking wait tuning
    pub wait: WaitConfig,
    /// Behaviour of `create_job` when the name is already taken
    pub existing_job_policy: ExistingJobPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Extension of job record directories
    pub extension: String,
    /// Leaf values larger than this many bytes are zstd-compressed
    pub compression_threshold: usize,
    pub compression_level: i32,
    /// Attempts to open a record held by another process
    pub open_retries: u32,
    pub open_retry_interval: Duration,
    /// fsync after every committed scoped write
    pub flush_on_commit: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            extension: "jrk".to_string(),
            compression_threshold: 64 * 1024, // 64KB
            compression_level: 3,
            open_retries: 40,
            open_retry_interval: Duration::from_millis(50),
            flush_on_commit: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerDefaults {
    pub run_mode: RunMode,
    pub cores: u32,
    pub threads: u32,
    pub queue: Option<String>,
}

impl Default for ServerDefaults {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Modal,
            cores: 1,
            threads: 1,
            queue: None,
        }
    }
}

impl ServerDefaults {
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            run_mode: self.run_mode,
            cores: self.cores,
            threads: self.threads,
            queue: self.queue.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Declared limits per queue name
    pub limits: BTreeMap<String, QueueLimits>,
    pub default_queue: Option<String>,
    /// Queue job names are `<prefix><job_id>`
    pub job_name_prefix: String,
    /// Batch script template, see `queue::render_script`
    pub script_template: String,
    /// Program the queuing system runs on the compute node
    pub wrapper_command: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            limits: BTreeMap::new(),
            default_queue: None,
            job_name_prefix: "jr_".to_string(),
            script_template: crate::queue::DEFAULT_SCRIPT_TEMPLATE.to_string(),
            wrapper_command: "jobrack-wrapper".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// How often a running external command checks the cancellation flag
    pub cancel_poll_interval: Duration,
    /// Time between SIGTERM and SIGKILL for a cancelled process group
    pub kill_grace_period: Duration,
    /// Bounded retries of the optimistic claim
    pub claim_attempts: u32,
    pub claim_retry_delay: Duration,
    /// Bytes of stderr kept in the failure payload
    pub stderr_tail_bytes: usize,
    /// Pack the working directory of a successfully ended job into one archive
    pub compress_finished: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            cancel_poll_interval: Duration::from_millis(500),
            kill_grace_period: Duration::from_secs(5),
            claim_attempts: 3,
            claim_retry_delay: Duration::from_millis(50),
            stderr_tail_bytes: 4096,
            compress_finished: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl WaitConfig {
    /// Next poll interval after `current`, capped at `max_interval`, with ±10% jitter
    pub fn next_interval(&self, current: Duration) -> Duration {
        let next = current.mul_f64(self.multiplier).min(self.max_interval);
        let jitter = (fastrand::u32(..) as f64 / u32::MAX as f64) * 0.2 - 0.1; // ±10% jitter
        next.mul_f64(1.0 + jitter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistingJobPolicy {
    /// Return the stored job when the type matches
    #[default]
    Load,
    /// Always fail with a conflict
    Error,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            index_url: "sqlite://jobrack.db".to_string(),
            index_max_connections: 8,
            index_busy_timeout: Duration::from_secs(5),
            storage: StorageConfig::default(),
            server: ServerDefaults::default(),
            queue: QueueConfig::default(),
            execution: ExecutionConfig::default(),
            wait: WaitConfig::default(),
            existing_job_policy: ExistingJobPolicy::default(),
        }
    }
}

impl JobsConfig {
    /// Create a new builder for JobsConfig
    pub fn builder() -> JobsConfigBuilder {
        JobsConfigBuilder::new()
    }

    /// Read a YAML configuration file and validate it
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: JobsConfig = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        // Index validation
        if self.index_url.trim().is_empty() {
            return Err(JobError::configuration("index_url must not be empty"));
        }
        if self.index_max_connections == 0 {
            return Err(JobError::configuration(
                "index_max_connections must be greater than 0",
            ));
        }

        // Storage validation
        if self.storage.extension.is_empty() || self.storage.extension.contains('/') {
            return Err(JobError::configuration(
                "storage.extension must be a non-empty file extension",
            ));
        }
        if !(1..=22).contains(&self.storage.compression_level) {
            return Err(JobError::configuration(
                "storage.compression_level must be between 1 and 22",
            ));
        }

        // Server defaults
        if self.server.cores == 0 || self.server.threads == 0 {
            return Err(JobError::configuration(
                "server.cores and server.threads must be greater than 0",
            ));
        }

        // Queue validation
        for (name, limits) in &self.queue.limits {
            limits
                .validate()
                .map_err(|e| JobError::configuration(format!("queue '{}': {}", name, e)))?;
        }
        if let Some(default_queue) = &self.queue.default_queue {
            if !self.queue.limits.contains_key(default_queue) {
                return Err(JobError::configuration(format!(
                    "default queue '{}' has no declared limits",
                    default_queue
                )));
            }
        }
        if self.queue.wrapper_command.trim().is_empty() {
            return Err(JobError::configuration("queue.wrapper_command must not be empty"));
        }

        // Execution validation
        if self.execution.claim_attempts == 0 {
            return Err(JobError::configuration(
                "execution.claim_attempts must be greater than 0",
            ));
        }
        if self.execution.cancel_poll_interval.is_zero() {
            return Err(JobError::configuration(
                "execution.cancel_poll_interval must be greater than 0",
            ));
        }

        // Wait validation
        if self.wait.multiplier < 1.0 {
            return Err(JobError::configuration("wait.multiplier must be >= 1.0"));
        }
        if self.wait.initial_interval.is_zero() {
            return Err(JobError::configuration(
                "wait.initial_interval must be greater than 0",
            ));
        }
        if self.wait.initial_interval > self.wait.max_interval {
            return Err(JobError::configuration(
                "wait.initial_interval cannot exceed wait.max_interval",
            ));
        }

        Ok(())
    }

    /// Short intervals and an in-memory index, for interactive use and tests
    pub fn development() -> Self {
        Self {
            index_url: "sqlite::memory:".to_string(),
            index_max_connections: 1,
            index_busy_timeout: Duration::from_secs(1),
            storage: StorageConfig {
                flush_on_commit: false,
                open_retry_interval: Duration::from_millis(10),
                ..Default::default()
            },
            execution: ExecutionConfig {
                cancel_poll_interval: Duration::from_millis(50),
                kill_grace_period: Duration::from_millis(500),
                claim_retry_delay: Duration::from_millis(5),
                ..Default::default()
            },
            wait: WaitConfig {
                initial_interval: Duration::from_millis(10),
                max_interval: Duration::from_millis(200),
                multiplier: 1.5,
            },
            ..Default::default()
        }
    }
}

/// Builder for JobsConfig
pub struct JobsConfigBuilder {
    config: JobsConfig,
}

impl JobsConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: JobsConfig::default(),
        }
    }

    pub fn from_config(config: JobsConfig) -> Self {
        Self { config }
    }

    pub fn index_url(mut self, url: impl Into<String>) -> Self {
        self.config.index_url = url.into();
        self
    }

    /// Index stored in a SQLite file at `path`, created if missing
    pub fn index_path(mut self, path: impl AsRef<Path>) -> Self {
        self.config.index_url = format!("sqlite://{}", path.as_ref().display());
        self
    }

    pub fn index_max_connections(mut self, connections: u32) -> Self {
        self.config.index_max_connections = connections;
        self
    }

    pub fn index_busy_timeout(mut self, timeout: Duration) -> Self {
        self.config.index_busy_timeout = timeout;
        self
    }

    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.config.storage = storage;
        self
    }

    pub fn compression_threshold(mut self, bytes: usize) -> Self {
        self.config.storage.compression_threshold = bytes;
        self
    }

    pub fn server(mut self, server: ServerDefaults) -> Self {
        self.config.server = server;
        self
    }

    pub fn default_run_mode(mut self, run_mode: RunMode) -> Self {
        self.config.server.run_mode = run_mode;
        self
    }

    pub fn queue_limits(mut self, queue: impl Into<String>, limits: QueueLimits) -> Self {
        self.config.queue.limits.insert(queue.into(), limits);
        self
    }

    pub fn default_queue(mut self, queue: impl Into<String>) -> Self {
        self.config.queue.default_queue = Some(queue.into());
        self
    }

    pub fn wrapper_command(mut self, command: impl Into<String>) -> Self {
        self.config.queue.wrapper_command = command.into();
        self
    }

    pub fn execution(mut self, execution: ExecutionConfig) -> Self {
        self.config.execution = execution;
        self
    }

    pub fn wait(mut self, wait: WaitConfig) -> Self {
        self.config.wait = wait;
        self
    }

    pub fn existing_job_policy(mut self, policy: ExistingJobPolicy) -> Self {
        self.config.existing_job_policy = policy;
        self
    }

    pub fn build(self) -> Result<JobsConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for JobsConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = JobsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.job_name_prefix, "jr_");
        assert_eq!(config.storage.extension, "jrk");
    }

    #[test]
    fn test_development_config_is_valid() {
        assert!(JobsConfig::development().validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_unknown_default_queue() {
        let result = JobsConfig::builder().default_queue("gpu").build();
        assert!(matches!(result, Err(JobError::Configuration(_))));

        let config = JobsConfig::builder()
            .queue_limits("gpu", QueueLimits::default())
            .default_queue("gpu")
            .build()
            .unwrap();
        assert_eq!(config.queue.default_queue.as_deref(), Some("gpu"));
    }

    #[test]
    fn test_invalid_wait_intervals() {
        let mut config = JobsConfig::default();
        config.wait.initial_interval = Duration::from_secs(10);
        config.wait.max_interval = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_next_interval_is_capped() {
        let wait = WaitConfig {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(1000),
            multiplier: 2.0,
        };
        for _ in 0..50 {
            let next = wait.next_interval(Duration::from_millis(800));
            assert!(next <= Duration::from_millis(1100));
            assert!(next >= Duration::from_millis(900));
        }
    }

    #[test]
    fn test_load_partial_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobrack.yaml");
        std::fs::write(
            &path,
            "index_url: sqlite:///tmp/jobs.db\nexisting_job_policy: error\nserver:\n  cores: 4\n",
        )
        .unwrap();
        let config = JobsConfig::load(&path).unwrap();
        assert_eq!(config.index_url, "sqlite:///tmp/jobs.db");
        assert_eq!(config.existing_job_policy, ExistingJobPolicy::Error);
        assert_eq!(config.server.cores, 4);
        assert_eq!(config.server.threads, 1);
    }

    #[test]
    fn test_load_rejects_unknown_run_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobrack.yaml");
        std::fs::write(&path, "server:\n  run_mode: srun\n").unwrap();
        assert!(matches!(JobsConfig::load(&path), Err(JobError::Yaml(_))));
    }
}
