//! jobrack: persistent, resumable jobs for scientific workflows
//!
//! Jobs are self-describing units of work (an in-process function or an
//! external executable) whose state lives in a per-job record on the shared
//! filesystem and in a relational index. They can run blocking, in the
//! background, or through an HPC queuing system, and can be resumed by a fresh
//! process on another machine.

pub mod cli;
pub mod core;
pub mod exec;
pub mod index;
pub mod jobs;
pub mod queue;
pub mod storage;

use std::path::PathBuf;
use std::sync::Arc;

pub use crate::core::cancel::CancelToken;
pub use crate::core::config::{ExistingJobPolicy, JobsConfig};
pub use crate::core::errors::{ErrorKind, JobError, Result};
pub use crate::core::logging::init_logging;
pub use crate::exec::dispatch::{BackgroundHandle, RunOutcome};
pub use crate::exec::pipeline::ExecutionReport;
pub use crate::index::{IndexRecord, IndexStore, JobFilter, SqliteIndex};
pub use crate::jobs::job::Job;
pub use crate::jobs::master::{AggregatePolicy, ChildrenReport, MasterCoordinator, WaitOptions};
pub use crate::jobs::model::{
    Failure, FailureReason, JobId, RestartPolicy, RunMode, RunOptions, ServerConfig,
};
pub use crate::jobs::project::{Project, ProjectEntry, RepairReport};
pub use crate::jobs::registry::JobTypeRegistry;
pub use crate::jobs::runnable::{ExecutableJob, Runnable, ScriptJob};
pub use crate::jobs::status::JobStatus;
pub use crate::queue::{QueueAdapter, QueueLimits, QueueState, SubmitRequest};
pub use crate::storage::{HasGroups, RecordStore};

/// Process-wide context: configuration, index, record store, job types and
/// the optional queue adapter. Constructed once at startup and shared by `Arc`.
pub struct JobSystem {
    config: Arc<JobsConfig>,
    index: Arc<dyn IndexStore>,
    records: RecordStore,
    registry: JobTypeRegistry,
    queue: Option<Arc<dyn QueueAdapter>>,
}

impl JobSystem {
    pub fn builder() -> JobSystemBuilder {
        JobSystemBuilder::new()
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<dyn IndexStore> {
        &self.index
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn registry(&self) -> &JobTypeRegistry {
        &self.registry
    }

    pub fn queue(&self) -> Option<&Arc<dyn QueueAdapter>> {
        self.queue.as_ref()
    }

    /// Open (and create if needed) the project directory at `path`
    pub fn project(self: &Arc<Self>, path: impl Into<PathBuf>) -> Result<Project> {
        Project::open(Arc::clone(self), path.into())
    }

    /// Load any job by ID, wherever its project lives
    pub async fn load_job(self: &Arc<Self>, job_id: JobId) -> Result<Job> {
        Job::load_by_id(Arc::clone(self), job_id).await
    }
}

/// Builder for JobSystem
#[derive(Default)]
pub struct JobSystemBuilder {
    config: Option<JobsConfig>,
    index: Option<Arc<dyn IndexStore>>,
    registry: Option<JobTypeRegistry>,
    queue: Option<Arc<dyn QueueAdapter>>,
}

impl JobSystemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: JobsConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a custom index instead of connecting to `config.index_url`
    pub fn index(mut self, index: Arc<dyn IndexStore>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn registry(mut self, registry: JobTypeRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn queue_adapter(mut self, queue: Arc<dyn QueueAdapter>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub async fn build(self) -> Result<Arc<JobSystem>> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let index: Arc<dyn IndexStore> = match self.index {
            Some(index) => index,
            None => Arc::new(SqliteIndex::connect(&config).await?),
        };

        Ok(Arc::new(JobSystem {
            records: RecordStore::new(config.storage.clone()),
            config: Arc::new(config),
            index,
            registry: self.registry.unwrap_or_default(),
            queue: self.queue,
        }))
    }
}
