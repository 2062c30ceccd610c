use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::errors::{JobError, Result};
use crate::exec::dispatch::{self, RunOutcome};
use crate::index::{IndexRecord, NewIndexRecord};
use crate::jobs::archive;
use crate::jobs::model::{Failure, JobId, JobIdentity, RunOptions, ServerConfig};
use crate::jobs::project::Project;
use crate::jobs::runnable::Runnable;
use crate::jobs::status::JobStatus;
use crate::storage::{join_path, RecordHandle};
use crate::JobSystem;

/// Paths of the job record
pub mod layout {
    pub const GENERIC: &str = "generic";
    pub const STATUS: &str = "generic/status";
    pub const FAILURE: &str = "generic/failure";
    pub const SERVER: &str = "generic/server";
    pub const MASTER_ID: &str = "generic/master_id";
    pub const INPUT: &str = "input";
    pub const OUTPUT: &str = "output";
}

/// Bookkeeping stored under `generic`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericRecord {
    pub job_id: JobId,
    pub job_name: String,
    /// Registry class name
    pub job_type: String,
    /// `module_path::ClassName` at creation time
    pub type_path: String,
    pub version: String,
    pub status: JobStatus,
    pub server: ServerConfig,
    pub master_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

/// A job bound to its project, its record and the job system.
///
/// The handle is a snapshot: `status()` reflects the last operation performed
/// through this handle, `refresh()` re-reads the record.
#[derive(Clone)]
pub struct Job {
    identity: JobIdentity,
    status: JobStatus,
    server: ServerConfig,
    input: Map<String, Value>,
    master_id: Option<JobId>,
    runnable: Arc<Runnable>,
    system: Arc<JobSystem>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("identity", &self.identity)
            .field("status", &self.status)
            .field("server", &self.server)
            .finish()
    }
}

impl Job {
    /// Fresh, unsaved job of a registered type
    pub(crate) fn new(system: Arc<JobSystem>, project: PathBuf, job_name: &str, job_type: &str) -> Result<Self> {
        let runnable = system.registry().lookup(job_type)?;
        let class_name = job_type.rsplit("::").next().unwrap_or(job_type);
        let identity = JobIdentity::new(
            project,
            job_name,
            class_name,
            &system.config().storage.extension,
        )?;
        Ok(Self {
            identity,
            status: JobStatus::Initialized,
            server: system.config().server.to_server_config(),
            input: runnable.default_input.clone(),
            master_id: None,
            runnable,
            system,
        })
    }

    /// Reload a job from its record
    pub async fn from_storage(system: Arc<JobSystem>, storage_path: &Path) -> Result<Self> {
        let record = system.records().open(storage_path).await?;
        let generic: GenericRecord = record.read_as(layout::GENERIC)?;
        let input = match record.read_opt(layout::INPUT)? {
            Some(Value::Object(map)) => map,
            Some(_) | None => Map::new(),
        };
        drop(record);

        let runnable = system.registry().lookup(&generic.job_type)?;
        let project = storage_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let mut identity = JobIdentity::new(
            project,
            &generic.job_name,
            &generic.job_type,
            &system.config().storage.extension,
        )?;
        identity.job_id = Some(generic.job_id);
        identity.storage_path = storage_path.to_path_buf();

        debug!(job_id = generic.job_id, job_name = %generic.job_name, status = %generic.status, "Loaded job");
        Ok(Self {
            identity,
            status: generic.status,
            server: generic.server,
            input,
            master_id: generic.master_id,
            runnable,
            system,
        })
    }

    pub async fn load_by_id(system: Arc<JobSystem>, job_id: JobId) -> Result<Self> {
        let row = system
            .index()
            .get(job_id)
            .await?
            .ok_or_else(|| JobError::not_found(format!("job {} in index", job_id)))?;
        Self::from_storage(system, &row.storage_path).await
    }

    pub fn id(&self) -> Option<JobId> {
        self.identity.job_id
    }

    /// ID of a saved job
    pub fn job_id(&self) -> Result<JobId> {
        self.identity
            .job_id
            .ok_or_else(|| JobError::not_found(format!("job '{}' has not been saved", self.identity.job_name)))
    }

    pub fn name(&self) -> &str {
        &self.identity.job_name
    }

    pub fn job_type(&self) -> &str {
        &self.identity.job_type
    }

    pub fn identity(&self) -> &JobIdentity {
        &self.identity
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn working_directory(&self) -> &Path {
        &self.identity.working_directory
    }

    pub fn storage_path(&self) -> &Path {
        &self.identity.storage_path
    }

    pub fn project_path(&self) -> &Path {
        &self.identity.project
    }

    pub fn project(&self) -> Result<Project> {
        Project::open(Arc::clone(&self.system), self.identity.project.clone())
    }

    pub fn server(&self) -> &ServerConfig {
        &self.server
    }

    pub fn input(&self) -> &Map<String, Value> {
        &self.input
    }

    pub fn master_id(&self) -> Option<JobId> {
        self.master_id
    }

    pub fn runnable(&self) -> &Arc<Runnable> {
        &self.runnable
    }

    pub fn system(&self) -> &Arc<JobSystem> {
        &self.system
    }

    /// Input and server settings may only change before execution starts
    pub fn is_editable(&self) -> bool {
        matches!(self.status, JobStatus::Initialized | JobStatus::Created)
    }

    fn ensure_editable(&self) -> Result<()> {
        if self.is_editable() {
            Ok(())
        } else {
            Err(JobError::conflict(format!(
                "job {} is {}; its input is locked",
                self.identity.label(),
                self.status
            )))
        }
    }

    pub fn input_mut(&mut self) -> Result<&mut Map<String, Value>> {
        self.ensure_editable()?;
        Ok(&mut self.input)
    }

    pub fn set_input<T: Serialize>(&mut self, key: &str, value: T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.input_mut()?.insert(key.to_string(), value);
        Ok(())
    }

    pub fn server_mut(&mut self) -> Result<&mut ServerConfig> {
        self.ensure_editable()?;
        Ok(&mut self.server)
    }

    /// Unsaved job under `job_name` with this job's type, input, server
    /// settings and master
    pub(crate) fn respawn(&self, job_name: &str) -> Result<Job> {
        let identity = JobIdentity::new(
            self.identity.project.clone(),
            job_name,
            &self.identity.job_type,
            &self.system.config().storage.extension,
        )?;
        let mut server = self.server.clone();
        server.queue_id = None;
        Ok(Job {
            identity,
            status: JobStatus::Initialized,
            server,
            input: self.input.clone(),
            master_id: self.master_id,
            runnable: Arc::clone(&self.runnable),
            system: Arc::clone(&self.system),
        })
    }

    pub(crate) fn set_status(&mut self, status: JobStatus) {
        self.status = status;
    }

    pub(crate) fn set_master_id(&mut self, master_id: Option<JobId>) {
        self.master_id = master_id;
    }

    pub(crate) fn set_queue_id(&mut self, queue_id: Option<String>) {
        self.server.queue_id = queue_id;
    }

    /// Open the job's record
    pub async fn record(&self) -> Result<RecordHandle> {
        self.system.records().open(&self.identity.storage_path).await
    }

    /// Persist the job. The first save allocates the ID, writes the record and
    /// moves the job to `created`; later saves rewrite input and server
    /// settings while the job is still editable.
    pub async fn save(&mut self) -> Result<JobId> {
        self.runnable.validate_input(&self.identity.job_name, &self.input)?;
        self.server.validate()?;

        if let Some(id) = self.identity.job_id {
            let record = self.record().await?;
            let stored: JobStatus = record.read_as(layout::STATUS)?;
            if !matches!(stored, JobStatus::Initialized | JobStatus::Created) {
                debug!(job_id = id, status = %stored, "Job is past created, not rewriting its input");
                self.status = stored;
                return Ok(id);
            }
            let input = Value::Object(self.input.clone());
            record.with_scoped("", |scope| {
                scope.write(layout::INPUT, &input)?;
                scope.write_as(layout::SERVER, &self.server)?;
                scope.write_as(layout::MASTER_ID, &self.master_id)
            })?;
            record.sync().await?;
            return Ok(id);
        }

        let group = self.identity.project.join(&self.identity.job_name);
        if tokio::fs::metadata(&group).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(JobError::conflict(format!(
                "{} is a sub-project, not a free job name",
                group.display()
            )));
        }

        let storage_path = self.identity.storage_path.clone();
        if self.system.records().exists(&storage_path) {
            return Err(JobError::conflict(format!(
                "job record {} exists but is not indexed; rebuild the index",
                storage_path.display()
            )));
        }

        let index = self.system.index();
        let id = index
            .insert_job(&NewIndexRecord {
                project: self.identity.project.clone(),
                job_name: self.identity.job_name.clone(),
                job_type: self.identity.job_type.clone(),
                status: JobStatus::Initialized,
                working_directory: self.identity.working_directory.clone(),
                storage_path: storage_path.clone(),
                master_id: self.master_id,
            })
            .await?;

        if let Err(e) = self.write_new_record(id).await {
            warn!(job_id = id, job_name = %self.identity.job_name, "Failed to write job record, rolling back: {}", e);
            if let Err(undo) = index.delete(id).await {
                warn!(job_id = id, "Failed to remove index row after failed save: {}", undo);
            }
            if let Err(undo) = self.system.records().remove(&storage_path).await {
                warn!(job_id = id, "Failed to remove partial job record: {}", undo);
            }
            return Err(e);
        }

        self.identity.job_id = Some(id);
        self.status = JobStatus::Created;
        if !index
            .update_status(id, JobStatus::Initialized, JobStatus::Created)
            .await?
        {
            warn!(job_id = id, "Index row changed while saving; leaving it for repair");
        }
        info!(job_id = id, job_name = %self.identity.job_name, job_type = %self.identity.job_type, "Created job");
        Ok(id)
    }

    async fn write_new_record(&self, id: JobId) -> Result<()> {
        let type_path = self.system.registry().qualified_name(&self.identity.job_type)?;
        let record = self
            .system
            .records()
            .create(
                &self.identity.storage_path,
                &type_path,
                &self.identity.job_name,
                &self.runnable.version,
            )
            .await?;
        let generic = GenericRecord {
            job_id: id,
            job_name: self.identity.job_name.clone(),
            job_type: self.identity.job_type.clone(),
            type_path,
            version: self.runnable.version.clone(),
            status: JobStatus::Created,
            server: self.server.clone(),
            master_id: self.master_id,
            failure: None,
        };
        let input = Value::Object(self.input.clone());
        record.with_scoped("", |scope| {
            scope.write_as(layout::GENERIC, &generic)?;
            scope.write(layout::INPUT, &input)
        })?;
        record.flush().await
    }

    /// Re-read the status from the record, which is authoritative
    pub async fn refresh(&mut self) -> Result<JobStatus> {
        let record = self.record().await?;
        self.status = record.read_as(layout::STATUS)?;
        self.server = record.read_as(layout::SERVER)?;
        self.master_id = record.read_as(layout::MASTER_ID)?;
        Ok(self.status)
    }

    /// The job's index row
    pub async fn index_record(&self) -> Result<IndexRecord> {
        let id = self.job_id()?;
        self.system
            .index()
            .get(id)
            .await?
            .ok_or_else(|| JobError::not_found(format!("job {} in index", id)))
    }

    /// Read one entry of the output without loading the rest
    pub async fn output(&self, path: &str) -> Result<Value> {
        let record = self.record().await?;
        record.read(&join_path(layout::OUTPUT, path.trim_matches('/')))
    }

    /// The complete output; not found until the job committed it
    pub async fn output_all(&self) -> Result<Value> {
        self.record().await?.read(layout::OUTPUT)
    }

    /// Diagnostics of an aborted job
    pub async fn failure(&self) -> Result<Option<Failure>> {
        let record = self.record().await?;
        match record.read_opt(layout::FAILURE)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Copy this job under `new_name` in the same project. The copy has its
    /// own ID and no master. Without output it starts `created` with this
    /// job's input and server settings; with output the source must have
    /// ended successfully, and the copy takes its output, working directory
    /// and final status.
    pub async fn copy_to(&self, new_name: &str, with_output: bool) -> Result<Job> {
        let source_id = self.job_id()?;
        let record = self.record().await?;
        let stored: JobStatus = record.read_as(layout::STATUS)?;
        let output = if with_output {
            if !stored.is_success() {
                return Err(JobError::conflict(format!(
                    "job {} is {}; only successfully ended jobs are copied with output",
                    self.identity.label(),
                    stored
                )));
            }
            Some(record.read(layout::OUTPUT)?)
        } else {
            None
        };
        drop(record);

        let mut copy = self.respawn(new_name)?;
        copy.master_id = None;
        let copy_id = copy.save().await?;

        if let Some(output) = output {
            let from = self.identity.working_directory.clone();
            let to = copy.identity.working_directory.clone();
            if tokio::fs::try_exists(&from).await? {
                tokio::task::spawn_blocking(move || archive::copy_tree(&from, &to))
                    .await
                    .map_err(|e| JobError::internal(format!("copy task failed: {}", e)))??;
            }

            let copied = copy.record().await?;
            copied.with_scoped("", |scope| {
                scope.write(layout::OUTPUT, &output)?;
                scope.write_as(layout::STATUS, &stored)
            })?;
            copied.flush().await?;
            self.system.index().force_status(copy_id, stored).await?;
            copy.status = stored;
        }

        info!(job_id = copy_id, source_id, job_name = %new_name, with_output, "Copied job");
        Ok(copy)
    }

    /// Pack the working directory into one zstd archive. Returns the number
    /// of files packed.
    pub async fn compress(&self) -> Result<usize> {
        self.ensure_idle("compress").await?;
        let dir = self.identity.working_directory.clone();
        let level = self.system.config().storage.compression_level;
        let packed = tokio::task::spawn_blocking(move || archive::pack(&dir, level))
            .await
            .map_err(|e| JobError::internal(format!("archive task failed: {}", e)))??;
        if packed > 0 {
            info!(job_name = %self.identity.job_name, files = packed, "Compressed working directory");
        }
        Ok(packed)
    }

    /// Restore a working directory packed by [`Job::compress`]
    pub async fn decompress(&self) -> Result<usize> {
        self.ensure_idle("decompress").await?;
        let dir = self.identity.working_directory.clone();
        let restored = tokio::task::spawn_blocking(move || archive::unpack(&dir))
            .await
            .map_err(|e| JobError::internal(format!("archive task failed: {}", e)))??;
        if restored > 0 {
            info!(job_name = %self.identity.job_name, files = restored, "Decompressed working directory");
        }
        Ok(restored)
    }

    pub fn is_compressed(&self) -> bool {
        archive::is_packed(&self.identity.working_directory)
    }

    async fn ensure_idle(&self, action: &str) -> Result<()> {
        let stored: JobStatus = self.record().await?.read_as(layout::STATUS)?;
        if stored.is_active() {
            return Err(JobError::conflict(format!(
                "job {} is {}; cannot {} its working directory",
                self.identity.label(),
                stored,
                action
            )));
        }
        Ok(())
    }

    /// Run with the default options
    pub async fn run(&mut self) -> Result<RunOutcome> {
        self.run_with(RunOptions::default()).await
    }

    pub async fn run_with(&mut self, options: RunOptions) -> Result<RunOutcome> {
        dispatch::run(self, options).await
    }
}
