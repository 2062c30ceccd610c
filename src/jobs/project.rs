//! Projects: directories of jobs.
//!
//! A project is a plain directory holding job records (`<name>.<ext>`),
//! working directories (`<name>_files`) and sub-projects. It owns no job
//! handles; everything it knows about its jobs comes from the index and the
//! records on disk.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::core::config::ExistingJobPolicy;
use crate::core::errors::{JobError, Result};
use crate::exec::transition::JobContext;
use crate::index::{IndexRecord, IndexUpdate, JobFilter};
use crate::jobs::job::{layout, GenericRecord, Job};
use crate::jobs::model::{validate_job_name, Failure, JobId, JobIdentity};
use crate::jobs::status::JobStatus;
use crate::queue::QueueState;
use crate::storage::{validate_segment, HasGroups};
use crate::JobSystem;

#[derive(Clone)]
pub struct Project {
    system: Arc<JobSystem>,
    path: PathBuf,
}

impl fmt::Debug for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Project").field("path", &self.path).finish()
    }
}

/// What a project's child name resolves to
#[derive(Debug, Clone)]
pub enum ProjectEntry {
    /// Storage path of a job record
    Job(PathBuf),
    Project(Project),
}

/// Changes made by [`Project::repair_index`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// `(id, index status before, storage status)`
    pub updated: Vec<(JobId, JobStatus, JobStatus)>,
    /// Rows whose record no longer exists
    pub removed: Vec<JobId>,
    /// Records that could not be opened, usually locked by another process
    pub skipped: Vec<JobId>,
}

impl Project {
    /// Open the project directory, creating it if needed
    pub fn open(system: Arc<JobSystem>, path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&path)?;
        let path = std::fs::canonicalize(&path)?;
        Ok(Self { system, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    pub fn system(&self) -> &Arc<JobSystem> {
        &self.system
    }

    /// Open or create a sub-project. Names taken by a job record or by a
    /// job's working directory are rejected.
    pub fn subproject(&self, name: &str) -> Result<Project> {
        validate_segment(name)?;
        let suffix = format!(".{}", self.system.config().storage.extension);
        let jobs = self.record_names()?;
        let job = name
            .strip_suffix(&suffix)
            .or_else(|| name.strip_suffix("_files"))
            .filter(|job| jobs.iter().any(|j| j == job))
            .or_else(|| jobs.iter().any(|j| j == name).then_some(name));
        if name.ends_with(&suffix) || job.is_some() {
            return Err(JobError::conflict(format!(
                "'{}' in {} is reserved for job {}",
                name,
                self.path.display(),
                job.unwrap_or(name)
            )));
        }
        Project::open(Arc::clone(&self.system), self.path.join(name))
    }

    /// New job of a registered type. An existing job of the same name is
    /// loaded or rejected according to the configured policy.
    pub async fn create_job(&self, job_name: &str, job_type: &str) -> Result<Job> {
        validate_job_name(job_name)?;
        let class_name = job_type.rsplit("::").next().unwrap_or(job_type);

        if let Some(row) = self.system.index().find_by_name(&self.path, job_name).await? {
            return match self.system.config().existing_job_policy {
                ExistingJobPolicy::Error => Err(JobError::conflict(format!(
                    "job {} already exists in {} with id {}",
                    job_name,
                    self.path.display(),
                    row.id
                ))),
                ExistingJobPolicy::Load if row.job_type != class_name => Err(JobError::conflict(format!(
                    "job {} already exists as {}, not {}",
                    job_name, row.job_type, class_name
                ))),
                ExistingJobPolicy::Load => {
                    debug!(job_id = row.id, job_name, "Loading existing job");
                    Job::from_storage(Arc::clone(&self.system), &row.storage_path).await
                }
            };
        }

        if tokio::fs::metadata(self.path.join(job_name)).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(JobError::conflict(format!(
                "{} already holds a sub-project named {}",
                self.path.display(),
                job_name
            )));
        }
        Job::new(Arc::clone(&self.system), self.path.clone(), job_name, job_type)
    }

    pub async fn load(&self, job_id: JobId) -> Result<Job> {
        Job::load_by_id(Arc::clone(&self.system), job_id).await
    }

    pub async fn load_by_name(&self, job_name: &str) -> Result<Job> {
        let row = self
            .system
            .index()
            .find_by_name(&self.path, job_name)
            .await?
            .ok_or_else(|| {
                JobError::not_found(format!("job {} in {}", job_name, self.path.display()))
            })?;
        Job::from_storage(Arc::clone(&self.system), &row.storage_path).await
    }

    /// List jobs; a filter without a project is scoped to this one
    pub async fn job_table(&self, mut filter: JobFilter) -> Result<Vec<IndexRecord>> {
        if filter.project.is_none() {
            filter.project = Some(self.path.clone());
        }
        self.system.index().query(&filter).await
    }

    async fn indexed(&self, job_id: JobId) -> Result<IndexRecord> {
        self.system
            .index()
            .get(job_id)
            .await?
            .ok_or_else(|| JobError::not_found(format!("job {} in index", job_id)))
    }

    /// Delete a job: children first, then its record and working directory,
    /// then its index row. Active jobs must be cancelled first.
    pub async fn remove_job(&self, job_id: JobId) -> Result<()> {
        self.remove_tree(job_id).await
    }

    fn remove_tree(&self, job_id: JobId) -> BoxFuture<'_, Result<()>> {
        async move {
            let row = self.indexed(job_id).await?;
            if row.status.is_active() {
                return Err(JobError::conflict(format!(
                    "job {} is {}; cancel it before removing it",
                    row.job_name, row.status
                )));
            }

            for child in self.system.index().query(&JobFilter::children_of(job_id)).await? {
                self.remove_tree(child.id).await?;
            }

            let records = self.system.records();
            if records.exists(&row.storage_path) {
                records.remove(&row.storage_path).await?;
            }
            if tokio::fs::try_exists(&row.working_directory).await? {
                tokio::fs::remove_dir_all(&row.working_directory).await?;
            }
            self.system.index().delete(job_id).await?;
            info!(job_id, job_name = %row.job_name, "Removed job");
            Ok(())
        }
        .boxed()
    }

    pub async fn remove_job_by_name(&self, job_name: &str) -> Result<()> {
        let row = self
            .system
            .index()
            .find_by_name(&self.path, job_name)
            .await?
            .ok_or_else(|| {
                JobError::not_found(format!("job {} in {}", job_name, self.path.display()))
            })?;
        self.remove_job(row.id).await
    }

    /// Poll the index until the job ends. Fails with a timeout error when
    /// `timeout` elapses first.
    pub async fn wait_for_job(&self, job_id: JobId, timeout: Option<Duration>) -> Result<JobStatus> {
        let wait = &self.system.config().wait;
        let started = Instant::now();
        let mut interval = wait.initial_interval;
        loop {
            let row = self.indexed(job_id).await?;
            if row.status.is_terminal() {
                return Ok(row.status);
            }
            if let Some(timeout) = timeout {
                let waited = started.elapsed();
                if waited >= timeout {
                    return Err(JobError::Timeout {
                        operation: format!("job {} (currently {})", job_id, row.status),
                        waited,
                    });
                }
                interval = interval.min(timeout - waited);
            }
            tokio::time::sleep(interval).await;
            interval = wait.next_interval(interval);
        }
    }

    /// Request cancellation. Jobs that nobody executes yet are aborted right
    /// away; a running process notices the flag at its next check and aborts
    /// itself. Returns the job's status after the request.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<JobStatus> {
        let row = self.indexed(job_id).await?;
        if row.status.is_terminal() {
            return Ok(row.status);
        }

        self.system.index().request_cancel(job_id).await?;
        if let Some(queue_id) = &row.queue_id {
            self.cancel_in_queue(job_id, queue_id).await;
        }

        let abort_now = match row.status {
            JobStatus::Initialized | JobStatus::Created | JobStatus::Suspended => true,
            JobStatus::Submitted => row.queue_id.is_some(),
            _ => false,
        };
        if !abort_now {
            info!(job_id, status = %row.status, "Cancellation requested");
            return Ok(row.status);
        }

        let ctx = JobContext::open(Arc::clone(&self.system), job_id, &row.job_name, &row.storage_path).await?;
        ctx.abort(&Failure::cancelled()).await
    }

    /// Park a job that has not ended for later resumption with `run`
    pub async fn suspend_job(&self, job_id: JobId) -> Result<JobStatus> {
        let row = self.indexed(job_id).await?;
        if !matches!(
            row.status,
            JobStatus::Created | JobStatus::Submitted | JobStatus::Running
        ) {
            return Err(JobError::conflict(format!(
                "job {} is {} and cannot be suspended",
                row.job_name, row.status
            )));
        }
        if let Some(queue_id) = &row.queue_id {
            self.cancel_in_queue(job_id, queue_id).await;
            self.system
                .index()
                .update(job_id, &IndexUpdate::default().queue_id(None))
                .await?;
        }

        let ctx = JobContext::open(Arc::clone(&self.system), job_id, &row.job_name, &row.storage_path).await?;
        let stored = ctx.stored_status()?;
        ctx.transition(stored, JobStatus::Suspended).await?;
        Ok(JobStatus::Suspended)
    }

    async fn cancel_in_queue(&self, job_id: JobId, queue_id: &str) {
        match self.system.queue() {
            Some(adapter) => {
                if let Err(e) = adapter.cancel(queue_id).await {
                    warn!(job_id, queue_id, "Queue cancel failed: {}", e);
                }
            }
            None => warn!(job_id, queue_id, "Job is queued but no queue adapter is configured"),
        }
    }

    /// What the queuing system reports for a queued job; `None` when the job
    /// was never submitted to a queue
    pub async fn queue_status(&self, job_id: JobId) -> Result<Option<QueueState>> {
        let row = self.indexed(job_id).await?;
        let Some(queue_id) = row.queue_id else {
            return Ok(None);
        };
        let adapter = self.system.queue().ok_or_else(|| {
            JobError::configuration(format!(
                "job {} is queued as {} but no queue adapter is configured",
                job_id, queue_id
            ))
        })?;
        let state = adapter.poll(&queue_id).await?;
        debug!(job_id, queue_id = %queue_id, ?state, "Polled queue");
        Ok(Some(state))
    }

    /// Bring every index row of this project tree in line with its record.
    /// Storage wins; rows without a record are dropped.
    pub async fn repair_index(&self) -> Result<RepairReport> {
        let index = self.system.index();
        let records = self.system.records();
        let mut report = RepairReport::default();

        for row in index.query(&JobFilter::project(&self.path).recursive(true)).await? {
            if !records.exists(&row.storage_path) {
                warn!(job_id = row.id, path = %row.storage_path.display(), "Record is gone, dropping index row");
                index.delete(row.id).await?;
                report.removed.push(row.id);
                continue;
            }
            let record = match records.open(&row.storage_path).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(job_id = row.id, "Cannot open record, skipping: {}", e);
                    report.skipped.push(row.id);
                    continue;
                }
            };
            let stored: JobStatus = record.read_as(layout::STATUS)?;
            if stored == row.status {
                continue;
            }

            index.force_status(row.id, stored).await?;
            if stored == JobStatus::Aborted {
                if let Some(value) = record.read_opt(layout::FAILURE)? {
                    let failure: Failure = serde_json::from_value(value)?;
                    index
                        .update(row.id, &IndexUpdate::default().reason(Some(failure.summary())))
                        .await?;
                }
            }
            warn!(job_id = row.id, from = %row.status, to = %stored, "Repaired index status");
            report.updated.push((row.id, row.status, stored));
        }
        Ok(report)
    }

    /// Re-create index rows for records on disk that the index lost, keeping
    /// their stored IDs. Returns the restored IDs.
    pub async fn rebuild_index(&self) -> Result<Vec<JobId>> {
        let index = self.system.index();
        let extension = self.system.config().storage.extension.clone();
        let mut restored = Vec::new();

        for storage_path in find_records(&self.path, &extension)? {
            let generic: GenericRecord = match self.system.records().open(&storage_path).await {
                Ok(record) => record.read_as(layout::GENERIC)?,
                Err(e) => {
                    warn!(path = %storage_path.display(), "Cannot open record, skipping: {}", e);
                    continue;
                }
            };
            if index.get(generic.job_id).await?.is_some() {
                continue;
            }
            let project = storage_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.path.clone());
            if let Some(other) = index.find_by_name(&project, &generic.job_name).await? {
                warn!(job_id = generic.job_id, other = other.id, job_name = %generic.job_name, "Name is indexed under another ID, skipping");
                continue;
            }

            let identity = JobIdentity::new(project.clone(), &generic.job_name, &generic.job_type, &extension)?;
            let now = Utc::now();
            let row = IndexRecord {
                id: generic.job_id,
                project,
                job_name: generic.job_name,
                job_type: generic.job_type,
                status: generic.status,
                working_directory: identity.working_directory,
                storage_path,
                master_id: generic.master_id,
                queue_id: generic.server.queue_id,
                reason: generic.failure.map(|f| f.summary()),
                cancel_requested: false,
                claim_token: None,
                created_at: now,
                updated_at: now,
                started_at: None,
                finished_at: None,
            };
            index.restore_job(&row).await?;
            info!(job_id = row.id, job_name = %row.job_name, "Restored index row");
            restored.push(row.id);
        }
        Ok(restored)
    }

    fn record_names(&self) -> Result<Vec<String>> {
        let suffix = format!(".{}", self.system.config().storage.extension);
        let mut names: Vec<String> = subdirectories(&self.path)?
            .into_iter()
            .filter_map(|name| name.strip_suffix(&suffix).map(str::to_string))
            .filter(|name| !name.is_empty())
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Nodes are the job records in this directory, groups its sub-projects.
impl HasGroups for Project {
    type Child = ProjectEntry;

    fn list_nodes(&self) -> Result<Vec<String>> {
        self.record_names()
    }

    fn list_groups(&self) -> Result<Vec<String>> {
        let suffix = format!(".{}", self.system.config().storage.extension);
        let jobs = self.record_names()?;
        let mut groups: Vec<String> = subdirectories(&self.path)?
            .into_iter()
            .filter(|name| !name.ends_with(&suffix))
            .filter(|name| {
                name.strip_suffix("_files")
                    .map(|job| !jobs.iter().any(|j| j == job))
                    .unwrap_or(true)
            })
            .collect();
        groups.sort();
        Ok(groups)
    }

    fn child(&self, name: &str) -> Result<ProjectEntry> {
        if self.record_names()?.iter().any(|n| n == name) {
            let extension = &self.system.config().storage.extension;
            return Ok(ProjectEntry::Job(self.path.join(format!("{}.{}", name, extension))));
        }
        if self.list_groups()?.iter().any(|n| n == name) {
            return Ok(ProjectEntry::Project(Project {
                system: Arc::clone(&self.system),
                path: self.path.join(name),
            }));
        }
        Err(JobError::not_found(format!(
            "no job or sub-project '{}' in {}",
            name,
            self.path.display()
        )))
    }
}

fn subdirectories(path: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

/// Record directories below `root`, not descending into records or working
/// directories
fn find_records(root: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let suffix = format!(".{}", extension);
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for name in subdirectories(&dir)? {
            let path = dir.join(&name);
            if name.ends_with(&suffix) {
                found.push(path);
            } else if !name.ends_with("_files") {
                pending.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_find_records_skips_working_directories() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("toy.jrk")).unwrap();
        std::fs::create_dir_all(root.join("toy_files/inner.jrk")).unwrap();
        std::fs::create_dir_all(root.join("sub/deep.jrk")).unwrap();
        std::fs::write(root.join("notes.jrk"), "a file, not a record").unwrap();

        let found = find_records(root, "jrk").unwrap();
        assert_eq!(found, vec![root.join("sub/deep.jrk"), root.join("toy.jrk")]);
    }
}
