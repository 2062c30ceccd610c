//! Shared fixtures for the integration tests
#![allow(dead_code)]

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use jobrack::core::config::JobsConfigBuilder;
use jobrack::index::{IndexUpdate, NewIndexRecord};
use jobrack::queue::QueueState;
use jobrack::{
    IndexRecord, IndexStore, JobError, JobFilter, JobId, JobStatus, JobSystem, JobTypeRegistry, JobsConfig,
    Project, QueueAdapter, QueueLimits, Result, Runnable, ScriptJob, SqliteIndex, SubmitRequest,
};

pub struct TestEnv {
    pub dir: TempDir,
    pub system: Arc<JobSystem>,
    pub project: Project,
    pub queue: Arc<FakeQueue>,
    pub faults: Arc<FaultyIndex>,
}

/// Job types used across the tests
pub fn registry() -> JobTypeRegistry {
    let registry = JobTypeRegistry::new();
    registry
        .register("tests::toys", "Adder", || {
            Runnable::function(|input: &Map<String, Value>| -> anyhow::Result<Value> {
                let a = input.get("a").and_then(Value::as_i64).context("missing a")?;
                let b = input.get("b").and_then(Value::as_i64).context("missing b")?;
                Ok(json!(a + b))
            })
            .with_input_schema(json!({
                "type": "object",
                "required": ["a", "b"],
                "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}}
            }))
        }, false)
        .unwrap();
    registry
        .register("tests::toys", "Unconverged", || {
            Runnable::function(|_: &Map<String, Value>| -> anyhow::Result<Value> {
                Ok(json!({"energy": 1, "converged": false}))
            })
        }, false)
        .unwrap();
    registry
        .register("tests::scripts", "Failing", || {
            Runnable::executable(ScriptJob::new("echo boom >&2; exit 1"))
        }, false)
        .unwrap();
    registry
        .register("tests::scripts", "Energy", || {
            Runnable::executable(ScriptJob::new(
                "cat in.txt; printf '{\"energy\": -1.5, \"cores\": %s}' \"$JOBRACK_CORES\" > output.json",
            ))
            .with_default_input(json!({"files_to_create": {"in.txt": "structure\n"}}))
        }, false)
        .unwrap();
    registry
        .register("tests::scripts", "Sleeper", || {
            Runnable::executable(ScriptJob::new("sleep 30"))
        }, false)
        .unwrap();
    registry
        .register("tests::toys", "Master", Runnable::master, false)
        .unwrap();
    registry
}

pub fn config(dir: &Path) -> JobsConfig {
    JobsConfigBuilder::from_config(JobsConfig::development())
        .index_path(dir.join("index.db"))
        .index_max_connections(4)
        .queue_limits(
            "short",
            QueueLimits {
                cores_max: Some(4),
                run_time_max: Some(3600),
                ..Default::default()
            },
        )
        .default_queue("short")
        .build()
        .unwrap()
}

pub async fn setup() -> TestEnv {
    setup_with(registry(), |_| {}).await
}

pub async fn setup_with(registry: JobTypeRegistry, tweak: impl FnOnce(&mut JobsConfig)) -> TestEnv {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    tweak(&mut config);

    let faults = Arc::new(FaultyIndex::new(SqliteIndex::connect(&config).await.unwrap()));
    let queue = Arc::new(FakeQueue::default());
    let system = JobSystem::builder()
        .config(config)
        .registry(registry)
        .index(faults.clone())
        .queue_adapter(queue.clone())
        .build()
        .await
        .unwrap();
    let project = system.project(dir.path().join("project")).unwrap();
    TestEnv {
        dir,
        system,
        project,
        queue,
        faults,
    }
}

/// Poll the index until `job_id` reaches `status`
pub async fn wait_for_status(system: &JobSystem, job_id: JobId, status: JobStatus, timeout: Duration) {
    let started = Instant::now();
    loop {
        let row = system.index().get(job_id).await.unwrap().unwrap();
        if row.status == status {
            return;
        }
        assert!(
            started.elapsed() < timeout,
            "job {} stuck in {} while waiting for {}",
            job_id,
            row.status,
            status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Queue adapter that records submissions instead of talking to a scheduler
#[derive(Default)]
pub struct FakeQueue {
    pub submitted: Mutex<Vec<SubmitRequest>>,
    pub cancelled: Mutex<Vec<String>>,
    pub states: Mutex<HashMap<String, QueueState>>,
    pub fail_submit: AtomicBool,
}

#[async_trait]
impl QueueAdapter for FakeQueue {
    async fn submit(&self, request: &SubmitRequest) -> Result<String> {
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(JobError::queue("scheduler unreachable"));
        }
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(request.clone());
        let queue_id = format!("{}", 1000 + submitted.len());
        self.states
            .lock()
            .unwrap()
            .insert(queue_id.clone(), QueueState::Pending);
        Ok(queue_id)
    }

    async fn poll(&self, queue_id: &str) -> Result<QueueState> {
        self.states
            .lock()
            .unwrap()
            .get(queue_id)
            .copied()
            .ok_or_else(|| JobError::not_found(format!("queue job {}", queue_id)))
    }

    async fn cancel(&self, queue_id: &str) -> Result<()> {
        self.cancelled.lock().unwrap().push(queue_id.to_string());
        self.states
            .lock()
            .unwrap()
            .insert(queue_id.to_string(), QueueState::Failed);
        Ok(())
    }
}

/// Index wrapper that can fail status updates into a chosen status
pub struct FaultyIndex {
    inner: SqliteIndex,
    fail_updates_to: Mutex<Option<JobStatus>>,
}

impl FaultyIndex {
    pub fn new(inner: SqliteIndex) -> Self {
        Self {
            inner,
            fail_updates_to: Mutex::new(None),
        }
    }

    pub fn fail_updates_to(&self, status: Option<JobStatus>) {
        *self.fail_updates_to.lock().unwrap() = status;
    }
}

#[async_trait]
impl IndexStore for FaultyIndex {
    async fn insert_job(&self, record: &NewIndexRecord) -> Result<JobId> {
        self.inner.insert_job(record).await
    }

    async fn restore_job(&self, record: &IndexRecord) -> Result<()> {
        self.inner.restore_job(record).await
    }

    async fn get(&self, id: JobId) -> Result<Option<IndexRecord>> {
        self.inner.get(id).await
    }

    async fn find_by_name(&self, project: &Path, job_name: &str) -> Result<Option<IndexRecord>> {
        self.inner.find_by_name(project, job_name).await
    }

    async fn update_status(&self, id: JobId, old: JobStatus, new: JobStatus) -> Result<bool> {
        if *self.fail_updates_to.lock().unwrap() == Some(new) {
            return Err(JobError::internal(format!("injected index fault on {} -> {}", old, new)));
        }
        self.inner.update_status(id, old, new).await
    }

    async fn force_status(&self, id: JobId, status: JobStatus) -> Result<()> {
        self.inner.force_status(id, status).await
    }

    async fn claim(&self, id: JobId, expected: JobStatus, token: &str) -> Result<bool> {
        self.inner.claim(id, expected, token).await
    }

    async fn update(&self, id: JobId, update: &IndexUpdate) -> Result<()> {
        self.inner.update(id, update).await
    }

    async fn request_cancel(&self, id: JobId) -> Result<bool> {
        self.inner.request_cancel(id).await
    }

    async fn query(&self, filter: &JobFilter) -> Result<Vec<IndexRecord>> {
        self.inner.query(filter).await
    }

    async fn delete(&self, id: JobId) -> Result<bool> {
        self.inner.delete(id).await
    }
}
