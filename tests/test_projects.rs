//! Project surface: creation policy, listing, removal, index maintenance

mod common;

use pretty_assertions::assert_eq;
use std::time::Duration;

use common::{registry, setup, setup_with};
use jobrack::{
    ExistingJobPolicy, FailureReason, HasGroups, JobError, JobFilter, JobStatus, ProjectEntry, QueueState,
    RunMode, RunOutcome,
};

async fn saved_adder(project: &jobrack::Project, name: &str, a: i64, b: i64) -> jobrack::Job {
    let mut job = project.create_job(name, "Adder").await.unwrap();
    job.set_input("a", a).unwrap();
    job.set_input("b", b).unwrap();
    job.save().await.unwrap();
    job
}

#[tokio::test]
async fn test_duplicate_name_loads_the_existing_job() {
    let env = setup().await;
    let first = saved_adder(&env.project, "toy", 1, 2).await;

    let second = env.project.create_job("toy", "Adder").await.unwrap();
    assert_eq!(second.id(), first.id());
    assert_eq!(second.status(), JobStatus::Created);
    assert_eq!(second.input().get("a"), first.input().get("a"));

    let err = env.project.create_job("toy", "Failing").await.unwrap_err();
    assert!(matches!(err, JobError::Conflict(_)));

    let rows = env.project.job_table(JobFilter::default().name_like("toy")).await.unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn test_duplicate_name_with_error_policy_conflicts() {
    let env = setup_with(registry(), |config| {
        config.existing_job_policy = ExistingJobPolicy::Error;
    })
    .await;
    saved_adder(&env.project, "toy", 1, 2).await;

    let err = env.project.create_job("toy", "Adder").await.unwrap_err();
    assert!(matches!(err, JobError::Conflict(_)));
}

#[tokio::test]
async fn test_racing_unsaved_handles_never_get_two_ids() {
    let env = setup().await;
    let mut a = env.project.create_job("toy", "Adder").await.unwrap();
    let mut b = env.project.create_job("toy", "Adder").await.unwrap();
    for job in [&mut a, &mut b] {
        job.set_input("a", 1).unwrap();
        job.set_input("b", 1).unwrap();
    }

    a.save().await.unwrap();
    let err = b.save().await.unwrap_err();
    assert!(matches!(err, JobError::Conflict(_)));
    assert!(b.id().is_none());
}

#[tokio::test]
async fn test_job_table_filters() {
    let env = setup().await;
    let mut done = saved_adder(&env.project, "toy_a", 1, 1).await;
    done.run().await.unwrap();
    saved_adder(&env.project, "toy_b", 1, 1).await;
    saved_adder(&env.project, "other", 1, 1).await;
    let sub = env.project.subproject("sub").unwrap();
    saved_adder(&sub, "toy_c", 1, 1).await;

    let all = env.project.job_table(JobFilter::default()).await.unwrap();
    assert_eq!(all.len(), 3);

    let recursive = env
        .project
        .job_table(JobFilter::default().recursive(true))
        .await
        .unwrap();
    assert_eq!(recursive.len(), 4);

    let finished = env
        .project
        .job_table(JobFilter::default().status(JobStatus::Finished))
        .await
        .unwrap();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].job_name, "toy_a");

    let mut toys: Vec<String> = env
        .project
        .job_table(JobFilter::default().name_like("toy_*"))
        .await
        .unwrap()
        .into_iter()
        .map(|row| row.job_name)
        .collect();
    toys.sort();
    assert_eq!(toys, vec!["toy_a".to_string(), "toy_b".to_string()]);
}

#[tokio::test]
async fn test_remove_job_deletes_record_directory_and_row() {
    let env = setup().await;
    let mut job = env.project.create_job("relax", "Energy").await.unwrap();
    job.run().await.unwrap();
    let job_id = job.job_id().unwrap();
    assert!(job.working_directory().exists());

    env.project.remove_job(job_id).await.unwrap();
    assert!(!job.storage_path().exists());
    assert!(!job.working_directory().exists());
    assert!(env.system.index().get(job_id).await.unwrap().is_none());
    assert!(matches!(env.project.load(job_id).await, Err(JobError::NotFound(_))));

    // The name is free again
    let again = env.project.create_job("relax", "Energy").await.unwrap();
    assert!(again.id().is_none());
}

#[tokio::test]
async fn test_active_job_cannot_be_removed() {
    let env = setup().await;
    let mut job = env.project.create_job("relax", "Energy").await.unwrap();
    job.server_mut().unwrap().run_mode = RunMode::Manual;
    let job_id = match job.run().await.unwrap() {
        RunOutcome::Manual { job_id, .. } => job_id,
        other => panic!("unexpected outcome {:?}", other),
    };

    let err = env.project.remove_job(job_id).await.unwrap_err();
    assert!(matches!(err, JobError::Conflict(_)));
    assert!(job.storage_path().exists());
}

#[tokio::test]
async fn test_cancel_created_job_aborts_it() {
    let env = setup().await;
    let mut job = saved_adder(&env.project, "toy", 1, 2).await;
    let job_id = job.job_id().unwrap();

    assert_eq!(env.project.queue_status(job_id).await.unwrap(), None);
    let status = env.project.cancel_job(job_id).await.unwrap();
    assert_eq!(status, JobStatus::Aborted);
    let failure = job.failure().await.unwrap().unwrap();
    assert_eq!(failure.reason, FailureReason::Cancelled);

    match job.run().await.unwrap() {
        RunOutcome::AlreadyTerminal { status, .. } => assert_eq!(status, JobStatus::Aborted),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_queued_job_calls_the_adapter() {
    let env = setup().await;
    let mut job = env.project.create_job("toy", "Adder").await.unwrap();
    job.set_input("a", 1).unwrap();
    job.set_input("b", 2).unwrap();
    job.server_mut().unwrap().run_mode = RunMode::Queue;
    let queue_id = match job.run().await.unwrap() {
        RunOutcome::Queued { queue_id, .. } => queue_id,
        other => panic!("unexpected outcome {:?}", other),
    };

    let status = env.project.cancel_job(job.job_id().unwrap()).await.unwrap();
    assert_eq!(status, JobStatus::Aborted);
    assert_eq!(*env.queue.cancelled.lock().unwrap(), vec![queue_id]);
    let row = job.index_record().await.unwrap();
    assert!(row.cancel_requested);
    let job_id = job.job_id().unwrap();
    assert_eq!(env.project.queue_status(job_id).await.unwrap(), Some(QueueState::Failed));
}

#[tokio::test]
async fn test_wait_for_job_times_out() {
    let env = setup().await;
    let job = saved_adder(&env.project, "toy", 1, 2).await;

    let err = env
        .project
        .wait_for_job(job.job_id().unwrap(), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Timeout { .. }));
}

#[tokio::test]
async fn test_project_tree_partitions_jobs_and_subprojects() {
    let env = setup().await;
    let mut job = env.project.create_job("relax", "Energy").await.unwrap();
    job.run().await.unwrap();
    saved_adder(&env.project, "toy", 1, 2).await;
    let sub = env.project.subproject("sub").unwrap();
    saved_adder(&sub, "inner", 1, 2).await;

    assert_eq!(env.project.list_nodes().unwrap(), vec!["relax".to_string(), "toy".to_string()]);
    assert_eq!(env.project.list_groups().unwrap(), vec!["sub".to_string()]);

    match env.project.child("sub").unwrap() {
        ProjectEntry::Project(child) => {
            assert_eq!(child.list_nodes().unwrap(), vec!["inner".to_string()]);
            assert!(child.list_groups().unwrap().is_empty());
        }
        other => panic!("expected a sub-project, got {:?}", other),
    }
    match env.project.child("toy").unwrap() {
        ProjectEntry::Job(path) => assert!(path.ends_with("toy.jrk")),
        other => panic!("expected a job, got {:?}", other),
    }
    assert!(matches!(env.project.child("relax_files"), Err(JobError::NotFound(_))));
}

#[tokio::test]
async fn test_jobs_and_subprojects_never_share_a_name() {
    let env = setup().await;
    saved_adder(&env.project, "toy", 1, 2).await;

    assert!(matches!(env.project.subproject("toy"), Err(JobError::Conflict(_))));
    assert!(matches!(env.project.subproject("toy_files"), Err(JobError::Conflict(_))));
    assert!(matches!(env.project.subproject("toy.jrk"), Err(JobError::Conflict(_))));
    assert!(!env.project.path().join("toy").exists());

    env.project.subproject("sub").unwrap();
    let err = env.project.create_job("sub", "Adder").await.unwrap_err();
    assert!(matches!(err, JobError::Conflict(_)));

    // A handle made before the sub-project existed is caught on save
    let mut late = env.project.create_job("later", "Adder").await.unwrap();
    late.set_input("a", 1).unwrap();
    late.set_input("b", 1).unwrap();
    env.project.subproject("later").unwrap();
    assert!(matches!(late.save().await, Err(JobError::Conflict(_))));
    assert!(late.job_id().is_err());

    let nodes = env.project.list_nodes().unwrap();
    let groups = env.project.list_groups().unwrap();
    assert_eq!(nodes, vec!["toy".to_string()]);
    assert_eq!(groups, vec!["later".to_string(), "sub".to_string()]);
    assert!(nodes.iter().all(|n| !groups.contains(n)));
}

#[tokio::test]
async fn test_rebuild_index_restores_lost_rows_with_their_ids() {
    let env = setup().await;
    let mut job = saved_adder(&env.project, "toy", 3, 4).await;
    job.run().await.unwrap();
    let job_id = job.job_id().unwrap();
    let sub = env.project.subproject("sub").unwrap();
    let inner = saved_adder(&sub, "inner", 1, 2).await;
    let inner_id = inner.job_id().unwrap();

    env.system.index().delete(job_id).await.unwrap();
    env.system.index().delete(inner_id).await.unwrap();

    let mut restored = env.project.rebuild_index().await.unwrap();
    restored.sort();
    assert_eq!(restored, vec![job_id, inner_id]);

    let row = env.system.index().get(job_id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Finished);
    assert_eq!(row.job_name, "toy");
    assert_eq!(row.working_directory, job.working_directory());
    let reloaded = env.project.load(job_id).await.unwrap();
    assert_eq!(reloaded.output("result").await.unwrap(), serde_json::json!(7));

    // A second pass finds nothing to do
    assert!(env.project.rebuild_index().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_repair_drops_rows_without_records() {
    let env = setup().await;
    let job = saved_adder(&env.project, "toy", 1, 2).await;
    let job_id = job.job_id().unwrap();
    std::fs::remove_dir_all(job.storage_path()).unwrap();

    let report = env.project.repair_index().await.unwrap();
    assert_eq!(report.removed, vec![job_id]);
    assert!(env.system.index().get(job_id).await.unwrap().is_none());
}
