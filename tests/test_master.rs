//! Master jobs: children, aggregation policies and waiting

mod common;

use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;

use common::{setup, TestEnv};
use jobrack::exec::wrapper;
use jobrack::{
    AggregatePolicy, CancelToken, FailureReason, Job, JobError, JobId, JobStatus, MasterCoordinator,
    RestartPolicy, RunMode, RunOptions, RunOutcome, WaitOptions,
};

async fn master(env: &TestEnv, name: &str, policy: AggregatePolicy) -> Job {
    let mut master = env.project.create_job(name, "Master").await.unwrap();
    MasterCoordinator::set_policy(&mut master, policy).unwrap();
    master.save().await.unwrap();
    master
}

async fn add_adder(env: &TestEnv, master: &Job, name: &str, a: i64, b: i64) -> JobId {
    let mut child = env.project.create_job(name, "Adder").await.unwrap();
    child.set_input("a", a).unwrap();
    child.set_input("b", b).unwrap();
    MasterCoordinator::new(env.system.clone())
        .add_child(master, &mut child)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_master_finishes_when_all_children_finish() {
    let env = setup().await;
    let mut master = master(&env, "scan", AggregatePolicy::CollectAll).await;
    let first = add_adder(&env, &master, "scan_0", 1, 1).await;
    let second = add_adder(&env, &master, "scan_1", 2, 2).await;

    match master.run().await.unwrap() {
        RunOutcome::Master { status, .. } => assert_eq!(status, JobStatus::Finished),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(master.refresh().await.unwrap(), JobStatus::Finished);

    let output = master.output_all().await.unwrap();
    assert_eq!(output["children"], json!({"scan_0": "finished", "scan_1": "finished"}));
    let mut finished: Vec<JobId> = serde_json::from_value(output["finished"].clone()).unwrap();
    finished.sort();
    assert_eq!(finished, vec![first, second]);

    let child = env.project.load(second).await.unwrap();
    assert_eq!(child.output("result").await.unwrap(), json!(4));
    assert_eq!(child.master_id(), Some(master.job_id().unwrap()));
}

#[tokio::test]
async fn test_fail_fast_master_aborts_on_a_failed_child() {
    let env = setup().await;
    let mut master = master(&env, "scan", AggregatePolicy::FailFast).await;
    add_adder(&env, &master, "scan_0", 1, 1).await;
    let mut broken = env.project.create_job("scan_broken", "Failing").await.unwrap();
    MasterCoordinator::new(env.system.clone())
        .add_child(&master, &mut broken)
        .await
        .unwrap();

    match master.run().await.unwrap() {
        RunOutcome::Master { status, .. } => assert_eq!(status, JobStatus::Aborted),
        other => panic!("unexpected outcome {:?}", other),
    }
    let failure = master.failure().await.unwrap().unwrap();
    assert_eq!(failure.reason, FailureReason::ChildrenFailed);
    assert_eq!(master.index_record().await.unwrap().status, JobStatus::Aborted);
}

#[tokio::test]
async fn test_collect_all_master_reports_failed_children() {
    let env = setup().await;
    let mut master = master(&env, "scan", AggregatePolicy::CollectAll).await;
    add_adder(&env, &master, "scan_0", 1, 1).await;
    let mut broken = env.project.create_job("scan_broken", "Failing").await.unwrap();
    let broken_id = MasterCoordinator::new(env.system.clone())
        .add_child(&master, &mut broken)
        .await
        .unwrap();

    master.run().await.unwrap();
    assert_eq!(master.status(), JobStatus::NotConverged);
    let output = master.output_all().await.unwrap();
    assert_eq!(output["aborted"], json!([broken_id]));
    assert_eq!(output["children"]["scan_broken"], json!("aborted"));
    assert!(master.failure().await.unwrap().is_none());
}

#[tokio::test]
async fn test_non_modal_master_follows_children_run_elsewhere() {
    let env = setup().await;
    let mut master = env.project.create_job("scan", "Master").await.unwrap();
    master.server_mut().unwrap().run_mode = RunMode::NonModal;
    let master_id = master.save().await.unwrap();

    let mut child = env.project.create_job("scan_0", "Adder").await.unwrap();
    child.set_input("a", 3).unwrap();
    child.set_input("b", 4).unwrap();
    child.server_mut().unwrap().run_mode = RunMode::Manual;
    let coordinator = MasterCoordinator::new(env.system.clone());
    let child_id = coordinator.add_child(&master, &mut child).await.unwrap();

    match master.run().await.unwrap() {
        RunOutcome::Master { status, .. } => assert_eq!(status, JobStatus::Running),
        other => panic!("unexpected outcome {:?}", other),
    }

    let report = coordinator
        .wait_for_children(
            master_id,
            WaitOptions::timeout(Duration::from_millis(100)),
            &CancelToken::new(),
        )
        .await
        .unwrap();
    assert!(report.timed_out);
    assert_eq!(report.pending, vec![child_id]);
    assert_eq!(report.total(), 1);

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = coordinator
        .wait_for_children(master_id, WaitOptions::default(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Cancelled(_)));

    // The child runs somewhere else and pulls the master along
    let child_report = wrapper::run_job_by_id(env.system.clone(), child_id).await.unwrap();
    assert_eq!(child_report.status, JobStatus::Finished);
    assert_eq!(master.refresh().await.unwrap(), JobStatus::Finished);

    let report = coordinator
        .wait_for_children(master_id, WaitOptions::default(), &CancelToken::new())
        .await
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.finished, vec![child_id]);
}

#[tokio::test]
async fn test_children_are_listed_and_guarded() {
    let env = setup().await;
    let master = master(&env, "scan", AggregatePolicy::CollectAll).await;
    let master_id = master.job_id().unwrap();
    let child_id = add_adder(&env, &master, "scan_0", 1, 1).await;
    let coordinator = MasterCoordinator::new(env.system.clone());

    let children = coordinator.children(master_id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].id, child_id);
    assert_eq!(children[0].master_id, Some(master_id));
    assert_eq!(
        coordinator.aggregate(master_id, AggregatePolicy::FailFast).await.unwrap(),
        JobStatus::Running
    );

    // Only masters take children
    let plain = env.project.load(child_id).await.unwrap();
    let mut other = env.project.create_job("other", "Adder").await.unwrap();
    let err = coordinator.add_child(&plain, &mut other).await.unwrap_err();
    assert!(matches!(err, JobError::Configuration(_)));

    // Masters are not restarted; their children are
    let mut master = master;
    master.run().await.unwrap();
    assert_eq!(master.status(), JobStatus::Finished);
    let err = master
        .run_with(RunOptions::restart(RestartPolicy::InPlace))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Conflict(_)));
}
