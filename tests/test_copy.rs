//! Copying jobs and archiving their working directories

mod common;

use pretty_assertions::assert_eq;
use serde_json::json;

use common::{setup, setup_with};
use jobrack::{JobError, JobStatus, RunMode};

#[tokio::test]
async fn test_copy_without_output_is_a_fresh_job() {
    let env = setup().await;
    let mut job = env.project.create_job("toy", "Adder").await.unwrap();
    job.set_input("a", 2).unwrap();
    job.set_input("b", 3).unwrap();
    job.run().await.unwrap();

    let mut copy = job.copy_to("toy_copy", false).await.unwrap();
    assert_ne!(copy.job_id().unwrap(), job.job_id().unwrap());
    assert_eq!(copy.status(), JobStatus::Created);
    assert_eq!(copy.input()["a"], json!(2));
    assert!(matches!(copy.output_all().await, Err(JobError::NotFound(_))));
    assert_eq!(copy.index_record().await.unwrap().status, JobStatus::Created);

    copy.run().await.unwrap();
    assert_eq!(copy.output("result").await.unwrap(), json!(5));

    // The name is taken now
    let err = job.copy_to("toy_copy", false).await.unwrap_err();
    assert!(matches!(err, JobError::Conflict(_)));
}

#[tokio::test]
async fn test_copy_with_output_takes_the_results() {
    let env = setup().await;
    let mut job = env.project.create_job("toy", "Adder").await.unwrap();
    job.set_input("a", 2).unwrap();
    job.set_input("b", 3).unwrap();
    job.run().await.unwrap();

    let copy = job.copy_to("toy_done", true).await.unwrap();
    assert_eq!(copy.status(), JobStatus::Finished);
    assert_eq!(copy.output("result").await.unwrap(), json!(5));
    let row = copy.index_record().await.unwrap();
    assert_eq!(row.status, JobStatus::Finished);
    assert!(row.finished_at.is_some());
    assert_eq!(row.master_id, None);
}

#[tokio::test]
async fn test_copy_with_output_needs_an_ended_job() {
    let env = setup().await;
    let mut job = env.project.create_job("toy", "Adder").await.unwrap();
    job.set_input("a", 2).unwrap();
    job.set_input("b", 3).unwrap();
    job.server_mut().unwrap().run_mode = RunMode::Manual;
    job.run().await.unwrap();

    let err = job.copy_to("toy_copy", true).await.unwrap_err();
    assert!(matches!(err, JobError::Conflict(_)));
    assert!(env.project.load_by_name("toy_copy").await.is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn test_working_directory_compresses_and_decompresses() {
    let env = setup().await;
    let mut job = env.project.create_job("relax", "Energy").await.unwrap();
    job.run().await.unwrap();
    let wd = job.working_directory().to_path_buf();
    assert!(wd.join("in.txt").exists());

    let packed = job.compress().await.unwrap();
    assert!(packed >= 2);
    assert!(job.is_compressed());
    assert!(!wd.join("in.txt").exists());
    assert!(!wd.join("output.json").exists());

    // A copy with output carries the archive along
    let copy = job.copy_to("relax_copy", true).await.unwrap();
    assert!(copy.is_compressed());
    assert_eq!(copy.output("energy").await.unwrap(), json!(-1.5));

    assert_eq!(job.decompress().await.unwrap(), packed);
    assert!(!job.is_compressed());
    assert_eq!(std::fs::read_to_string(wd.join("in.txt")).unwrap(), "structure\n");
}

#[cfg(unix)]
#[tokio::test]
async fn test_finished_jobs_can_be_compressed_automatically() {
    let env = setup_with(common::registry(), |config| config.execution.compress_finished = true).await;
    let mut job = env.project.create_job("relax", "Energy").await.unwrap();
    job.run().await.unwrap();
    assert_eq!(job.status(), JobStatus::Finished);
    assert!(job.is_compressed());
    assert_eq!(job.output("energy").await.unwrap(), json!(-1.5));

    // Failed jobs keep their files for inspection
    let mut broken = env.project.create_job("broken", "Failing").await.unwrap();
    assert!(broken.run().await.is_err());
    assert!(!broken.is_compressed());
}

#[tokio::test]
async fn test_active_job_directory_is_left_alone() {
    let env = setup().await;
    let mut job = env.project.create_job("toy", "Adder").await.unwrap();
    job.set_input("a", 1).unwrap();
    job.set_input("b", 1).unwrap();
    job.server_mut().unwrap().run_mode = RunMode::Manual;
    job.run().await.unwrap();

    assert!(matches!(job.compress().await, Err(JobError::Conflict(_))));
    assert!(matches!(job.decompress().await, Err(JobError::Conflict(_))));
}
