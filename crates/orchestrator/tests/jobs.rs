//! Stored job lifecycle: submit, progress, stop and listing.

mod support;

use arca_common::{
    ArcaError, Job, JobFilter, JobRequest, JobSort, JobStatus, JobStore, ObjectKind,
    ObjectSelector, OrchestratorMethod, Sublist, TransferredResource,
};
use arca_orchestrator::Orchestrator;
use arca_storage::{MemoryJobStore, MemoryRepository, SqliteJobStore};
use std::sync::Arc;
use std::time::Duration;
use support::{config, Action, Behavior, Harness, SCRIPTED};

async fn wait_for_terminal(orchestrator: &Orchestrator, job_id: &str) -> Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job = orchestrator.retrieve_job(job_id).await.unwrap();
        if job.status.is_terminal() {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} still {} after 10s",
            job.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn seed(repository: &MemoryRepository, prefix: &str, n: usize) -> Vec<String> {
    (0..n)
        .map(|i| {
            let id = format!("{prefix}{i}");
            repository.insert_transferred_resource(TransferredResource::new(id.clone(), "x.zip"));
            id
        })
        .collect()
}

fn request_for(ids: Vec<String>) -> JobRequest {
    JobRequest::new(
        SCRIPTED,
        OrchestratorMethod::RunPluginOnTransferredResources,
        ObjectSelector::ids(ObjectKind::TransferredResource, ids),
    )
}

#[tokio::test]
async fn submitted_job_completes_with_full_progress() {
    let h = Harness::new(config(2, 4), Behavior::new());
    let ids = seed(&h.repository, "r", 10);

    let job_id = h.orchestrator.submit(request_for(ids)).await.unwrap();
    let job = wait_for_terminal(&h.orchestrator, &job_id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completion_percentage, 100);
    assert_eq!(h.orchestrator.progress(&job_id).await.unwrap(), 100.0);
    assert_eq!(h.behavior.before_calls(), 3);
    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn stopping_a_submitted_job_marks_it_stopped() {
    let mut behavior = Behavior::new();
    for i in 0..8 {
        behavior = behavior.on(&format!("s{i}"), Action::Sleep(Duration::from_millis(300)));
    }
    let h = Harness::new(config(2, 2), behavior);
    let ids = seed(&h.repository, "s", 8);

    let job_id = h.orchestrator.submit(request_for(ids)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.orchestrator.stop(&job_id).await.unwrap();

    let job = wait_for_terminal(&h.orchestrator, &job_id).await;
    assert_eq!(job.status, JobStatus::Stopped);
    assert!(job.completion_percentage < 100);

    // stopping a finished job is a no-op
    h.orchestrator.stop(&job_id).await.unwrap();
    assert_eq!(
        h.orchestrator.retrieve_job(&job_id).await.unwrap().status,
        JobStatus::Stopped
    );
    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_storage() {
    let store = Arc::new(MemoryJobStore::new());
    let h = Harness::with_store(
        config(2, 10),
        Behavior::new(),
        Arc::new(MemoryRepository::new()),
        store.clone(),
    );

    let unknown_plugin = JobRequest::new(
        "no-such-plugin",
        OrchestratorMethod::RunPluginOnAllAips,
        ObjectSelector::all(ObjectKind::Aip),
    );
    assert!(matches!(
        h.orchestrator.submit(unknown_plugin).await,
        Err(ArcaError::PluginNotFound(_))
    ));

    let mut bad_method = request_for(vec!["x".into()]);
    bad_method.orchestrator_method = "runPluginEverywhere".into();
    assert!(matches!(
        h.orchestrator.submit(bad_method).await,
        Err(ArcaError::InvalidOrchestratorMethod(_))
    ));

    let missing_limit = JobRequest::new(
        "size-limit",
        OrchestratorMethod::RunPluginOnAllFiles,
        ObjectSelector::all(ObjectKind::File),
    );
    assert!(matches!(
        h.orchestrator.submit(missing_limit).await,
        Err(ArcaError::InvalidParameter(_))
    ));

    let listed = store
        .find(&JobFilter::default(), JobSort::CreatedAsc, Sublist::new(0, 10))
        .await
        .unwrap();
    assert_eq!(listed.total_count, 0);
    assert_eq!(h.orchestrator.worker_pool().total_dispatched(), 0);
    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn unknown_job_cannot_be_stopped() {
    let h = Harness::new(config(1, 10), Behavior::new());
    assert!(matches!(
        h.orchestrator.stop("nope").await,
        Err(ArcaError::JobNotFound(_))
    ));
    assert!(h.orchestrator.progress("nope").await.is_err());
    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn jobs_persist_through_sqlite() {
    let store = Arc::new(SqliteJobStore::connect("sqlite::memory:").await.unwrap());
    let repository = Arc::new(MemoryRepository::new());
    let h = Harness::with_store(config(2, 5), Behavior::new(), repository, store.clone());
    let ids = seed(&h.repository, "q", 12);

    let first = h
        .orchestrator
        .submit(request_for(ids.clone()).with_username("alice"))
        .await
        .unwrap();
    let second = h
        .orchestrator
        .submit(request_for(ids).with_username("bob"))
        .await
        .unwrap();
    assert_eq!(
        wait_for_terminal(&h.orchestrator, &first).await.status,
        JobStatus::Completed
    );
    assert_eq!(
        wait_for_terminal(&h.orchestrator, &second).await.status,
        JobStatus::Completed
    );

    let filter = JobFilter {
        username: Some("bob".into()),
        ..JobFilter::default()
    };
    let found = h
        .orchestrator
        .find_jobs(&filter, JobSort::CreatedDesc, Sublist::new(0, 10))
        .await
        .unwrap();
    assert_eq!(found.total_count, 1);
    assert_eq!(found.results[0].id, second);
    assert_eq!(found.results[0].completion_percentage, 100);
    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn submitted_run_plugin_job_completes() {
    let h = Harness::new(config(1, 10), Behavior::new());
    let request = JobRequest::new(SCRIPTED, OrchestratorMethod::RunPlugin, ObjectSelector::None);

    let job_id = h.orchestrator.submit(request).await.unwrap();
    let job = wait_for_terminal(&h.orchestrator, &job_id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completion_percentage, 100);
    assert_eq!(h.behavior.before_calls(), 1);
    assert_eq!(h.behavior.after_calls(), 1);
    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn overrun_job_with_full_queues_runs_every_post_hook() {
    let mut behavior = Behavior::new();
    for i in 0..4 {
        behavior = behavior.on(&format!("t{i}"), Action::Sleep(Duration::from_secs(60)));
    }
    let mut cfg = config(1, 1).with_per_block_timeout(Duration::from_secs(1));
    cfg.worker_queue_capacity = 1;
    let h = Harness::new(cfg, behavior);
    let ids = seed(&h.repository, "t", 4);

    let started = tokio::time::Instant::now();
    let job_id = h.orchestrator.submit(request_for(ids)).await.unwrap();
    let job = wait_for_terminal(&h.orchestrator, &job_id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.completion_percentage < 100);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(h.behavior.before_calls(), 4);
    assert_eq!(h.behavior.after_calls(), h.behavior.before_calls());
    h.orchestrator.shutdown().await;
}
