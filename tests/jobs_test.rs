//! Acquisition job integration tests against a running service.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::TestHarness;
use vidshelf::vs_core::events::EventPayload;
use vidshelf::vs_core::{JobStatus, NewJob, SourceId};

fn fetch_job(target: &str) -> NewJob {
    NewJob {
        kind: "fetch".into(),
        source_id: SourceId::from("movies"),
        target_rel_path: target.into(),
        display_name: None,
        params: serde_json::json!({}),
    }
}

// ---------------------------------------------------------------------------
// Submit -> progress -> done -> catalogued
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fetched_file_lands_in_catalog() {
    let harness = TestHarness::new().await;
    let jobs = &harness.service.jobs;

    let job = jobs.submit(fetch_job("x.mp4")).unwrap();
    assert_eq!(job.status, JobStatus::Queued);

    let halfway = harness
        .wait_for_job(job.id, |j| j.progress_percent == 50.0)
        .await;
    assert_eq!(halfway.status, JobStatus::Running);

    harness.fetcher.release();
    let done = harness
        .wait_for_job(job.id, |j| j.status == JobStatus::Done)
        .await;
    let media_id = done.result_media_id.expect("result media id");

    let listed = harness
        .library()
        .list_items(Some(&SourceId::from("movies")))
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].entry.rel_path, "x.mp4");
    assert_eq!(listed[0].entry.id, media_id);

    let lifecycle: Vec<&'static str> = harness
        .events_seen()
        .into_iter()
        .filter_map(|e| match e.payload {
            EventPayload::JobQueued { .. } => Some("queued"),
            EventPayload::JobStarted { .. } => Some("started"),
            EventPayload::JobCompleted { .. } => Some("completed"),
            _ => None,
        })
        .collect();
    assert_eq!(lifecycle, vec!["queued", "started", "completed"]);

    let err = jobs.retry(job.id).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_state");
}

#[tokio::test]
async fn stopped_job_restarts_to_queued() {
    let harness = TestHarness::new().await;
    let jobs = &harness.service.jobs;

    let job = jobs.submit(fetch_job("later.mp4")).unwrap();
    harness
        .wait_for_job(job.id, |j| j.status == JobStatus::Running)
        .await;

    let stopped = jobs.stop(job.id).await.unwrap();
    assert_eq!(stopped.status, JobStatus::Stopped);
    assert!(!harness.root("movies").join("later.mp4").exists());

    let restarted = jobs.restart(job.id).await.unwrap();
    assert_eq!(restarted.status, JobStatus::Queued);

    harness
        .wait_for_job(job.id, |j| j.status == JobStatus::Running)
        .await;
    harness.fetcher.release();
    harness
        .wait_for_job(job.id, |j| j.status == JobStatus::Done)
        .await;
    assert_eq!(harness.fetcher.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn job_listing_filters_by_kind_and_status() {
    let harness = TestHarness::new().await;
    let jobs = &harness.service.jobs;

    let first = jobs.submit(fetch_job("one.mp4")).unwrap();
    harness
        .wait_for_job(first.id, |j| j.status == JobStatus::Running)
        .await;
    harness.fetcher.release();
    harness
        .wait_for_job(first.id, |j| j.status == JobStatus::Done)
        .await;
    let second = jobs.submit(fetch_job("two.mp4")).unwrap();
    harness
        .wait_for_job(second.id, |j| j.status == JobStatus::Running)
        .await;

    assert_eq!(jobs.list_jobs(Some("fetch"), None).unwrap().len(), 2);
    assert!(jobs.list_jobs(Some("http"), None).unwrap().is_empty());
    let done = jobs.list_jobs(None, Some(JobStatus::Done)).unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].id, first.id);

    jobs.delete(second.id).await.unwrap();
    assert_eq!(jobs.list_jobs(None, None).unwrap().len(), 1);
}

#[tokio::test]
async fn service_shutdown_interrupts_running_jobs() {
    let harness = TestHarness::new().await;
    let job = harness.service.jobs.submit(fetch_job("x.mp4")).unwrap();
    harness
        .wait_for_job(job.id, |j| j.status == JobStatus::Running)
        .await;

    let jobs = harness.service.jobs.clone();
    let cancel = harness.service.cancel_token();
    let TestHarness { service, .. } = harness;
    let handle = tokio::spawn(service.run_until_shutdown());
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("service did not stop")
        .unwrap()
        .unwrap();

    let job = jobs.get_job(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().starts_with("interrupted"));
}
