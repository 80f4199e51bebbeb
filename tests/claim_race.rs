//! Exercises the claim service's core concurrency guarantee: of two
//! workers racing to claim the same job out of the same stage, exactly
//! one wins, and the loser observes a clean rejection rather than a
//! partial write.

mod common;

use shortform_pipeline::claim::ClaimService;
use shortform_pipeline::job::{Job, Stage};

#[tokio::test]
async fn exactly_one_concurrent_claim_wins() {
    let store = common::test_store().await;
    let claims = ClaimService::new(store.clone());

    let job = Job::new("news-shorts", "Race title", "summary", format!("https://example.com/race-{}", uuid::Uuid::new_v4()));
    store.insert(&job).await.expect("insert job");

    let job_id = job.id.clone();
    let claims_a = claims.clone();
    let claims_b = claims.clone();
    let job_id_a = job_id.clone();
    let job_id_b = job_id.clone();

    let (a, b) = tokio::join!(
        tokio::spawn(async move { claims_a.claim(&job_id_a, Stage::Queued, Stage::Scripting).await }),
        tokio::spawn(async move { claims_b.claim(&job_id_b, Stage::Queued, Stage::Scripting).await }),
    );

    let a = a.expect("task a").expect("claim a");
    let b = b.expect("task b").expect("claim b");

    assert_ne!(a, b, "exactly one of the two concurrent claims must win");

    let final_job = store.get(&job_id).await.expect("load job").expect("job exists");
    assert_eq!(final_job.stage, Stage::Scripting);
}

#[tokio::test]
async fn claim_against_wrong_expected_stage_is_a_clean_no_op() {
    let store = common::test_store().await;
    let claims = ClaimService::new(store.clone());

    let job = Job::new("news-shorts", "No-op title", "summary", format!("https://example.com/noop-{}", uuid::Uuid::new_v4()));
    store.insert(&job).await.expect("insert job");
    let before = store.get(&job.id).await.expect("load job").expect("job exists");

    let claimed = claims.claim(&job.id, Stage::Rendering, Stage::Completed).await.expect("claim call");
    assert!(!claimed);

    let still_queued = store.get(&job.id).await.expect("load job").expect("job exists");
    assert_eq!(still_queued.stage, Stage::Queued);
    assert_eq!(still_queued.updated_at, before.updated_at, "a rejected claim must not touch updated_at");
}

#[tokio::test]
async fn claim_from_any_tries_candidates_in_order() {
    let store = common::test_store().await;
    let claims = ClaimService::new(store.clone());

    let mut job = Job::new("news-shorts", "Retry title", "summary", format!("https://example.com/retry-{}", uuid::Uuid::new_v4()));
    job.stage = Stage::UploadFailed;
    store.insert(&job).await.expect("insert job");

    let claimed = claims
        .claim_from_any(&job.id, &[Stage::Completed, Stage::UploadFailed, Stage::Failed], Stage::Uploading)
        .await
        .expect("claim_from_any call");
    assert!(claimed);

    let final_job = store.get(&job.id).await.expect("load job").expect("job exists");
    assert_eq!(final_job.stage, Stage::Uploading);
}
