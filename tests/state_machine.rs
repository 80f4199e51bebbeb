//! Legality of stage transitions through the claim service: terminal
//! stages never accept new work, and `claim_with` applies field
//! mutations atomically alongside the stage change.

mod common;

use shortform_pipeline::claim::ClaimService;
use shortform_pipeline::job::{Job, Stage};

#[tokio::test]
async fn claim_expecting_a_stage_the_job_already_left_is_rejected() {
    let store = common::test_store().await;
    let claims = ClaimService::new(store.clone());

    let mut job = Job::new("news-shorts", "Terminal title", "summary", format!("https://example.com/terminal-{}", uuid::Uuid::new_v4()));
    job.stage = Stage::Uploaded;
    store.insert(&job).await.expect("insert job");

    // The job already reached a terminal stage; a worker that still
    // believes it is Queued (stale read, redelivered message) must not
    // be able to move it anywhere.
    for stale_from in [Stage::Queued, Stage::Scripting, Stage::RenderQueued] {
        let claimed = claims.claim(&job.id, stale_from, Stage::Scripting).await.expect("claim call");
        assert!(!claimed, "claim from stale stage {stale_from} must be rejected");
    }

    let unchanged = store.get(&job.id).await.expect("load job").expect("job exists");
    assert_eq!(unchanged.stage, Stage::Uploaded);
}

#[tokio::test]
async fn claim_with_applies_mutation_atomically_with_the_transition() {
    let store = common::test_store().await;
    let claims = ClaimService::new(store.clone());

    let job = Job::new("news-shorts", "Mutate title", "summary", format!("https://example.com/mutate-{}", uuid::Uuid::new_v4()));
    store.insert(&job).await.expect("insert job");

    let claimed = claims
        .claim_with(&job.id, Stage::Queued, Stage::Failed, |j| {
            j.error_message = Some("collaborator exploded".to_string());
            j.retry_count += 1;
        })
        .await
        .expect("claim_with call");
    assert!(claimed);

    let final_job = store.get(&job.id).await.expect("load job").expect("job exists");
    assert_eq!(final_job.stage, Stage::Failed);
    assert_eq!(final_job.error_message.as_deref(), Some("collaborator exploded"));
    assert_eq!(final_job.retry_count, 1);
}

#[tokio::test]
async fn is_terminal_matches_the_stages_the_store_schema_treats_as_closed() {
    assert!(Stage::Uploaded.is_terminal());
    assert!(Stage::Failed.is_terminal());
    assert!(Stage::Blocked.is_terminal());
    for non_terminal in [
        Stage::Queued,
        Stage::Scripting,
        Stage::AssetsQueued,
        Stage::AssetsGenerating,
        Stage::RenderQueued,
        Stage::Rendering,
        Stage::Completed,
        Stage::Uploading,
        Stage::UploadFailed,
        Stage::RetryQueued,
    ] {
        assert!(!non_terminal.is_terminal());
    }
}
