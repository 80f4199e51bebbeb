//! The ingestion gate's ordered filter chain: a candidate must survive
//! capacity, link dedup, title dedup, platform dedup, similarity, and
//! safety in that order before it becomes a job.

mod common;

use shortform_pipeline::config::ChannelBehavior;
use shortform_pipeline::gate::{CandidateItem, GateOutcome, IngestionGate};
use shortform_pipeline::job::{Job, Stage};

fn test_channel(daily_limit: u32) -> ChannelBehavior {
    let mut channel = ChannelBehavior::resolve("news-shorts").expect("known channel");
    channel.channel_id = format!("gate-test-{}", uuid::Uuid::new_v4());
    channel.daily_limit = daily_limit;
    channel
}

fn gate(
    store: shortform_pipeline::store::JobStore,
    title_exists_on_platform: bool,
    too_similar: bool,
    safe: bool,
) -> IngestionGate {
    IngestionGate::new(
        store,
        common::test_publisher(),
        Box::new(common::FakeUploadClient { title_exists: title_exists_on_platform }),
        Box::new(common::FakeSimilarityClassifier { too_similar }),
        Box::new(common::FakeSafetyClassifier { safe }),
    )
}

fn candidate(title: &str, link: &str) -> CandidateItem {
    CandidateItem {
        title: title.to_string(),
        summary: "a summary".to_string(),
        link: link.to_string(),
    }
}

#[tokio::test]
async fn a_clean_candidate_survives_the_whole_chain_and_becomes_a_job() {
    let store = common::test_store().await;
    let channel = test_channel(20);
    let g = gate(store.clone(), false, false, true);

    let outcome = g.admit(&channel, candidate("Fresh headline", "https://example.com/fresh")).await.expect("admit");
    match outcome {
        GateOutcome::Admitted { job_id } => {
            let job = store.get(&job_id).await.expect("load job").expect("job exists");
            assert_eq!(job.channel_id, channel.channel_id);
        }
        other => panic!("expected Admitted, got {other:?}"),
    }
}

#[tokio::test]
async fn capacity_check_runs_first_and_rejects_before_touching_dedup() {
    let store = common::test_store().await;
    let channel = test_channel(0);
    let g = gate(store.clone(), false, false, true);

    let outcome = g.admit(&channel, candidate("Anything", "https://example.com/anything")).await.expect("admit");
    assert_eq!(outcome, GateOutcome::RejectedAtCapacity);
}

#[tokio::test]
async fn duplicate_link_is_rejected_before_similarity_or_safety_run() {
    let store = common::test_store().await;
    let channel = test_channel(20);
    let g = gate(store.clone(), false, false, true);

    let link = "https://example.com/dup";
    let first = g.admit(&channel, candidate("First headline", link)).await.expect("admit");
    assert!(matches!(first, GateOutcome::Admitted { .. }));

    let second = g.admit(&channel, candidate("Different headline text", link)).await.expect("admit");
    assert_eq!(second, GateOutcome::RejectedDuplicateLink);
}

#[tokio::test]
async fn duplicate_title_against_store_history_is_rejected() {
    let store = common::test_store().await;
    let channel = test_channel(20);
    let g = gate(store.clone(), false, false, true);

    let first = g.admit(&channel, candidate("Repeated headline", "https://example.com/a")).await.expect("admit");
    assert!(matches!(first, GateOutcome::Admitted { .. }));

    let second = g.admit(&channel, candidate("Repeated headline", "https://example.com/b")).await.expect("admit");
    assert_eq!(second, GateOutcome::RejectedDuplicateTitle);
}

#[tokio::test]
async fn duplicate_title_already_live_on_the_upload_platform_is_rejected() {
    let store = common::test_store().await;
    let channel = test_channel(20);
    let g = gate(store.clone(), true, false, true);

    let outcome = g.admit(&channel, candidate("Already on channel", "https://example.com/platform-dup")).await.expect("admit");
    assert_eq!(outcome, GateOutcome::RejectedDuplicateOnPlatform);
}

#[tokio::test]
async fn too_similar_to_recent_jobs_is_rejected() {
    let store = common::test_store().await;
    let channel = test_channel(20);
    let g = gate(store.clone(), false, true, true);

    let outcome = g.admit(&channel, candidate("Similar enough", "https://example.com/similar")).await.expect("admit");
    assert_eq!(outcome, GateOutcome::RejectedTooSimilar);
}

#[tokio::test]
async fn unsafe_candidates_are_rejected_and_never_reach_the_store() {
    let store = common::test_store().await;
    let channel = test_channel(20);
    let g = gate(store.clone(), false, false, false);

    let link = "https://example.com/unsafe";
    let outcome = g.admit(&channel, candidate("Unsafe headline", link)).await.expect("admit");
    assert_eq!(outcome, GateOutcome::RejectedUnsafe);

    assert!(!store.link_exists(&channel.channel_id, link).await.expect("link_exists"));
}

#[tokio::test]
async fn regeneration_requeues_an_existing_job_back_to_queued() {
    let store = common::test_store().await;
    let channel = test_channel(20);
    let g = gate(store.clone(), false, false, true);

    let mut job = Job::new(channel.channel_id.clone(), "Regen title", "summary", format!("https://example.com/{}", uuid::Uuid::new_v4()));
    job.stage = Stage::RetryQueued;
    job.regen_count = 1;
    store.insert(&job).await.expect("insert job");

    let requeued = g
        .regenerate(&channel.channel_id, &job.id, &job.title, &job.summary, &job.link)
        .await
        .expect("regenerate");
    assert!(requeued);

    let after = store.get(&job.id).await.expect("load").expect("exists");
    assert_eq!(after.stage, Stage::Queued);
}

#[tokio::test]
async fn regeneration_is_a_no_op_if_the_job_already_left_retry_queued() {
    let store = common::test_store().await;
    let channel = test_channel(20);
    let g = gate(store.clone(), false, false, true);

    let mut job = Job::new(channel.channel_id.clone(), "Already moved on", "summary", format!("https://example.com/{}", uuid::Uuid::new_v4()));
    job.stage = Stage::Failed;
    store.insert(&job).await.expect("insert job");

    let requeued = g
        .regenerate(&channel.channel_id, &job.id, &job.title, &job.summary, &job.link)
        .await
        .expect("regenerate");
    assert!(!requeued);

    let after = store.get(&job.id).await.expect("load").expect("exists");
    assert_eq!(after.stage, Stage::Failed);
}
