//! External collaborators.
//!
//! These are the pieces the orchestration engine coordinates but does not
//! implement itself: the LLM script generator, the TTS engine, stock-clip
//! search, the renderer executable, the upload target, and the safety /
//! similarity classifiers. Each is expressed as a small trait so the
//! engine can be exercised against fakes in tests, and a real
//! HTTP-backed implementation built on the resilient client plumbing in
//! `crate::http_client`.

pub mod http;

use async_trait::async_trait;

use crate::error::Result;
use crate::job::Scene;

/// Progress reporting from inside a long-running collaborator call.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, progress: u8, step: &str);
}

/// A scripted draft produced from a headline + summary.
#[derive(Debug, Clone)]
pub struct ScriptDraft {
    pub description: String,
    pub tags: Vec<String>,
    pub scenes: Vec<Scene>,
}

/// The LLM collaborator driving the Scripting stage.
#[async_trait]
pub trait ScriptGenerator: Send + Sync {
    async fn generate(&self, title: &str, summary: &str, system_prompt: &str, progress: &dyn ProgressSink) -> Result<ScriptDraft>;
}

/// Produced assets for one scene: narration audio plus a matched clip.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SceneAssets {
    pub index: u32,
    pub audio_path: String,
    pub clip_path: String,
}

/// TTS + stock-clip search collaborators driving the Assets stage. Kept
/// as one trait because the stage worker invokes them as a unit per
/// scene; a real implementation is free to call out to two distinct
/// services internally.
#[async_trait]
pub trait AssetProducer: Send + Sync {
    async fn produce(&self, scenes: &[Scene], progress: &dyn ProgressSink) -> Result<Vec<SceneAssets>>;
}

/// The render executable driving the Rendering stage.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, job_id: &str, assets: &[SceneAssets], bgm_category: &str, progress: &dyn ProgressSink) -> Result<RenderOutput>;
}

#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub file_path: String,
    pub thumbnail_path: String,
}

/// The outcome of an upload attempt.
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    Success { youtube_url: String },
    QuotaExceeded,
    Transient { reason: String },
}

/// The upload target's API.
#[async_trait]
pub trait UploadClient: Send + Sync {
    async fn upload(
        &self,
        file_path: &str,
        thumbnail_path: &str,
        title: &str,
        description: &str,
        tags: &[String],
    ) -> Result<UploadOutcome>;

    /// Checks whether a title already exists on the target channel
    /// (external-platform title dedup, §4.3 step 4).
    async fn title_exists(&self, channel_id: &str, title: &str) -> Result<bool>;
}

/// Safety classifier: approves or denies a candidate topic (§4.3 step 6).
/// Rejection is terminal; any error is surfaced, not defaulted.
#[async_trait]
pub trait SafetyClassifier: Send + Sync {
    async fn is_safe(&self, title: &str, summary: &str) -> Result<bool>;
}

/// Semantic-similarity classifier: compares a candidate against recent
/// jobs (§4.3 step 5). A classifier failure defaults to *accept* to
/// preserve forward progress, per the spec.
#[async_trait]
pub trait SimilarityClassifier: Send + Sync {
    async fn is_too_similar(&self, title: &str, summary: &str, recent_titles: &[String]) -> Result<bool>;
}

/// Notification sink for successful uploads (§4.6 step 4).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_uploaded(&self, channel_id: &str, job_id: &str, youtube_url: &str);
}
