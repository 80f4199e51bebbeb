//! The job: the unit of pipeline work, and its stage state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The coarse state of a job in the pipeline. Every job has exactly one
/// at all times; transitions are only ever made through the claim service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Queued,
    Scripting,
    AssetsQueued,
    AssetsGenerating,
    RenderQueued,
    Rendering,
    Completed,
    Uploading,
    Uploaded,
    UploadFailed,
    RetryQueued,
    Failed,
    Blocked,
}

impl Stage {
    /// Terminal stages never transition further.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Uploaded | Stage::Failed | Stage::Blocked)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Queued => "QUEUED",
            Stage::Scripting => "SCRIPTING",
            Stage::AssetsQueued => "ASSETS_QUEUED",
            Stage::AssetsGenerating => "ASSETS_GENERATING",
            Stage::RenderQueued => "RENDER_QUEUED",
            Stage::Rendering => "RENDERING",
            Stage::Completed => "COMPLETED",
            Stage::Uploading => "UPLOADING",
            Stage::Uploaded => "UPLOADED",
            Stage::UploadFailed => "UPLOAD_FAILED",
            Stage::RetryQueued => "RETRY_QUEUED",
            Stage::Failed => "FAILED",
            Stage::Blocked => "BLOCKED",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub const MAX_UPLOAD_RETRIES: u32 = 3;
pub const MAX_REGENERATIONS: u32 = 1;

/// A unit of pipeline work. See the store module for persistence and
/// the claim service for the only legal way to mutate `stage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub channel_id: String,

    pub title: String,
    pub summary: String,
    pub link: String,
    /// Original feed title, kept alongside any rewritten `title` for dedup.
    pub rss_title: String,

    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub validation_errors: Vec<String>,

    pub retry_count: u32,
    pub regen_count: u32,

    pub progress: u8,
    pub current_step: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub youtube_url: Option<String>,

    pub tags: Vec<String>,
    pub sources: Vec<String>,
    pub description: String,
    pub scenes: Vec<Scene>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One scripted scene, populated by the Scripting stage and consumed by
/// Assets/Rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub index: u32,
    pub narration: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<String>,
}

impl Job {
    /// Creates a fresh job in `Queued`, as produced by the ingestion gate.
    pub fn new(channel_id: impl Into<String>, title: impl Into<String>, summary: impl Into<String>, link: impl Into<String>) -> Self {
        let now = Utc::now();
        let title = title.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.into(),
            rss_title: title.clone(),
            title,
            summary: summary.into(),
            link: link.into(),
            stage: Stage::Queued,
            failure_step: None,
            error_message: None,
            validation_errors: Vec::new(),
            retry_count: 0,
            regen_count: 0,
            progress: 0,
            current_step: "queued".to_string(),
            file_path: None,
            thumbnail_path: None,
            youtube_url: None,
            tags: Vec::new(),
            sources: Vec::new(),
            description: String::new(),
            scenes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < MAX_UPLOAD_RETRIES
    }

    pub fn can_regenerate(&self) -> bool {
        self.regen_count < MAX_REGENERATIONS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_starts_queued() {
        let job = Job::new("news-shorts", "title", "summary", "https://x/y");
        assert_eq!(job.stage, Stage::Queued);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.regen_count, 0);
        assert!(job.can_retry());
        assert!(job.can_regenerate());
    }

    #[test]
    fn terminal_stages() {
        assert!(Stage::Uploaded.is_terminal());
        assert!(Stage::Failed.is_terminal());
        assert!(Stage::Blocked.is_terminal());
        assert!(!Stage::Scripting.is_terminal());
    }

    #[test]
    fn stage_round_trips_through_json() {
        let s = serde_json::to_string(&Stage::AssetsGenerating).unwrap();
        assert_eq!(s, "\"ASSETS_GENERATING\"");
        let back: Stage = serde_json::from_str(&s).unwrap();
        assert_eq!(back, Stage::AssetsGenerating);
    }
}
