//! Upload Worker: consumes upload-requested (and legacy video-created)
//! events, runs pre-upload validation, and calls the upload collaborator
//! (§4.6).

use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;
use tracing::{info, warn};

use crate::claim::ClaimService;
use crate::collaborators::{NotificationSink, UploadClient, UploadOutcome};
use crate::config::ChannelBehavior;
use crate::error::Result;
use crate::events::PipelineEvent;
use crate::job::{Job, Stage};
use crate::message_bus::ResilientPublisher;

const MIN_ARTIFACT_BYTES: u64 = 1024 * 1024;
const MAX_TAGS: usize = 20;
const MAX_TAG_LEN: usize = 30;

pub struct UploadWorker {
    claims: ClaimService,
    publisher: ResilientPublisher,
    upload_client: Box<dyn UploadClient>,
    notifications: Box<dyn NotificationSink>,
}

impl UploadWorker {
    pub fn new(
        claims: ClaimService,
        publisher: ResilientPublisher,
        upload_client: Box<dyn UploadClient>,
        notifications: Box<dyn NotificationSink>,
    ) -> Self {
        Self { claims, publisher, upload_client, notifications }
    }

    /// Processes one upload-requested (or legacy video-created) message
    /// for `job_id`, scoped to `channel`.
    pub async fn handle(&self, channel: &ChannelBehavior, job_id: &str) -> Result<()> {
        let Some(existing) = self.claims.store().get(job_id).await? else {
            warn!(job_id, "upload worker: job not found");
            return Ok(());
        };
        if matches!(existing.stage, Stage::Uploaded | Stage::Uploading) {
            return Ok(());
        }

        let claimed = self
            .claims
            .claim_from_any(
                job_id,
                &[Stage::Completed, Stage::UploadFailed, Stage::RetryQueued, Stage::Failed],
                Stage::Uploading,
            )
            .await?;
        if !claimed {
            return Ok(());
        }

        let Some(mut job) = self.claims.store().get(job_id).await? else {
            return Ok(());
        };

        let errors = self.validate(channel, &mut job).await;
        if !errors.is_empty() {
            warn!(job_id, errors = ?errors, "upload worker: pre-upload validation failed");
            self.claims
                .claim_with(job_id, Stage::Uploading, Stage::Failed, |job: &mut Job| {
                    job.validation_errors = errors.clone();
                    job.failure_step = Some("UPLOAD_VALIDATION".to_string());
                })
                .await?;
            return Ok(());
        }

        let file_path = job.file_path.clone().unwrap_or_default();
        let thumbnail_path = job.thumbnail_path.clone().unwrap_or_default();

        match self
            .upload_client
            .upload(&file_path, &thumbnail_path, &job.title, &job.description, &job.tags)
            .await?
        {
            UploadOutcome::Success { youtube_url } => {
                self.claims
                    .claim_with(job_id, Stage::Uploading, Stage::Uploaded, |job: &mut Job| {
                        job.youtube_url = Some(youtube_url.clone());
                    })
                    .await?;
                self.claims.store().increment_quota(&channel.channel_id, Utc::now().date_naive()).await?;
                self.publisher
                    .publish(&PipelineEvent::VideoUploaded {
                        channel_id: channel.channel_id.clone(),
                        job_id: job_id.to_string(),
                        youtube_url: youtube_url.clone(),
                    })
                    .await
                    .ok();
                self.notifications.notify_uploaded(&channel.channel_id, job_id, &youtube_url).await;
                info!(job_id, "upload worker: uploaded");
            }
            UploadOutcome::QuotaExceeded => {
                self.claims
                    .claim_with(job_id, Stage::Uploading, Stage::Failed, |job: &mut Job| {
                        job.failure_step = Some("UPLOAD_QUOTA_EXCEEDED".to_string());
                        job.error_message = Some("upload quota exceeded".to_string());
                    })
                    .await?;
            }
            UploadOutcome::Transient { reason } => {
                self.claims
                    .claim_with(job_id, Stage::Uploading, Stage::UploadFailed, |job: &mut Job| {
                        job.error_message = Some(reason.clone());
                    })
                    .await?;
                self.publisher
                    .publish(&PipelineEvent::UploadFailed {
                        channel_id: channel.channel_id.clone(),
                        job_id: job_id.to_string(),
                        reason,
                    })
                    .await
                    .ok();
            }
        }

        Ok(())
    }

    async fn validate(&self, channel: &ChannelBehavior, job: &mut Job) -> Vec<String> {
        let mut errors = Vec::new();

        match &job.file_path {
            Some(path) => {
                let path = Path::new(path);
                match tokio::fs::metadata(path).await {
                    Ok(meta) => {
                        if meta.len() < MIN_ARTIFACT_BYTES {
                            warn!(job_id = %job.id, size = meta.len(), "artifact smaller than expected");
                        }
                    }
                    Err(_) => errors.push("ARTIFACT_MISSING".to_string()),
                }
            }
            None => errors.push("ARTIFACT_MISSING".to_string()),
        }

        if channel.requires_native_title {
            if let Some((lo, hi)) = channel.native_title_unicode_range {
                let has_native_char = job.title.chars().any(|c| (c as u32) >= lo && (c as u32) <= hi);
                if !has_native_char {
                    errors.push("TITLE_ENGLISH".to_string());
                }
            }
        }

        let mut seen = HashSet::new();
        let mut tags: Vec<String> = channel
            .default_tags
            .iter()
            .chain(job.tags.iter())
            .map(|t| t.trim().chars().take(MAX_TAG_LEN).collect::<String>())
            .filter(|t| t.len() > 1 && seen.insert(t.clone()))
            .take(MAX_TAGS)
            .collect();
        tags.dedup();
        job.tags = tags;

        for hashtag in &channel.default_hashtags {
            if !job.description.contains(hashtag.as_str()) {
                job.description.push(' ');
                job.description.push_str(hashtag);
            }
        }

        if channel.requires_strict_date_check && !self.references_today(channel, &job.description) {
            errors.push("STALE_DATE".to_string());
        }

        errors
    }

    /// A channel whose content must reference "today" in its own
    /// timezone fails validation if the description carries no date
    /// token matching today's local date (§4.6.3, §9 resolved decision).
    fn references_today(&self, channel: &ChannelBehavior, description: &str) -> bool {
        let tz: chrono_tz::Tz = channel.timezone.parse().unwrap_or(chrono_tz::UTC);
        let today_local = Utc::now().with_timezone(&tz).date_naive();
        let today_iso = today_local.format("%Y-%m-%d").to_string();
        description.contains(&today_iso) || description.to_lowercase().contains("today")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_channel() -> ChannelBehavior {
        ChannelBehavior::resolve("korean-news-shorts").unwrap()
    }

    #[test]
    fn tag_union_is_deduplicated_and_trimmed() {
        let long_tag = "x".repeat(40);
        let tags = vec!["news".to_string(), "news".to_string(), long_tag.clone()];
        let mut seen = HashSet::new();
        let trimmed: Vec<String> = tags
            .into_iter()
            .map(|t| t.trim().chars().take(MAX_TAG_LEN).collect::<String>())
            .filter(|t| t.len() > 1 && seen.insert(t.clone()))
            .collect();
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed[1].len(), MAX_TAG_LEN);
    }

    #[test]
    fn hangul_range_check() {
        let channel = test_channel();
        let (lo, hi) = channel.native_title_unicode_range.unwrap();
        assert!("뉴스".chars().any(|c| (c as u32) >= lo && (c as u32) <= hi));
        assert!(!"news".chars().any(|c| (c as u32) >= lo && (c as u32) <= hi));
    }
}
