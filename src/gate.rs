//! Ingestion Gate: the only path by which a candidate item becomes a job.
//! Applies the ordered filter chain of admission checks before a `Job` is
//! inserted into the store and the ingestion-success event is published.

use tracing::{debug, info, warn};

use crate::claim::ClaimService;
use crate::collaborators::{SafetyClassifier, SimilarityClassifier, UploadClient};
use crate::config::ChannelBehavior;
use crate::dedup::canonicalize_url;
use crate::error::Result;
use crate::events::PipelineEvent;
use crate::job::{Job, Stage};
use crate::message_bus::ResilientPublisher;
use crate::store::JobStore;

const SIMILARITY_WINDOW: i64 = 20;

/// A single candidate item arriving from a feed source, pre-admission.
#[derive(Debug, Clone)]
pub struct CandidateItem {
    pub title: String,
    pub summary: String,
    pub link: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum GateOutcome {
    Admitted { job_id: String },
    RejectedAtCapacity,
    RejectedDuplicateLink,
    RejectedDuplicateTitle,
    RejectedDuplicateOnPlatform,
    RejectedTooSimilar,
    RejectedUnsafe,
}

pub struct IngestionGate {
    store: JobStore,
    publisher: ResilientPublisher,
    upload_client: Box<dyn UploadClient>,
    similarity: Box<dyn SimilarityClassifier>,
    safety: Box<dyn SafetyClassifier>,
}

impl IngestionGate {
    pub fn new(
        store: JobStore,
        publisher: ResilientPublisher,
        upload_client: Box<dyn UploadClient>,
        similarity: Box<dyn SimilarityClassifier>,
        safety: Box<dyn SafetyClassifier>,
    ) -> Self {
        Self {
            store,
            publisher,
            upload_client,
            similarity,
            safety,
        }
    }

    /// Runs one candidate (or, for aggregation channels, one synthesized
    /// item) through the full filter chain (§4.3).
    pub async fn admit(&self, channel: &ChannelBehavior, item: CandidateItem) -> Result<GateOutcome> {
        // Step 1: capacity check.
        let active = self.store.count_active(&channel.channel_id).await?;
        let limit = self.effective_limit(channel).await?;
        if active >= limit as i64 {
            debug!(channel = %channel.channel_id, active, limit, "ingestion gate: at capacity");
            return Ok(GateOutcome::RejectedAtCapacity);
        }

        // Step 2: link dedup.
        let normalized_link = canonicalize_url(&item.link).unwrap_or_else(|_| item.link.clone());
        if self.store.link_exists(&channel.channel_id, &normalized_link).await? {
            debug!(channel = %channel.channel_id, link = %normalized_link, "ingestion gate: duplicate link");
            return Ok(GateOutcome::RejectedDuplicateLink);
        }

        // Step 3: title dedup against past jobs.
        if self.store.title_exists(&channel.channel_id, &item.title).await? {
            debug!(channel = %channel.channel_id, title = %item.title, "ingestion gate: duplicate title");
            return Ok(GateOutcome::RejectedDuplicateTitle);
        }

        // Step 4: external-platform title dedup.
        if self.upload_client.title_exists(&channel.channel_id, &item.title).await? {
            debug!(channel = %channel.channel_id, title = %item.title, "ingestion gate: duplicate title on platform");
            return Ok(GateOutcome::RejectedDuplicateOnPlatform);
        }

        // Step 5: semantic similarity (advisory; fail-open on classifier error).
        let recent = self.store.recent(&channel.channel_id, SIMILARITY_WINDOW).await?;
        let recent_titles: Vec<String> = recent.into_iter().map(|j| j.title).collect();
        if self.similarity.is_too_similar(&item.title, &item.summary, &recent_titles).await? {
            debug!(channel = %channel.channel_id, title = %item.title, "ingestion gate: too similar to recent jobs");
            return Ok(GateOutcome::RejectedTooSimilar);
        }

        // Step 6: safety filter (terminal; any classifier error propagates).
        if !self.safety.is_safe(&item.title, &item.summary).await? {
            warn!(channel = %channel.channel_id, title = %item.title, "ingestion gate: rejected by safety filter");
            return Ok(GateOutcome::RejectedUnsafe);
        }

        let job = Job::new(channel.channel_id.clone(), item.title.clone(), item.summary.clone(), normalized_link);
        self.store.insert(&job).await?;

        self.publisher
            .publish(&PipelineEvent::IngestNewItem {
                channel_id: channel.channel_id.clone(),
                url: job.link.clone(),
                title: job.title.clone(),
                summary: job.summary.clone(),
            })
            .await
            .ok();

        info!(channel = %channel.channel_id, job_id = %job.id, "job admitted");
        Ok(GateOutcome::Admitted { job_id: job.id })
    }

    /// Consumes a regeneration request for an already-admitted job: moves
    /// it from `RETRY_QUEUED` back to `QUEUED` and republishes a fresh
    /// ingestion event for the same title/summary/link, skipping the
    /// dedup filter chain entirely since this is the same job returning
    /// for another attempt, not a new candidate (§4.1, §4.7).
    pub async fn regenerate(&self, channel_id: &str, job_id: &str, title: &str, summary: &str, link: &str) -> Result<bool> {
        let claims = ClaimService::new(self.store.clone());
        if !claims.claim(job_id, Stage::RetryQueued, Stage::Queued).await? {
            warn!(channel = %channel_id, job_id, "ingestion gate: regeneration claim lost or job not in RETRY_QUEUED");
            return Ok(false);
        }

        self.publisher
            .publish(&PipelineEvent::IngestNewItem {
                channel_id: channel_id.to_string(),
                url: link.to_string(),
                title: title.to_string(),
                summary: summary.to_string(),
            })
            .await
            .ok();

        info!(channel = %channel_id, job_id, "ingestion gate: regeneration requeued job");
        Ok(true)
    }

    /// Reads the per-channel override from System Settings, falling back to
    /// the compiled default (§4.8, §10.3).
    async fn effective_limit(&self, channel: &ChannelBehavior) -> Result<u32> {
        if let Some(raw) = self.store.get_setting(&channel.channel_id, "daily_limit").await? {
            if let Ok(parsed) = raw.parse::<u32>() {
                return Ok(parsed);
            }
        }
        Ok(channel.daily_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_item_carries_fields_through() {
        let item = CandidateItem {
            title: "t".into(),
            summary: "s".into(),
            link: "https://example.com/a".into(),
        };
        assert_eq!(item.title, "t");
    }
}
