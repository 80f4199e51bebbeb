//! Upload Scheduler: promotes at most one completed job per channel per
//! tick into `UPLOADING`, gated by quota and cadence (§4.5).

use std::path::Path;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::claim::ClaimService;
use crate::config::ChannelBehavior;
use crate::error::Result;
use crate::events::PipelineEvent;
use crate::job::{Job, Stage};
use crate::message_bus::ResilientPublisher;

pub struct UploadScheduler {
    claims: ClaimService,
    publisher: ResilientPublisher,
    daily_quota: u32,
}

impl UploadScheduler {
    pub fn new(claims: ClaimService, publisher: ResilientPublisher, daily_quota: u32) -> Self {
        Self { claims, publisher, daily_quota }
    }

    /// Runs one tick for one channel. Returns what happened, mainly for
    /// tests and the admin trigger endpoint.
    pub async fn tick(&self, channel: &ChannelBehavior) -> Result<SchedulerOutcome> {
        let today = Utc::now().date_naive();
        let consumed = self.claims.store().quota_consumed(&channel.channel_id, today).await?;
        if consumed as u32 >= self.daily_quota {
            debug!(channel = %channel.channel_id, consumed, "scheduler: quota exhausted for today");
            return Ok(SchedulerOutcome::QuotaExhausted);
        }

        let interval_hours = self.interval_hours(channel).await?;
        if let Some(last_uploaded) = self.claims.store().latest_in_stage(&channel.channel_id, Stage::Uploaded).await? {
            let next_allowed = last_uploaded.updated_at + chrono::Duration::seconds((interval_hours * 3600.0) as i64);
            if next_allowed > Utc::now() {
                debug!(channel = %channel.channel_id, next_allowed = %next_allowed, "scheduler: cadence gate not yet open");
                return Ok(SchedulerOutcome::CadenceGateClosed);
            }
        }

        let Some(job) = self.claims.store().oldest_in_stage(&channel.channel_id, Stage::Completed).await? else {
            return Ok(SchedulerOutcome::NothingToUpload);
        };

        if !self.artifact_exists(&job) {
            if job.can_regenerate() {
                warn!(job_id = %job.id, "scheduler: artifact missing, requesting regeneration");
                self.claims
                    .claim_with(&job.id, Stage::Completed, Stage::RetryQueued, |job: &mut Job| {
                        job.regen_count += 1;
                    })
                    .await?;
                self.publisher
                    .publish(&PipelineEvent::RegenerationRequested {
                        channel_id: channel.channel_id.clone(),
                        job_id: job.id.clone(),
                        title: job.title.clone(),
                        summary: job.summary.clone(),
                        link: job.link.clone(),
                    })
                    .await
                    .ok();
                return Ok(SchedulerOutcome::RegenerationRequested { job_id: job.id });
            }

            self.claims
                .claim_with(&job.id, Stage::Completed, Stage::Failed, |job: &mut Job| {
                    job.failure_step = Some("SCHEDULER".to_string());
                    job.error_message = Some("artifact missing after regeneration attempt".to_string());
                })
                .await?;
            return Ok(SchedulerOutcome::ArtifactMissingTerminal { job_id: job.id });
        }

        let promoted = self.claims.claim(&job.id, Stage::Completed, Stage::Uploading).await?;
        if !promoted {
            return Ok(SchedulerOutcome::ClaimLost);
        }

        self.publisher
            .publish(&PipelineEvent::UploadRequested { channel_id: channel.channel_id.clone(), job_id: job.id.clone() })
            .await
            .ok();

        info!(job_id = %job.id, channel = %channel.channel_id, "scheduler: promoted job to upload");
        Ok(SchedulerOutcome::Promoted { job_id: job.id })
    }

    async fn interval_hours(&self, channel: &ChannelBehavior) -> Result<f64> {
        if let Some(raw) = self.claims.store().get_setting(&channel.channel_id, "upload_interval_hours").await? {
            if let Ok(parsed) = raw.parse::<f64>() {
                return Ok(parsed);
            }
        }
        Ok(channel.upload_interval_hours)
    }

    fn artifact_exists(&self, job: &Job) -> bool {
        job.file_path.as_deref().is_some_and(|p| Path::new(p).exists())
    }
}

#[derive(Debug, PartialEq)]
pub enum SchedulerOutcome {
    QuotaExhausted,
    CadenceGateClosed,
    NothingToUpload,
    RegenerationRequested { job_id: String },
    ArtifactMissingTerminal { job_id: String },
    ClaimLost,
    Promoted { job_id: String },
}
