//! Retry / Regeneration Controller: consumes upload-failed events and
//! decides between a bounded retry, a single regeneration, or terminal
//! failure (§4.7).

use tracing::{info, warn};

use crate::claim::ClaimService;
use crate::error::Result;
use crate::events::PipelineEvent;
use crate::job::{Job, Stage};
use crate::message_bus::ResilientPublisher;

pub struct RetryController {
    claims: ClaimService,
    publisher: ResilientPublisher,
}

impl RetryController {
    pub fn new(claims: ClaimService, publisher: ResilientPublisher) -> Self {
        Self { claims, publisher }
    }

    pub async fn handle_upload_failed(&self, channel_id: &str, job_id: &str, reason: &str) -> Result<RetryOutcome> {
        if reason.to_lowercase().contains("quota") {
            self.claims
                .claim_with(job_id, Stage::UploadFailed, Stage::Failed, |job: &mut Job| {
                    job.failure_step = Some("UPLOAD_QUOTA_EXCEEDED".to_string());
                })
                .await?;
            return Ok(RetryOutcome::QuotaTerminal);
        }

        let Some(job) = self.claims.store().get(job_id).await? else {
            return Ok(RetryOutcome::JobNotFound);
        };

        if job.can_retry() {
            let claimed = self
                .claims
                .claim_with(job_id, Stage::UploadFailed, Stage::RetryQueued, |job: &mut Job| {
                    job.retry_count += 1;
                })
                .await?;
            if claimed {
                self.publisher
                    .publish(&PipelineEvent::UploadRequested { channel_id: channel_id.to_string(), job_id: job_id.to_string() })
                    .await
                    .ok();
                info!(job_id, retry_count = job.retry_count + 1, "retry controller: re-queued upload");
            }
            return Ok(RetryOutcome::Retried { attempt: job.retry_count + 1 });
        }

        if job.can_regenerate() {
            let claimed = self
                .claims
                .claim_with(job_id, Stage::UploadFailed, Stage::RetryQueued, |job: &mut Job| {
                    job.regen_count += 1;
                })
                .await?;
            if claimed {
                self.publisher
                    .publish(&PipelineEvent::RegenerationRequested {
                        channel_id: channel_id.to_string(),
                        job_id: job_id.to_string(),
                        title: job.title.clone(),
                        summary: job.summary.clone(),
                        link: job.link.clone(),
                    })
                    .await
                    .ok();
                info!(job_id, "retry controller: requested regeneration");
            }
            return Ok(RetryOutcome::Regenerated);
        }

        warn!(job_id, "retry controller: retries and regeneration exhausted, failing terminally");
        self.claims
            .claim_with(job_id, Stage::UploadFailed, Stage::Failed, |job: &mut Job| {
                job.failure_step = Some("RETRY_EXHAUSTED".to_string());
            })
            .await?;
        self.publisher
            .publish(&PipelineEvent::DeadLetter {
                channel_id: channel_id.to_string(),
                job_id: job_id.to_string(),
                reason: reason.to_string(),
                failed_topic: "upload-failed".to_string(),
            })
            .await
            .ok();
        Ok(RetryOutcome::TerminallyFailed)
    }
}

#[derive(Debug, PartialEq)]
pub enum RetryOutcome {
    QuotaTerminal,
    JobNotFound,
    Retried { attempt: u32 },
    Regenerated,
    TerminallyFailed,
}
