//! Stale-job reconciler: periodically sweeps jobs stuck in an active
//! stage past a configurable age to `FAILED` (§7.7). Structurally the
//! same periodic-loop shape as the teacher's checkpoint auto-save loop;
//! the sweep goes through the Claim Service so a live worker's concurrent
//! claim always wins the race.

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tracing::{info, warn};

use crate::claim::ClaimService;
use crate::error::Result;
use crate::job::Job;

pub struct StaleJobReconciler {
    claims: ClaimService,
    max_age: ChronoDuration,
    interval: Duration,
}

impl StaleJobReconciler {
    pub fn new(claims: ClaimService, max_age_secs: u64, interval_secs: u64) -> Self {
        Self {
            claims,
            max_age: ChronoDuration::seconds(max_age_secs as i64),
            interval: Duration::from_secs(interval_secs),
        }
    }

    /// Runs one sweep; returns the number of jobs successfully failed.
    pub async fn sweep_once(&self) -> Result<usize> {
        let stale = self.claims.store().stale_active(self.max_age).await?;
        let mut swept = 0;

        for job in stale {
            let stage = job.stage;
            let claimed = self
                .claims
                .claim_with(&job.id, stage, crate::job::Stage::Failed, |job: &mut Job| {
                    job.failure_step = Some(format!("{}_STALE", stage.as_str()));
                    job.error_message = Some("job exceeded maximum time in active stage".to_string());
                })
                .await?;

            if claimed {
                warn!(job_id = %job.id, from_stage = %stage, "reconciler: swept stale job to FAILED");
                swept += 1;
            }
        }

        Ok(swept)
    }

    /// Runs the sweep on a fixed interval until `shutdown_rx` fires.
    pub async fn run(self, mut shutdown_rx: tokio::sync::broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        info!(interval_secs = self.interval.as_secs(), "stale-job reconciler started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("stale-job reconciler received shutdown");
                    break;
                }
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(0) => {}
                        Ok(n) => info!(swept = n, "reconciler: swept stale jobs"),
                        Err(e) => warn!(error = %e, "reconciler: sweep failed"),
                    }
                }
            }
        }
    }
}
