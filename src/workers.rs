//! Stage workers: Scripting, Assets, Rendering. Each subscribes to its
//! input topic, claims the job, invokes its collaborator, and publishes
//! the next-stage event (§4.4). Built on the same semaphore-bounded
//! concurrency idiom as the teacher's worker pool, but the unit of work
//! is a bus message rather than an in-process mpsc item.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Semaphore};
use tracing::{error, info, warn, Instrument};

use crate::claim::ClaimService;
use crate::collaborators::{AssetProducer, ProgressSink, Renderer, ScriptGenerator};
use crate::config::ChannelBehavior;
use crate::events::PipelineEvent;
use crate::job::{Job, Stage};
use crate::message_bus::{Message, MessageConsumer, ResilientPublisher};
use crate::metrics;

/// Writes progress callbacks straight to the job store. Best-effort: a
/// failed write here never fails the stage (§4.4 tie-break policy).
struct StoreProgressSink {
    store: crate::store::JobStore,
    job_id: String,
}

#[async_trait]
impl ProgressSink for StoreProgressSink {
    async fn report(&self, progress: u8, step: &str) {
        if let Err(e) = self.store.update_progress(&self.job_id, progress, step).await {
            warn!(job_id = %self.job_id, error = %e, "progress write failed");
        }
    }
}

/// Shared shape every stage worker follows: read a batch, drop messages
/// for the wrong channel, claim, invoke the collaborator, advance.
struct StageRunner {
    claims: ClaimService,
    publisher: ResilientPublisher,
    channel: ChannelBehavior,
    concurrency: usize,
    shutdown_rx: broadcast::Receiver<()>,
}

impl StageRunner {
    async fn run_loop<F, Fut>(
        mut self,
        stage_name: &'static str,
        mut consumer: Box<dyn MessageConsumer>,
        handle_one: F,
    ) where
        F: Fn(Arc<StageShared>, Message<PipelineEvent>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let shared = Arc::new(StageShared {
            claims: self.claims.clone(),
            publisher: self.publisher,
            channel: self.channel.clone(),
        });
        let handle_one = Arc::new(handle_one);

        info!(stage = stage_name, concurrency = self.concurrency, "stage worker started");

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!(stage = stage_name, "stage worker received shutdown");
                    break;
                }
                result = consumer.read(10, Duration::from_secs(5)) => {
                    let messages = match result {
                        Ok(m) => m,
                        Err(e) => {
                            error!(stage = stage_name, error = %e, "bus read failed");
                            continue;
                        }
                    };

                    for message in messages {
                        if message.payload.channel_id().is_some_and(|id| id != shared.channel.channel_id) {
                            continue;
                        }

                        let permit = semaphore.clone().acquire_owned().await;
                        let Ok(permit) = permit else { continue };

                        let shared = shared.clone();
                        let handle_one = handle_one.clone();
                        tokio::spawn(
                            async move {
                                metrics::inc_active_workers(stage_name);
                                handle_one(shared, message).await;
                                metrics::dec_active_workers(stage_name);
                                drop(permit);
                            }
                            .instrument(tracing::debug_span!("stage_worker", stage = stage_name)),
                        );
                    }
                }
            }
        }
    }
}

struct StageShared {
    claims: ClaimService,
    publisher: ResilientPublisher,
    channel: ChannelBehavior,
}

/// Scripting stage: `ScriptCreated` is published once the LLM collaborator
/// produces a non-empty scene list.
pub struct ScriptingWorker {
    generator: Arc<dyn ScriptGenerator>,
}

impl ScriptingWorker {
    pub fn new(generator: Arc<dyn ScriptGenerator>) -> Self {
        Self { generator }
    }

    pub async fn run(
        self,
        claims: ClaimService,
        publisher: ResilientPublisher,
        channel: ChannelBehavior,
        concurrency: usize,
        consumer: Box<dyn MessageConsumer>,
        shutdown_rx: broadcast::Receiver<()>,
    ) {
        let runner = StageRunner {
            claims,
            publisher,
            channel,
            concurrency,
            shutdown_rx,
        };
        let generator = self.generator;

        runner
            .run_loop(metrics::STAGE_SCRIPTING, consumer, move |shared, message| {
                let generator = generator.clone();
                async move {
                    let PipelineEvent::IngestNewItem { channel_id, url, title, summary } = message.payload else {
                        return;
                    };

                    let Ok(Some(job)) = shared.claims.store().find_by_link(&channel_id, &url).await else {
                        warn!(channel_id = %channel_id, url = %url, "scripting: ingested job not found yet");
                        return;
                    };
                    let job_id = job.id;

                    if !shared.claims.claim(&job_id, Stage::Queued, Stage::Scripting).await.unwrap_or(false) {
                        metrics::record_claim_attempt(metrics::STAGE_SCRIPTING, "contended");
                        return;
                    }
                    metrics::record_claim_attempt(metrics::STAGE_SCRIPTING, "won");

                    let progress = StoreProgressSink {
                        store: shared.claims.store().clone(),
                        job_id: job_id.clone(),
                    };
                    let prompt = shared.channel.script_system_prompt();

                    match generator.generate(&title, &summary, &prompt, &progress).await {
                        Ok(draft) => {
                            let claimed = shared
                                .claims
                                .claim_with(&job_id, Stage::Scripting, Stage::AssetsQueued, |job: &mut Job| {
                                    job.description = draft.description.clone();
                                    job.tags = draft.tags.clone();
                                    job.scenes = draft.scenes.clone();
                                })
                                .await
                                .unwrap_or(false);

                            if claimed {
                                shared
                                    .publisher
                                    .publish(&PipelineEvent::ScriptCreated { channel_id: shared.channel.channel_id.clone(), job_id: job_id.clone() })
                                    .await
                                    .ok();
                            }
                        }
                        Err(e) => {
                            warn!(job_id = %job_id, error = %e, "scripting failed");
                            shared
                                .claims
                                .claim_with(&job_id, Stage::Scripting, Stage::Failed, |job: &mut Job| {
                                    job.failure_step = Some("SCRIPTING".to_string());
                                    job.error_message = Some(e.to_string());
                                })
                                .await
                                .ok();
                            metrics::record_error(metrics::STAGE_SCRIPTING, "collaborator_failure");
                        }
                    }
                }
            })
            .await;
    }
}

/// Assets stage: TTS + clip search per scene.
pub struct AssetsWorker {
    producer: Arc<dyn AssetProducer>,
}

impl AssetsWorker {
    pub fn new(producer: Arc<dyn AssetProducer>) -> Self {
        Self { producer }
    }

    pub async fn run(
        self,
        claims: ClaimService,
        publisher: ResilientPublisher,
        channel: ChannelBehavior,
        concurrency: usize,
        consumer: Box<dyn MessageConsumer>,
        shutdown_rx: broadcast::Receiver<()>,
    ) {
        let runner = StageRunner {
            claims,
            publisher,
            channel,
            concurrency,
            shutdown_rx,
        };
        let producer = self.producer;

        runner
            .run_loop(metrics::STAGE_ASSETS, consumer, move |shared, message| {
                let producer = producer.clone();
                async move {
                    let PipelineEvent::ScriptCreated { job_id, .. } = message.payload else {
                        return;
                    };

                    if !shared.claims.claim(&job_id, Stage::AssetsQueued, Stage::AssetsGenerating).await.unwrap_or(false) {
                        metrics::record_claim_attempt(metrics::STAGE_ASSETS, "contended");
                        return;
                    }
                    metrics::record_claim_attempt(metrics::STAGE_ASSETS, "won");

                    let Ok(Some(job)) = shared.claims.store().get(&job_id).await else {
                        return;
                    };

                    let progress = StoreProgressSink {
                        store: shared.claims.store().clone(),
                        job_id: job_id.clone(),
                    };

                    match producer.produce(&job.scenes, &progress).await {
                        Ok(assets) => {
                            let claimed = shared
                                .claims
                                .claim_with(&job_id, Stage::AssetsGenerating, Stage::RenderQueued, |job: &mut Job| {
                                    for scene in job.scenes.iter_mut() {
                                        if let Some(a) = assets.iter().find(|a| a.index == scene.index) {
                                            scene.audio_path = Some(a.audio_path.clone());
                                            scene.clip_path = Some(a.clip_path.clone());
                                        }
                                    }
                                })
                                .await
                                .unwrap_or(false);

                            if claimed {
                                shared
                                    .publisher
                                    .publish(&PipelineEvent::AssetsReady { channel_id: shared.channel.channel_id.clone(), job_id: job_id.clone() })
                                    .await
                                    .ok();
                            }
                        }
                        Err(e) => {
                            warn!(job_id = %job_id, error = %e, "asset production failed");
                            shared
                                .claims
                                .claim_with(&job_id, Stage::AssetsGenerating, Stage::Failed, |job: &mut Job| {
                                    job.failure_step = Some("ASSETS_GENERATING".to_string());
                                    job.error_message = Some(e.to_string());
                                })
                                .await
                                .ok();
                            metrics::record_error(metrics::STAGE_ASSETS, "collaborator_failure");
                        }
                    }
                }
            })
            .await;
    }
}

/// Rendering stage: composites scene assets into the final artifact. The
/// `"renderer"` sentinel channel accepts events for any channel (§4.8).
pub struct RenderingWorker {
    renderer: Arc<dyn Renderer>,
}

impl RenderingWorker {
    pub fn new(renderer: Arc<dyn Renderer>) -> Self {
        Self { renderer }
    }

    pub async fn run(
        self,
        claims: ClaimService,
        publisher: ResilientPublisher,
        channel: ChannelBehavior,
        concurrency: usize,
        consumer: Box<dyn MessageConsumer>,
        shutdown_rx: broadcast::Receiver<()>,
    ) {
        let runner = StageRunner {
            claims,
            publisher,
            channel,
            concurrency,
            shutdown_rx,
        };
        let renderer = self.renderer;

        runner
            .run_loop(metrics::STAGE_RENDERING, consumer, move |shared, message| {
                let renderer = renderer.clone();
                async move {
                    let PipelineEvent::AssetsReady { job_id, channel_id } = message.payload else {
                        return;
                    };

                    if !shared.channel.should_skip_generation() && channel_id != shared.channel.channel_id {
                        return;
                    }

                    if !shared.claims.claim(&job_id, Stage::RenderQueued, Stage::Rendering).await.unwrap_or(false) {
                        metrics::record_claim_attempt(metrics::STAGE_RENDERING, "contended");
                        return;
                    }
                    metrics::record_claim_attempt(metrics::STAGE_RENDERING, "won");

                    let Ok(Some(job)) = shared.claims.store().get(&job_id).await else {
                        return;
                    };

                    let assets: Vec<_> = job
                        .scenes
                        .iter()
                        .filter_map(|s| {
                            Some(crate::collaborators::SceneAssets {
                                index: s.index,
                                audio_path: s.audio_path.clone()?,
                                clip_path: s.clip_path.clone()?,
                            })
                        })
                        .collect();

                    if assets.len() != job.scenes.len() {
                        shared
                            .claims
                            .claim_with(&job_id, Stage::Rendering, Stage::Failed, |job: &mut Job| {
                                job.failure_step = Some("RENDERING".to_string());
                                job.error_message = Some("incomplete scene assets".to_string());
                            })
                            .await
                            .ok();
                        return;
                    }

                    let progress = StoreProgressSink {
                        store: shared.claims.store().clone(),
                        job_id: job_id.clone(),
                    };

                    match renderer.render(&job_id, &assets, &shared.channel.bgm_category, &progress).await {
                        Ok(output) => {
                            shared
                                .claims
                                .claim_with(&job_id, Stage::Rendering, Stage::Completed, |job: &mut Job| {
                                    job.file_path = Some(output.file_path.clone());
                                    job.thumbnail_path = Some(output.thumbnail_path.clone());
                                    job.progress = 100;
                                    job.current_step = "rendered".to_string();
                                })
                                .await
                                .ok();
                        }
                        Err(e) => {
                            warn!(job_id = %job_id, error = %e, "rendering failed");
                            shared
                                .claims
                                .claim_with(&job_id, Stage::Rendering, Stage::Failed, |job: &mut Job| {
                                    job.failure_step = Some("RENDERING".to_string());
                                    job.error_message = Some(e.to_string());
                                })
                                .await
                                .ok();
                            metrics::record_error(metrics::STAGE_RENDERING, "collaborator_failure");
                        }
                    }
                }
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripting_worker_holds_generator() {
        struct NoopGen;
        #[async_trait]
        impl ScriptGenerator for NoopGen {
            async fn generate(&self, _: &str, _: &str, _: &str, _: &dyn ProgressSink) -> crate::error::Result<crate::collaborators::ScriptDraft> {
                unreachable!()
            }
        }
        let _worker = ScriptingWorker::new(Arc::new(NoopGen));
    }
}
