//! Shortform Pipeline Service
//!
//! Orchestrates a news item from ingestion through scripting, asset
//! production, rendering, and upload:
//! - Postgres-backed job store with atomic (CAS) stage transitions
//! - Event bus output (Redis Streams / NATS JetStream)
//! - Semaphore-bounded stage workers per collaborator
//! - Upload scheduler with quota and cadence gating
//! - Retry / regeneration controller and stale-job reconciler
//! - Admin HTTP surface and Prometheus metrics

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shortform_pipeline::admin::{self, AdminState};
use shortform_pipeline::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use shortform_pipeline::claim::ClaimService;
use shortform_pipeline::collaborators::http::{
    HttpAssetProducer, HttpClassifier, HttpNotificationSink, HttpRenderer, HttpScriptGenerator, HttpUploadClient,
};
use shortform_pipeline::collaborators::NotificationSink;
use shortform_pipeline::config::{ChannelBehavior, Config};
use shortform_pipeline::gate::IngestionGate;
use shortform_pipeline::http_client::{HttpClientConfig, ResilientHttpClient, SourceHttpClient};
use shortform_pipeline::key_pool::LlmKeyPool;
use shortform_pipeline::message_bus::{create_message_bus, MessageBusConfig, MessageBusType, ResilientPublisher};
use shortform_pipeline::metrics;
use shortform_pipeline::reconciler::StaleJobReconciler;
use shortform_pipeline::retry::RetryController;
use shortform_pipeline::scheduler::UploadScheduler;
use shortform_pipeline::store::JobStore;
use shortform_pipeline::upload_worker::UploadWorker;
use shortform_pipeline::workers::{AssetsWorker, RenderingWorker, ScriptingWorker};

#[derive(Parser, Debug)]
#[command(name = "shortform-pipeline")]
#[command(author = "Shortform Pipeline Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Distributed job-orchestration engine for a news-to-video pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every worker, the scheduler, the reconciler, and the admin/metrics servers.
    Serve,

    /// Print the resolved channel behavior and current job counts by stage.
    Status,

    /// Run one upload-scheduler tick for the configured channel and exit.
    TriggerScheduler,

    /// Run one stale-job reconciler sweep and exit.
    TriggerCleanup,
}

fn setup_logging(log_level: &str, json_output: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_output {
        tracing_subscriber::registry().with(filter).with(fmt::layer().json()).init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("received SIGTERM, initiating graceful shutdown"),
    }

    let _ = shutdown_tx.send(());
}

/// Everything wired up once at startup: the store, the channel behavior,
/// claim service, bus publisher, and every collaborator. Built once in
/// `main` and shared by whichever subcommand runs.
struct Runtime {
    config: Config,
    channel: ChannelBehavior,
    store: JobStore,
    claims: ClaimService,
    bus: Arc<dyn shortform_pipeline::message_bus::MessageBus>,
    publisher: ResilientPublisher,
}

impl Runtime {
    async fn build(config: Config) -> Result<Self> {
        let store = JobStore::connect(&config.database_url).await?;
        let claims = ClaimService::new(store.clone());

        let channel = ChannelBehavior::resolve(&config.shorts_channel_id)
            .ok_or_else(|| anyhow::anyhow!("unknown channel: {}", config.shorts_channel_id))?;

        let bus_type: MessageBusType = config.message_bus_type.parse()?;
        let bus_url = config
            .message_bus_url()
            .ok_or_else(|| anyhow::anyhow!("no message bus URL configured for bus type {}", config.message_bus_type))?;
        let bus_config = MessageBusConfig {
            stream_name: config.message_bus_stream.clone(),
            ..Default::default()
        };
        let bus: Arc<dyn shortform_pipeline::message_bus::MessageBus> = Arc::from(create_message_bus(bus_type, bus_url, bus_config).await?);
        let publisher = ResilientPublisher::new(bus.clone(), 3, Duration::from_millis(500));

        Ok(Self { config, channel, store, claims, bus, publisher })
    }

    fn collaborator_client(&self, source_id: &str, rate_limit_rpm: u32) -> Result<SourceHttpClient> {
        let base = Arc::new(ResilientHttpClient::new(HttpClientConfig {
            max_concurrent_requests: self.config.max_concurrent_requests,
            ..Default::default()
        })?);
        let breaker = Arc::new(CircuitBreaker::new(
            source_id,
            CircuitBreakerConfig {
                failure_threshold: self.config.circuit_breaker_failure_threshold,
                open_duration: Duration::from_secs(self.config.circuit_breaker_open_duration_secs),
                ..Default::default()
            },
        ));
        Ok(SourceHttpClient::new(base, source_id, rate_limit_rpm, breaker))
    }

    fn notification_sink(&self) -> Result<Box<dyn NotificationSink>> {
        match &self.config.notification_endpoint {
            Some(endpoint) => {
                let client = self.collaborator_client("notifications", 60)?;
                Ok(Box::new(HttpNotificationSink::new(client, endpoint.clone())))
            }
            None => Ok(Box::new(NoopNotificationSink)),
        }
    }
}

struct NoopNotificationSink;

#[async_trait::async_trait]
impl NotificationSink for NoopNotificationSink {
    async fn notify_uploaded(&self, _channel_id: &str, _job_id: &str, _youtube_url: &str) {}
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level, cli.json_logs);

    info!(version = env!("CARGO_PKG_VERSION"), "starting shortform pipeline service");

    let config = Config::load()?;
    config.validate()?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Status => show_status(config).await,
        Commands::TriggerScheduler => trigger_scheduler(config).await,
        Commands::TriggerCleanup => trigger_cleanup(config).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    let runtime = Runtime::build(config).await?;
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let llm_keys = Arc::new(LlmKeyPool::new(
        runtime.config.llm_api_keys.clone(),
        Duration::from_secs(runtime.config.llm_key_cooldown_secs),
    ));

    let script_generator = Arc::new(HttpScriptGenerator::new(
        runtime.collaborator_client("llm", 60)?,
        runtime.config.llm_endpoint.clone(),
        llm_keys,
    ));
    let asset_producer = Arc::new(HttpAssetProducer::new(
        runtime.collaborator_client("tts", 60)?,
        runtime.config.tts_endpoint.clone(),
        runtime.collaborator_client("clip-search", 60)?,
        runtime.config.clip_search_endpoint.clone(),
    ));
    let renderer = Arc::new(HttpRenderer::new(runtime.collaborator_client("renderer", 30)?, runtime.config.renderer_endpoint.clone()));
    let upload_client: Box<dyn shortform_pipeline::collaborators::UploadClient> = Box::new(HttpUploadClient::new(
        runtime.collaborator_client("upload", 30)?,
        runtime.config.upload_endpoint.clone(),
        runtime.config.upload_title_check_endpoint.clone(),
    ));
    let classifier = runtime.collaborator_client("classifier", 60)?;
    let safety: Box<dyn shortform_pipeline::collaborators::SafetyClassifier> = Box::new(HttpClassifier::new(
        classifier.clone(),
        runtime.config.safety_classifier_endpoint.clone(),
        runtime.config.similarity_classifier_endpoint.clone(),
    ));
    let similarity: Box<dyn shortform_pipeline::collaborators::SimilarityClassifier> =
        Box::new(HttpClassifier::new(classifier, runtime.config.safety_classifier_endpoint.clone(), runtime.config.similarity_classifier_endpoint.clone()));

    let gate = Arc::new(IngestionGate::new(
        runtime.store.clone(),
        runtime.publisher.clone(),
        clone_upload_client(&runtime)?,
        similarity,
        safety,
    ));
    let scheduler = Arc::new(UploadScheduler::new(runtime.claims.clone(), runtime.publisher.clone(), runtime.config.daily_upload_quota));
    let reconciler = Arc::new(StaleJobReconciler::new(runtime.claims.clone(), runtime.config.stale_job_max_age_secs, runtime.config.reconciler_interval_secs));
    let retry_controller = Arc::new(RetryController::new(runtime.claims.clone(), runtime.publisher.clone()));
    let upload_worker = Arc::new(UploadWorker::new(runtime.claims.clone(), runtime.publisher.clone(), upload_client, runtime.notification_sink()?));

    let mut handles = Vec::new();

    {
        let consumer = runtime.bus.subscribe("pipeline-workers", "scripting").await?;
        let worker = ScriptingWorker::new(script_generator);
        let claims = runtime.claims.clone();
        let publisher = runtime.publisher.clone();
        let channel = runtime.channel.clone();
        let concurrency = runtime.config.scripting_workers;
        let shutdown_rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            worker.run(claims, publisher, channel, concurrency, consumer, shutdown_rx).await;
        }));
    }
    {
        let consumer = runtime.bus.subscribe("pipeline-workers", "assets").await?;
        let worker = AssetsWorker::new(asset_producer);
        let claims = runtime.claims.clone();
        let publisher = runtime.publisher.clone();
        let channel = runtime.channel.clone();
        let concurrency = runtime.config.assets_workers;
        let shutdown_rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            worker.run(claims, publisher, channel, concurrency, consumer, shutdown_rx).await;
        }));
    }
    {
        let consumer = runtime.bus.subscribe("pipeline-workers", "rendering").await?;
        let worker = RenderingWorker::new(renderer);
        let claims = runtime.claims.clone();
        let publisher = runtime.publisher.clone();
        let channel = runtime.channel.clone();
        let concurrency = runtime.config.rendering_workers;
        let shutdown_rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            worker.run(claims, publisher, channel, concurrency, consumer, shutdown_rx).await;
        }));
    }

    {
        let upload_worker = upload_worker.clone();
        let mut consumer = runtime.bus.subscribe("pipeline-workers", "upload").await?;
        let channel = runtime.channel.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = consumer.read(10, Duration::from_secs(5)) => {
                        let Ok(messages) = result else { continue };
                        for message in messages {
                            let job_id = match &message.payload {
                                shortform_pipeline::events::PipelineEvent::UploadRequested { job_id, .. }
                                | shortform_pipeline::events::PipelineEvent::VideoCreated { job_id, .. } => job_id.clone(),
                                _ => continue,
                            };
                            if let Err(e) = upload_worker.handle(&channel, &job_id).await {
                                error!(error = %e, job_id, "upload worker failed");
                            }
                        }
                    }
                }
            }
        }));
    }

    {
        let retry_controller = retry_controller.clone();
        let mut consumer = runtime.bus.subscribe("pipeline-workers", "retry").await?;
        let mut shutdown_rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = consumer.read(10, Duration::from_secs(5)) => {
                        let Ok(messages) = result else { continue };
                        for message in messages {
                            if let shortform_pipeline::events::PipelineEvent::UploadFailed { channel_id, job_id, reason } = message.payload {
                                if let Err(e) = retry_controller.handle_upload_failed(&channel_id, &job_id, &reason).await {
                                    error!(error = %e, job_id, "retry controller failed");
                                }
                            }
                        }
                    }
                }
            }
        }));
    }

    {
        let gate = gate.clone();
        let mut consumer = runtime.bus.subscribe("pipeline-workers", "regeneration").await?;
        let mut shutdown_rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = consumer.read(10, Duration::from_secs(5)) => {
                        let Ok(messages) = result else { continue };
                        for message in messages {
                            if let shortform_pipeline::events::PipelineEvent::RegenerationRequested { channel_id, job_id, title, summary, link } = message.payload {
                                if let Err(e) = gate.regenerate(&channel_id, &job_id, &title, &summary, &link).await {
                                    error!(error = %e, job_id, "ingestion gate: regeneration failed");
                                }
                            }
                        }
                    }
                }
            }
        }));
    }

    {
        let reconciler_loop = StaleJobReconciler::new(runtime.claims.clone(), runtime.config.stale_job_max_age_secs, runtime.config.reconciler_interval_secs);
        let shutdown_rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(reconciler_loop.run(shutdown_rx)));
    }

    {
        let scheduler = scheduler.clone();
        let channel = runtime.channel.clone();
        let tick = Duration::from_secs(runtime.config.scheduler_tick_secs);
        let mut shutdown_rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = scheduler.tick(&channel).await {
                            error!(error = %e, "scheduler tick failed");
                        }
                    }
                }
            }
        }));
    }

    if runtime.config.metrics_enabled {
        let addr = ([0, 0, 0, 0], runtime.config.metrics_port).into();
        handles.push(tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(addr).await {
                error!(error = %e, "metrics server failed");
            }
        }));
    }

    {
        let admin_state = Arc::new(AdminState {
            store: runtime.store.clone(),
            gate,
            scheduler,
            reconciler,
            channel: runtime.channel.clone(),
        });
        let addr = ([0, 0, 0, 0], runtime.config.admin_port).into();
        handles.push(tokio::spawn(async move {
            if let Err(e) = admin::serve(addr, admin_state).await {
                error!(error = %e, "admin server failed");
            }
        }));
    }

    shutdown_signal(shutdown_tx).await;
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

fn clone_upload_client(runtime: &Runtime) -> Result<Box<dyn shortform_pipeline::collaborators::UploadClient>> {
    let client = runtime.collaborator_client("upload", 30)?;
    Ok(Box::new(HttpUploadClient::new(client, runtime.config.upload_endpoint.clone(), runtime.config.upload_title_check_endpoint.clone())))
}

async fn show_status(config: Config) -> Result<()> {
    let runtime = Runtime::build(config).await?;
    let active = runtime.store.count_active(&runtime.channel.channel_id).await?;
    info!(channel = %runtime.channel.channel_id, active_jobs = active, "status");
    Ok(())
}

async fn trigger_scheduler(config: Config) -> Result<()> {
    let runtime = Runtime::build(config).await?;
    let scheduler = UploadScheduler::new(runtime.claims.clone(), runtime.publisher.clone(), runtime.config.daily_upload_quota);
    let outcome = scheduler.tick(&runtime.channel).await?;
    info!(?outcome, "scheduler tick complete");
    Ok(())
}

async fn trigger_cleanup(config: Config) -> Result<()> {
    let runtime = Runtime::build(config).await?;
    let reconciler = StaleJobReconciler::new(runtime.claims.clone(), runtime.config.stale_job_max_age_secs, runtime.config.reconciler_interval_secs);
    let swept = reconciler.sweep_once().await?;
    info!(swept, "cleanup sweep complete");
    Ok(())
}
