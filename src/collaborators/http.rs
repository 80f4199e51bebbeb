//! HTTP-backed collaborator implementations. Each wraps a
//! `SourceHttpClient` (circuit breaker + per-collaborator rate limit)
//! from `crate::http_client`, following the same call shape the teacher
//! used for its market-data sources.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PipelineError, Result};
use crate::http_client::SourceHttpClient;
use crate::job::Scene;
use crate::key_pool::LlmKeyPool;

use super::{
    AssetProducer, NotificationSink, ProgressSink, RenderOutput, Renderer, SafetyClassifier, SceneAssets,
    ScriptDraft, ScriptGenerator, SimilarityClassifier, UploadClient, UploadOutcome,
};

/// LLM-backed script generator. Invokes the configured LLM endpoint
/// through the key pool so a rate-limited or failing key is rotated out
/// without surfacing a stage failure.
pub struct HttpScriptGenerator {
    client: SourceHttpClient,
    endpoint: String,
    keys: Arc<LlmKeyPool>,
}

impl HttpScriptGenerator {
    pub fn new(client: SourceHttpClient, endpoint: String, keys: Arc<LlmKeyPool>) -> Self {
        Self { client, endpoint, keys }
    }
}

#[derive(Serialize)]
struct ScriptRequest<'a> {
    title: &'a str,
    summary: &'a str,
    system_prompt: &'a str,
}

#[derive(Deserialize)]
struct ScriptResponse {
    description: String,
    tags: Vec<String>,
    scenes: Vec<SceneDraft>,
}

#[derive(Deserialize)]
struct SceneDraft {
    narration: String,
    clip_query: Option<String>,
}

#[async_trait]
impl ScriptGenerator for HttpScriptGenerator {
    async fn generate(&self, title: &str, summary: &str, system_prompt: &str, progress: &dyn ProgressSink) -> Result<ScriptDraft> {
        progress.report(5, "requesting script").await;

        let key = self.keys.select().ok_or(PipelineError::CircuitBreakerOpen("llm".into()))?;
        let body = ScriptRequest { title, summary, system_prompt };

        let result = self
            .client
            .inner_client()
            .post(&self.endpoint)
            .bearer_auth(&key)
            .json(&body)
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                self.keys.report(&key, false);
                return Err(PipelineError::HttpError(e));
            }
        };

        if response.status().as_u16() == 429 {
            self.keys.report(&key, false);
            return Err(PipelineError::RateLimitExceeded);
        }
        if !response.status().is_success() {
            self.keys.report(&key, false);
            return Err(PipelineError::ApiError {
                code: response.status().to_string(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        self.keys.report(&key, true);
        let parsed: ScriptResponse = response.json().await?;

        if parsed.scenes.is_empty() {
            return Err(PipelineError::ValidationFailed {
                job_id: title.to_string(),
                errors: vec!["LLM returned zero scenes".to_string()],
            });
        }

        progress.report(20, "script received").await;

        Ok(ScriptDraft {
            description: parsed.description,
            tags: parsed.tags,
            scenes: parsed
                .scenes
                .into_iter()
                .enumerate()
                .map(|(i, s)| Scene {
                    index: i as u32,
                    narration: s.narration,
                    clip_query: s.clip_query,
                    clip_path: None,
                    audio_path: None,
                })
                .collect(),
        })
    }
}

/// TTS + clip-search collaborator. Calls two configured endpoints per
/// scene; an empty result set for any scene fails the whole stage
/// (§4.4: "empty outputs are treated as stage failure").
pub struct HttpAssetProducer {
    tts_client: SourceHttpClient,
    tts_endpoint: String,
    clip_client: SourceHttpClient,
    clip_endpoint: String,
}

impl HttpAssetProducer {
    pub fn new(tts_client: SourceHttpClient, tts_endpoint: String, clip_client: SourceHttpClient, clip_endpoint: String) -> Self {
        Self {
            tts_client,
            tts_endpoint,
            clip_client,
            clip_endpoint,
        }
    }
}

#[derive(Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
}
#[derive(Deserialize)]
struct TtsResponse {
    audio_path: String,
}
#[derive(Serialize)]
struct ClipRequest<'a> {
    query: &'a str,
}
#[derive(Deserialize)]
struct ClipResponse {
    clip_path: Option<String>,
}

#[async_trait]
impl AssetProducer for HttpAssetProducer {
    async fn produce(&self, scenes: &[Scene], progress: &dyn ProgressSink) -> Result<Vec<SceneAssets>> {
        let mut out = Vec::with_capacity(scenes.len());
        let total = scenes.len().max(1);

        for scene in scenes {
            let tts: TtsResponse = self
                .tts_client
                .inner_client()
                .post(&self.tts_endpoint)
                .json(&TtsRequest { text: &scene.narration })
                .send()
                .await?
                .json()
                .await?;

            let query = scene.clip_query.clone().unwrap_or_else(|| scene.narration.clone());
            let clip: ClipResponse = self
                .clip_client
                .inner_client()
                .post(&self.clip_endpoint)
                .json(&ClipRequest { query: &query })
                .send()
                .await?
                .json()
                .await?;

            let Some(clip_path) = clip.clip_path else {
                warn!(scene = scene.index, "clip search returned no result");
                return Err(PipelineError::ValidationFailed {
                    job_id: scene.index.to_string(),
                    errors: vec!["no clip found for scene".to_string()],
                });
            };

            out.push(SceneAssets {
                index: scene.index,
                audio_path: tts.audio_path,
                clip_path,
            });

            progress
                .report(20 + ((scene.index as usize + 1) * 50 / total) as u8, "asset produced")
                .await;
        }

        Ok(out)
    }
}

/// Renderer collaborator: hands off scene assets to the rendering
/// executable's HTTP front, receiving back the container and thumbnail
/// paths.
pub struct HttpRenderer {
    client: SourceHttpClient,
    endpoint: String,
}

impl HttpRenderer {
    pub fn new(client: SourceHttpClient, endpoint: String) -> Self {
        Self { client, endpoint }
    }
}

#[derive(Serialize)]
struct RenderRequest<'a> {
    job_id: &'a str,
    scenes: &'a [SceneAssets],
    bgm_category: &'a str,
}
#[derive(Deserialize)]
struct RenderResponse {
    file_path: String,
    thumbnail_path: String,
}

#[async_trait]
impl Renderer for HttpRenderer {
    async fn render(&self, job_id: &str, assets: &[SceneAssets], bgm_category: &str, progress: &dyn ProgressSink) -> Result<RenderOutput> {
        progress.report(75, "rendering").await;
        let resp: RenderResponse = self
            .client
            .inner_client()
            .post(&self.endpoint)
            .json(&RenderRequest { job_id, scenes: assets, bgm_category })
            .send()
            .await?
            .json()
            .await?;
        progress.report(95, "render complete").await;
        Ok(RenderOutput {
            file_path: resp.file_path,
            thumbnail_path: resp.thumbnail_path,
        })
    }
}

/// Upload target collaborator.
pub struct HttpUploadClient {
    client: SourceHttpClient,
    upload_endpoint: String,
    title_check_endpoint: String,
}

impl HttpUploadClient {
    pub fn new(client: SourceHttpClient, upload_endpoint: String, title_check_endpoint: String) -> Self {
        Self {
            client,
            upload_endpoint,
            title_check_endpoint,
        }
    }
}

#[derive(Serialize)]
struct UploadRequest<'a> {
    file_path: &'a str,
    thumbnail_path: &'a str,
    title: &'a str,
    description: &'a str,
    tags: &'a [String],
}
#[derive(Deserialize)]
struct UploadResponse {
    youtube_url: Option<String>,
    error: Option<String>,
}

#[async_trait]
impl UploadClient for HttpUploadClient {
    async fn upload(
        &self,
        file_path: &str,
        thumbnail_path: &str,
        title: &str,
        description: &str,
        tags: &[String],
    ) -> Result<UploadOutcome> {
        let response = self
            .client
            .inner_client()
            .post(&self.upload_endpoint)
            .json(&UploadRequest {
                file_path,
                thumbnail_path,
                title,
                description,
                tags,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            if body.to_lowercase().contains("quota") {
                return Ok(UploadOutcome::QuotaExceeded);
            }
            return Ok(UploadOutcome::Transient { reason: body });
        }

        let parsed: UploadResponse = response.json().await?;
        match parsed.youtube_url {
            Some(url) => Ok(UploadOutcome::Success { youtube_url: url }),
            None => {
                let reason = parsed.error.unwrap_or_else(|| "unknown upload failure".to_string());
                if reason.to_lowercase().contains("quota") {
                    Ok(UploadOutcome::QuotaExceeded)
                } else {
                    Ok(UploadOutcome::Transient { reason })
                }
            }
        }
    }

    async fn title_exists(&self, channel_id: &str, title: &str) -> Result<bool> {
        #[derive(Deserialize)]
        struct Resp {
            exists: bool,
        }
        let resp: Resp = self
            .client
            .inner_client()
            .get(&self.title_check_endpoint)
            .query(&[("channel_id", channel_id), ("title", title)])
            .send()
            .await?
            .json()
            .await?;
        Ok(resp.exists)
    }
}

/// Safety/similarity classifier collaborator shared endpoint.
pub struct HttpClassifier {
    client: SourceHttpClient,
    safety_endpoint: String,
    similarity_endpoint: String,
}

impl HttpClassifier {
    pub fn new(client: SourceHttpClient, safety_endpoint: String, similarity_endpoint: String) -> Self {
        Self {
            client,
            safety_endpoint,
            similarity_endpoint,
        }
    }
}

#[derive(Serialize)]
struct SafetyRequest<'a> {
    title: &'a str,
    summary: &'a str,
}
#[derive(Deserialize)]
struct SafetyResponse {
    safe: bool,
}

#[async_trait]
impl SafetyClassifier for HttpClassifier {
    async fn is_safe(&self, title: &str, summary: &str) -> Result<bool> {
        let resp: SafetyResponse = self
            .client
            .inner_client()
            .post(&self.safety_endpoint)
            .json(&SafetyRequest { title, summary })
            .send()
            .await?
            .json()
            .await?;
        Ok(resp.safe)
    }
}

#[derive(Serialize)]
struct SimilarityRequest<'a> {
    title: &'a str,
    summary: &'a str,
    recent_titles: &'a [String],
}
#[derive(Deserialize)]
struct SimilarityResponse {
    too_similar: bool,
}

#[async_trait]
impl SimilarityClassifier for HttpClassifier {
    async fn is_too_similar(&self, title: &str, summary: &str, recent_titles: &[String]) -> Result<bool> {
        let result = self
            .client
            .inner_client()
            .post(&self.similarity_endpoint)
            .json(&SimilarityRequest { title, summary, recent_titles })
            .send()
            .await;

        // Per spec: classifier failure defaults to accept (not too similar).
        match result {
            Ok(response) if response.status().is_success() => {
                let parsed: SimilarityResponse = response.json().await.unwrap_or(SimilarityResponse { too_similar: false });
                Ok(parsed.too_similar)
            }
            _ => {
                warn!("similarity classifier unavailable, defaulting to accept");
                Ok(false)
            }
        }
    }
}

/// Webhook-style notification sink.
pub struct HttpNotificationSink {
    client: SourceHttpClient,
    endpoint: String,
}

impl HttpNotificationSink {
    pub fn new(client: SourceHttpClient, endpoint: String) -> Self {
        Self { client, endpoint }
    }
}

#[derive(Serialize)]
struct NotifyRequest<'a> {
    channel_id: &'a str,
    job_id: &'a str,
    youtube_url: &'a str,
}

#[async_trait]
impl NotificationSink for HttpNotificationSink {
    async fn notify_uploaded(&self, channel_id: &str, job_id: &str, youtube_url: &str) {
        let result = self
            .client
            .inner_client()
            .post(&self.endpoint)
            .json(&NotifyRequest { channel_id, job_id, youtube_url })
            .send()
            .await;
        if let Err(e) = result {
            warn!(error = %e, job_id, "upload notification failed");
        }
    }
}
