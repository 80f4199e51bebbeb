//! Configuration for the pipeline service.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Job store / bus
    pub database_url: String,
    pub redis_url: Option<String>,

    #[serde(default = "default_message_bus_type")]
    pub message_bus_type: String,
    pub nats_url: Option<String>,
    #[serde(default = "default_message_bus_stream")]
    pub message_bus_stream: String,

    // Channel selection
    pub shorts_channel_id: String,

    // Collaborator endpoints
    pub llm_endpoint: String,
    #[serde(default)]
    pub llm_api_keys: Vec<String>,
    pub tts_endpoint: String,
    pub clip_search_endpoint: String,
    pub renderer_endpoint: String,
    pub upload_endpoint: String,
    pub upload_title_check_endpoint: String,
    pub safety_classifier_endpoint: String,
    pub similarity_classifier_endpoint: String,
    pub notification_endpoint: Option<String>,

    // Concurrency
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_scripting_workers")]
    pub scripting_workers: usize,
    #[serde(default = "default_assets_workers")]
    pub assets_workers: usize,
    #[serde(default = "default_rendering_workers")]
    pub rendering_workers: usize,
    #[serde(default = "default_upload_workers")]
    pub upload_workers: usize,

    // Circuit breaker
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_circuit_breaker_timeout")]
    pub circuit_breaker_open_duration_secs: u64,
    #[serde(default = "default_llm_key_cooldown")]
    pub llm_key_cooldown_secs: u64,

    // Upload scheduler
    #[serde(default = "default_scheduler_tick_secs")]
    pub scheduler_tick_secs: u64,
    #[serde(default = "default_daily_quota")]
    pub daily_upload_quota: u32,

    // Stale-job reconciler
    #[serde(default = "default_reconciler_interval_secs")]
    pub reconciler_interval_secs: u64,
    #[serde(default = "default_stale_job_max_age_secs")]
    pub stale_job_max_age_secs: u64,

    // Admin HTTP surface
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    // Metrics server
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,

    // Logging
    #[serde(default = "default_log_json")]
    pub log_json: bool,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_message_bus_type() -> String {
    "redis".to_string()
}
fn default_message_bus_stream() -> String {
    "pipeline:events".to_string()
}
fn default_max_concurrent_requests() -> usize {
    10
}
fn default_scripting_workers() -> usize {
    2
}
fn default_assets_workers() -> usize {
    2
}
fn default_rendering_workers() -> usize {
    1
}
fn default_upload_workers() -> usize {
    1
}
fn default_circuit_breaker_threshold() -> u32 {
    5
}
fn default_circuit_breaker_timeout() -> u64 {
    30
}
fn default_llm_key_cooldown() -> u64 {
    600
}
fn default_scheduler_tick_secs() -> u64 {
    300
}
fn default_daily_quota() -> u32 {
    50
}
fn default_reconciler_interval_secs() -> u64 {
    60
}
fn default_stale_job_max_age_secs() -> u64 {
    3600
}
fn default_admin_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_log_json() -> bool {
    false
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::Environment::default().separator("__").try_parsing(true))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            anyhow::bail!("DATABASE_URL is required");
        }
        if self.shorts_channel_id.is_empty() {
            anyhow::bail!("SHORTS_CHANNEL_ID is required");
        }
        Ok(())
    }

    pub fn message_bus_url(&self) -> Option<&str> {
        match self.message_bus_type.as_str() {
            "redis" | "redis_streams" => self.redis_url.as_deref(),
            "nats" | "nats_jetstream" => self.nats_url.as_deref(),
            _ => None,
        }
    }

    pub fn has_message_bus(&self) -> bool {
        self.message_bus_url().is_some()
    }
}

/// Resolved once at startup from `SHORTS_CHANNEL_ID` (§4.8). Carries every
/// behavioral knob a per-channel worker needs; no global mutable state.
#[derive(Debug, Clone)]
pub struct ChannelBehavior {
    pub channel_id: String,
    pub channel_name: String,
    pub is_long_form: bool,
    pub daily_limit: u32,
    pub use_async_flow: bool,
    pub requires_strict_date_check: bool,
    pub should_aggregate_news: bool,
    pub requires_native_title: bool,
    pub native_title_unicode_range: Option<(u32, u32)>,
    pub bgm_category: String,
    pub upload_interval_hours: f64,
    pub default_tags: Vec<String>,
    pub default_hashtags: Vec<String>,
    pub timezone: String,
}

impl ChannelBehavior {
    /// The sentinel channel that accepts events for any channel and skips
    /// the content-producing stages it doesn't own (§4.8).
    pub const RENDERER_SENTINEL: &'static str = "renderer";

    pub fn should_skip_generation(&self) -> bool {
        self.channel_id == Self::RENDERER_SENTINEL
    }

    pub fn script_system_prompt(&self) -> String {
        format!(
            "You are writing a short-form video script for the \"{}\" channel. Keep scenes under 15 seconds of narration each.",
            self.channel_name
        )
    }

    pub fn extra_prompt(&self, today_iso: &str) -> String {
        if self.requires_strict_date_check {
            format!("Today is {}. Only reference events confirmed to have happened today.", today_iso)
        } else {
            String::new()
        }
    }

    /// Resolves all known channels from a compiled table, overridable by
    /// per-channel System Settings read from the store at runtime (§10.3).
    pub fn known_channels() -> HashMap<String, ChannelBehavior> {
        let mut channels = HashMap::new();

        channels.insert(
            "news-shorts".to_string(),
            ChannelBehavior {
                channel_id: "news-shorts".to_string(),
                channel_name: "News Shorts".to_string(),
                is_long_form: false,
                daily_limit: 20,
                use_async_flow: true,
                requires_strict_date_check: true,
                should_aggregate_news: false,
                requires_native_title: false,
                native_title_unicode_range: None,
                bgm_category: "news".to_string(),
                upload_interval_hours: 1.0,
                default_tags: vec!["news".into(), "shorts".into()],
                default_hashtags: vec!["#news".into(), "#shorts".into()],
                timezone: "UTC".to_string(),
            },
        );

        channels.insert(
            "korean-news-shorts".to_string(),
            ChannelBehavior {
                channel_id: "korean-news-shorts".to_string(),
                channel_name: "Korean News Shorts".to_string(),
                is_long_form: false,
                daily_limit: 15,
                use_async_flow: true,
                requires_strict_date_check: true,
                should_aggregate_news: true,
                requires_native_title: true,
                native_title_unicode_range: Some((0xAC00, 0xD7A3)),
                bgm_category: "news".to_string(),
                upload_interval_hours: 1.5,
                default_tags: vec!["뉴스".into(), "shorts".into()],
                default_hashtags: vec!["#뉴스".into(), "#shorts".into()],
                timezone: "Asia/Seoul".to_string(),
            },
        );

        channels.insert(
            Self::RENDERER_SENTINEL.to_string(),
            ChannelBehavior {
                channel_id: Self::RENDERER_SENTINEL.to_string(),
                channel_name: "Renderer (all channels)".to_string(),
                is_long_form: false,
                daily_limit: 0,
                use_async_flow: true,
                requires_strict_date_check: false,
                should_aggregate_news: false,
                requires_native_title: false,
                native_title_unicode_range: None,
                bgm_category: String::new(),
                upload_interval_hours: 0.0,
                default_tags: vec![],
                default_hashtags: vec![],
                timezone: "UTC".to_string(),
            },
        );

        channels
    }

    pub fn resolve(channel_id: &str) -> Option<ChannelBehavior> {
        Self::known_channels().remove(channel_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_channel() {
        let behavior = ChannelBehavior::resolve("news-shorts").expect("known channel");
        assert_eq!(behavior.channel_name, "News Shorts");
        assert!(!behavior.should_skip_generation());
    }

    #[test]
    fn renderer_sentinel_skips_generation() {
        let behavior = ChannelBehavior::resolve(ChannelBehavior::RENDERER_SENTINEL).unwrap();
        assert!(behavior.should_skip_generation());
    }

    #[test]
    fn unknown_channel_resolves_to_none() {
        assert!(ChannelBehavior::resolve("does-not-exist").is_none());
    }
}
