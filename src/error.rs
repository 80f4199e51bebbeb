//! Error types for the pipeline service

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Circuit breaker open for collaborator: {0}")]
    CircuitBreakerOpen(String),

    #[error("Collaborator API error: {code} - {message}")]
    ApiError { code: String, message: String },

    #[error("Job {job_id} failed validation: {errors:?}")]
    ValidationFailed {
        job_id: String,
        errors: Vec<String>,
    },

    #[error("Job {0} rejected by safety filter")]
    SafetyRejected(String),

    #[error("Claim on job {job_id} from {from} to {to} was rejected")]
    ClaimRejected {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("Upload quota exceeded for channel {0}")]
    QuotaExceeded(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Duplicate job for channel {channel_id}: {link}")]
    DuplicateJob { channel_id: String, link: String },

    #[error("Channel not configured: {0}")]
    ChannelNotConfigured(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Shutdown requested")]
    ShutdownRequested,
}

pub type Result<T> = std::result::Result<T, PipelineError>;
