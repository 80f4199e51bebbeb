//! Event bus payloads: the typed contents of every message that crosses
//! a topic. Topics are a closed enumeration instead of ad hoc strings so
//! the bus routing and the metrics labels can't silently diverge.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    IngestNewItem,
    ScriptCreated,
    AssetsReady,
    UploadRequested,
    /// Legacy alias for `UploadRequested`, still consumed (§9 open question).
    VideoCreated,
    VideoUploaded,
    UploadFailed,
    RegenerationRequested,
    DeadLetter,
    SystemLogs,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::IngestNewItem => "ingest/new-item",
            Topic::ScriptCreated => "script-created",
            Topic::AssetsReady => "assets-ready",
            Topic::UploadRequested => "upload-requested",
            Topic::VideoCreated => "video-created",
            Topic::VideoUploaded => "video-uploaded",
            Topic::UploadFailed => "upload-failed",
            Topic::RegenerationRequested => "regeneration-requested",
            Topic::DeadLetter => "dead-letter",
            Topic::SystemLogs => "system-logs",
        }
    }
}

/// Self-describing, additive-schema-tolerant event payload. Every variant
/// carries `channel_id` and a correlation id (`job_id`, or the source
/// `url` for pre-admission ingestion events) so consumers can route and
/// log without parsing the whole payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    IngestNewItem {
        channel_id: String,
        url: String,
        title: String,
        summary: String,
    },
    ScriptCreated {
        channel_id: String,
        job_id: String,
    },
    AssetsReady {
        channel_id: String,
        job_id: String,
    },
    UploadRequested {
        channel_id: String,
        job_id: String,
    },
    /// Legacy alias for `UploadRequested`, still consumed (§9 open question).
    VideoCreated {
        channel_id: String,
        job_id: String,
    },
    VideoUploaded {
        channel_id: String,
        job_id: String,
        youtube_url: String,
    },
    UploadFailed {
        channel_id: String,
        job_id: String,
        reason: String,
    },
    RegenerationRequested {
        channel_id: String,
        job_id: String,
        title: String,
        summary: String,
        link: String,
    },
    DeadLetter {
        channel_id: String,
        job_id: String,
        reason: String,
        failed_topic: String,
    },
    SystemLog {
        service: String,
        level: String,
        message: String,
    },
}

impl PipelineEvent {
    pub fn topic(&self) -> Topic {
        match self {
            PipelineEvent::IngestNewItem { .. } => Topic::IngestNewItem,
            PipelineEvent::ScriptCreated { .. } => Topic::ScriptCreated,
            PipelineEvent::AssetsReady { .. } => Topic::AssetsReady,
            PipelineEvent::UploadRequested { .. } => Topic::UploadRequested,
            PipelineEvent::VideoCreated { .. } => Topic::VideoCreated,
            PipelineEvent::VideoUploaded { .. } => Topic::VideoUploaded,
            PipelineEvent::UploadFailed { .. } => Topic::UploadFailed,
            PipelineEvent::RegenerationRequested { .. } => Topic::RegenerationRequested,
            PipelineEvent::DeadLetter { .. } => Topic::DeadLetter,
            PipelineEvent::SystemLog { .. } => Topic::SystemLogs,
        }
    }

    pub fn channel_id(&self) -> Option<&str> {
        match self {
            PipelineEvent::IngestNewItem { channel_id, .. }
            | PipelineEvent::ScriptCreated { channel_id, .. }
            | PipelineEvent::AssetsReady { channel_id, .. }
            | PipelineEvent::UploadRequested { channel_id, .. }
            | PipelineEvent::VideoCreated { channel_id, .. }
            | PipelineEvent::VideoUploaded { channel_id, .. }
            | PipelineEvent::UploadFailed { channel_id, .. }
            | PipelineEvent::RegenerationRequested { channel_id, .. }
            | PipelineEvent::DeadLetter { channel_id, .. } => Some(channel_id),
            PipelineEvent::SystemLog { .. } => None,
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            PipelineEvent::IngestNewItem { url, .. } => url,
            PipelineEvent::ScriptCreated { job_id, .. }
            | PipelineEvent::AssetsReady { job_id, .. }
            | PipelineEvent::UploadRequested { job_id, .. }
            | PipelineEvent::VideoCreated { job_id, .. }
            | PipelineEvent::VideoUploaded { job_id, .. }
            | PipelineEvent::UploadFailed { job_id, .. }
            | PipelineEvent::RegenerationRequested { job_id, .. }
            | PipelineEvent::DeadLetter { job_id, .. } => job_id,
            PipelineEvent::SystemLog { service, .. } => service,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_strings_are_stable() {
        assert_eq!(Topic::UploadRequested.as_str(), "upload-requested");
        assert_eq!(Topic::DeadLetter.as_str(), "dead-letter");
    }

    #[test]
    fn event_reports_its_own_topic() {
        let event = PipelineEvent::AssetsReady {
            channel_id: "news-shorts".into(),
            job_id: "abc".into(),
        };
        assert_eq!(event.topic(), Topic::AssetsReady);
        assert_eq!(event.correlation_id(), "abc");
    }
}
