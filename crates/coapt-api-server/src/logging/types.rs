use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Activity type categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    ThreadCreated,
    TurnReceived,   // Log initial payload
    TurnCommitted,  // Log final reply + context
    StageFailed,
    CommitConflict,
    ErrorCleared,
    ShareCreated,
    ViewerJoined,
    ViewerLeft,
    PublishFailed,
    SessionExpired,
}

impl ActivityType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ThreadCreated => "thread_created",
            Self::TurnReceived => "turn_received",
            Self::TurnCommitted => "turn_committed",
            Self::StageFailed => "stage_failed",
            Self::CommitConflict => "commit_conflict",
            Self::ErrorCleared => "error_cleared",
            Self::ShareCreated => "share_created",
            Self::ViewerJoined => "viewer_joined",
            Self::ViewerLeft => "viewer_left",
            Self::PublishFailed => "publish_failed",
            Self::SessionExpired => "session_expired",
        }
    }
}

/// Activity status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Success,
    Error,
    Warning,
    Info,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

/// Complete activity log entry
#[derive(Debug, Clone)]
pub struct ActivityLog {
    // Thread & share
    pub thread_id: String,
    pub share_id: Option<String>,

    // Activity
    pub activity_type: ActivityType,
    pub activity_status: ActivityStatus,

    // Content
    pub message_content: Option<String>,
    pub response_content: Option<String>,
    pub stage: Option<String>,
    pub context_snapshot: Option<Value>,

    // Metrics
    pub listing_count: Option<i32>,
    pub thread_version: Option<i64>,
    pub processing_time_ms: Option<i32>,

    // Error
    pub error_message: Option<String>,
    pub error_type: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl ActivityLog {
    /// Create builder for fluent API
    pub fn builder(thread_id: impl Into<String>, activity_type: ActivityType) -> ActivityLogBuilder {
        ActivityLogBuilder::new(thread_id.into(), activity_type)
    }
}

/// Builder pattern for ActivityLog
pub struct ActivityLogBuilder {
    log: ActivityLog,
}

impl ActivityLogBuilder {
    pub fn new(thread_id: String, activity_type: ActivityType) -> Self {
        Self {
            log: ActivityLog {
                thread_id,
                share_id: None,
                activity_type,
                activity_status: ActivityStatus::Success,
                message_content: None,
                response_content: None,
                stage: None,
                context_snapshot: None,
                listing_count: None,
                thread_version: None,
                processing_time_ms: None,
                error_message: None,
                error_type: None,
                created_at: Utc::now(),
            },
        }
    }

    pub fn status(mut self, status: ActivityStatus) -> Self {
        self.log.activity_status = status;
        self
    }

    pub fn share(mut self, share_id: impl Into<String>) -> Self {
        self.log.share_id = Some(share_id.into());
        self
    }

    pub fn message(mut self, content: impl Into<String>) -> Self {
        self.log.message_content = Some(content.into());
        self
    }

    pub fn response(mut self, content: impl Into<String>) -> Self {
        self.log.response_content = Some(content.into());
        self
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.log.stage = Some(stage.into());
        self
    }

    pub fn context(mut self, snapshot: Value) -> Self {
        self.log.context_snapshot = Some(snapshot);
        self
    }

    pub fn listing_count(mut self, count: usize) -> Self {
        self.log.listing_count = Some(count.min(i32::MAX as usize) as i32);
        self
    }

    pub fn version(mut self, version: u64) -> Self {
        self.log.thread_version = Some(version as i64);
        self
    }

    pub fn processing_time(mut self, ms: u128) -> Self {
        self.log.processing_time_ms = Some(ms.min(i32::MAX as u128) as i32);
        self
    }

    pub fn error(mut self, message: impl Into<String>, error_type: impl Into<String>) -> Self {
        self.log.activity_status = ActivityStatus::Error;
        self.log.error_message = Some(message.into());
        self.log.error_type = Some(error_type.into());
        self
    }

    pub fn build(self) -> ActivityLog {
        self.log
    }
}
