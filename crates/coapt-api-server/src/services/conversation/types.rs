use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::models::ListingSummary;
use crate::services::context::SearchContext;

/// Lifecycle state of a conversation thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadState {
    Idle,
    Running,
    Error,
}

impl ThreadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "error" => Self::Error,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

/// One message in a thread's history. Never edited after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn user(message: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn agent(message: impl Into<String>) -> Self {
        Self {
            role: Role::Agent,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Persisted state of one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationThread {
    pub id: String,
    pub history: Vec<Turn>,
    pub context: SearchContext,
    pub listings: Vec<ListingSummary>,
    /// Store version; 0 until the first successful write.
    pub version: u64,
    pub state: ThreadState,
    pub updated_at: DateTime<Utc>,
}

impl ConversationThread {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            history: Vec::new(),
            context: SearchContext::default(),
            listings: Vec::new(),
            version: 0,
            state: ThreadState::Idle,
            updated_at: Utc::now(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Outcome of a successful `invoke`.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub reply: String,
    pub context: SearchContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listings: Option<Vec<ListingSummary>>,
}
