use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::database::models::ListingSummary;
use crate::services::context::SearchContext;
use crate::services::conversation::types::{ConversationThread, Turn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShareError {
    #[error("Share not found or expired")]
    NotFound,

    #[error("Property not in this share")]
    PropertyNotShared,

    #[error("could not allocate a unique share id after {0} attempts")]
    IdSpaceExhausted(usize),
}

/// Everything viewers of a share see, replaced wholesale on publish.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub listings: Vec<ListingSummary>,
    pub query_record: SearchContext,
    pub chat_history: Vec<Turn>,
}

impl SessionSnapshot {
    pub fn from_thread(thread: &ConversationThread) -> Self {
        Self {
            listings: thread.listings.clone(),
            query_record: thread.context.clone(),
            chat_history: thread.history.clone(),
        }
    }

    pub fn contains_listing(&self, property_id: &str) -> bool {
        self.listings.iter().any(|l| l.id == property_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteDirection {
    Up,
    Down,
    None,
}

impl VoteDirection {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteTally {
    pub upvotes: usize,
    pub downvotes: usize,
}

/// One listing's tally as seen by a particular voter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoterTally {
    pub upvotes: usize,
    pub downvotes: usize,
    /// The asking voter's own vote, `null` when they have none or did not say who they are.
    pub user_vote: Option<VoteDirection>,
}

/// Immutable view handed to every viewer of a share.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub share_id: String,
    pub owner_thread_id: String,
    /// Bumped on every publish, vote or participation change.
    pub revision: u64,
    pub snapshot: Arc<SessionSnapshot>,
    pub votes: BTreeMap<String, VoteTally>,
    pub viewer_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
