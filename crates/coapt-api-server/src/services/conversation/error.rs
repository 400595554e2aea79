use thiserror::Error;

use crate::services::context::SearchContext;

use super::store::StoreError;

#[derive(Debug, Error)]
pub enum ConversationError {
    /// Bad caller input. Nothing was read or written.
    #[error("{0}")]
    Validation(String),

    /// A stage or the thread store failed. `partial_context` is the best
    /// merged view available when the failure happened.
    #[error("{message}")]
    Upstream {
        message: String,
        partial_context: Option<SearchContext>,
    },
}

impl ConversationError {
    pub fn upstream(message: impl Into<String>, partial_context: Option<SearchContext>) -> Self {
        Self::Upstream {
            message: message.into(),
            partial_context,
        }
    }

    pub fn from_store(action: &str, err: StoreError) -> Self {
        Self::upstream(format!("{}: {}", action, err), None)
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
