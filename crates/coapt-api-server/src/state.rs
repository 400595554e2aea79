use axum::extract::FromRef;
use std::sync::Arc;

use crate::config::Settings;
use crate::database::DbPool;
use crate::services::{ConversationManager, SearchGateway, SharedSessionCache};
use crate::utils::limiters::Limiters;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    /// `None` when running on in-memory stores.
    pub db_pool: Option<DbPool>,
    pub gateway: Arc<dyn SearchGateway>,
    pub conversation_manager: Arc<ConversationManager>,
    pub sessions: Arc<SharedSessionCache>,
    pub limiters: Arc<Limiters>,
}

impl FromRef<AppState> for Arc<ConversationManager> {
    fn from_ref(state: &AppState) -> Self {
        state.conversation_manager.clone()
    }
}

impl FromRef<AppState> for Arc<SharedSessionCache> {
    fn from_ref(state: &AppState) -> Self {
        state.sessions.clone()
    }
}

impl FromRef<AppState> for Arc<dyn SearchGateway> {
    fn from_ref(state: &AppState) -> Self {
        state.gateway.clone()
    }
}
