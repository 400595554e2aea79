use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use crate::models::chat::ChatRequest;
use crate::services::context::SearchContext;
use crate::services::conversation::TurnOutcome;
use crate::services::gateway::SortOrder;
use crate::services::ConversationManager;
use crate::utils::error::ApiError;

pub async fn chat_handler(
    State(manager): State<Arc<ConversationManager>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<TurnOutcome>, ApiError> {
    let start_time = Instant::now();

    let Json(request) =
        payload.map_err(|e| ApiError::BadRequest(format!("Invalid request body: {}", e.body_text())))?;

    let message = required_string(request.message, "Message is required")?;
    let thread_id = required_string(request.thread_id, "Thread ID is required")?;
    let existing = match request.existing_context {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            SearchContext::from_value(value)
                .map_err(|e| ApiError::BadRequest(format!("Invalid existingContext: {}", e)))?,
        ),
    };
    let sort = SortOrder::from_param(request.sort.as_deref());

    info!(
        "Chat request: thread={}, message_len={}, has_context={}, sort={:?}",
        thread_id,
        message.len(),
        existing.is_some(),
        sort
    );

    // Run detached so a dropped client connection cannot abort the commit.
    let task = {
        let manager = manager.clone();
        let thread_id = thread_id.clone();
        tokio::spawn(async move {
            manager
                .invoke_sorted(&message, &thread_id, existing, sort)
                .await
        })
    };

    let outcome = task.await.map_err(|e| {
        error!("Chat task for thread {} aborted: {}", thread_id, e);
        ApiError::ChatFailed {
            details: e.to_string(),
            partial_context: None,
        }
    })??;

    info!(
        "Chat reply for thread {} in {:?}",
        thread_id,
        start_time.elapsed()
    );
    Ok(Json(outcome))
}

fn required_string(value: Option<Value>, missing: &str) -> Result<String, ApiError> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        _ => Err(ApiError::BadRequest(missing.to_string())),
    }
}
