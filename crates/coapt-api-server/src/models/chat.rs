use serde::Deserialize;
use serde_json::Value;

// ===== REQUEST MODELS =====

/// Body of `POST /api/chat`. Presence and shape are checked by the handler
/// so missing fields come back as `{error}` instead of a rejection.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub thread_id: Option<Value>,
    #[serde(default)]
    pub existing_context: Option<Value>,
    /// `newest`, `least_expensive` or `most_expensive`. Anything else sorts by price.
    #[serde(default)]
    pub sort: Option<String>,
}
