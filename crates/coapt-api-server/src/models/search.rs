use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::database::models::ListingSummary;

// ===== REQUEST MODELS =====

/// Body of `POST /api/search`: structured filters run as-is, no extraction.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    #[serde(default)]
    pub filters: Option<Value>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

// ===== RESPONSE MODELS =====

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub results: Vec<ListingSummary>,
    /// Matches across all pages.
    pub result_count: u64,
}
