use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde_json::Value;
use std::time::Instant;
use tracing::{error, info};

use crate::models::search::{SearchRequest, SearchResponse};
use crate::services::context::SearchContext;
use crate::services::gateway::{ListingPage, SortOrder};
use crate::state::AppState;
use crate::utils::error::ApiError;
use crate::utils::limiters::Limiters;

pub const DEFAULT_SEARCH_LIMIT: usize = 20;
pub const MAX_SEARCH_LIMIT: usize = 100;

/// `POST /api/search`. Runs structured filters directly, for filter removal
/// and sort changes that need no message understanding.
pub async fn search_handler(
    State(state): State<AppState>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, ApiError> {
    let start_time = Instant::now();

    let Json(request) =
        payload.map_err(|e| ApiError::BadRequest(format!("Invalid request body: {}", e.body_text())))?;

    let filters = match request.filters {
        Some(Value::Object(map)) if map.is_empty() => {
            return Ok(Json(SearchResponse {
                results: Vec::new(),
                result_count: 0,
            }));
        }
        Some(value @ Value::Object(_)) => SearchContext::from_value(value)
            .map_err(|e| ApiError::BadRequest(format!("Invalid filters: {}", e)))?,
        _ => return Err(ApiError::BadRequest("Filters object is required".to_string())),
    };

    let page = ListingPage {
        sort: SortOrder::from_param(request.sort.as_deref()),
        limit: request
            .limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_LIMIT),
        offset: request.offset.unwrap_or(0),
    };

    let (_permit, _) = Limiters::acquire_timed(
        state.limiters.db_search.clone(),
        state.limiters.acquire_timeout,
        "direct_search",
    )
    .await
    .map_err(|e| {
        error!("Direct search not scheduled: {:#}", e);
        ApiError::InternalError("Failed to execute search".to_string())
    })?;

    let (results, result_count) = tokio::try_join!(
        state.gateway.search_listings(&filters, page),
        state.gateway.count_listings(&filters),
    )
    .map_err(|e| {
        error!("Direct search failed: {:#}", e);
        ApiError::InternalError("Failed to execute search".to_string())
    })?;

    info!(
        "Direct search returned {} of {} listings ({:?}) in {:?}",
        results.len(),
        result_count,
        page.sort,
        start_time.elapsed()
    );
    Ok(Json(SearchResponse {
        results,
        result_count,
    }))
}
