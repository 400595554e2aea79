use axum::{
    extract::{Path, State},
    Json,
};
use tracing::{debug, error};

use crate::database::models::{BuildingUnit, PricePoint};
use crate::state::AppState;
use crate::utils::error::ApiError;
use crate::utils::limiters::Limiters;

/// `GET /api/properties/{id}/price-history`, oldest first. Unknown ids give `[]`.
pub async fn price_history_handler(
    State(state): State<AppState>,
    Path(property_id): Path<String>,
) -> Result<Json<Vec<PricePoint>>, ApiError> {
    let (_permit, _) = Limiters::acquire_timed(
        state.limiters.db_search.clone(),
        state.limiters.acquire_timeout,
        "price_history",
    )
    .await
    .map_err(|e| {
        error!("Price history for {} not scheduled: {:#}", property_id, e);
        ApiError::InternalError("Failed to fetch price history".to_string())
    })?;

    let points = state
        .gateway
        .price_history(&property_id)
        .await
        .map_err(|e| {
            error!("Price history for {} failed: {:#}", property_id, e);
            ApiError::InternalError("Failed to fetch price history".to_string())
        })?;

    debug!("Price history for {}: {} points", property_id, points.len());
    Ok(Json(points))
}

/// `GET /api/properties/{id}/building-units`, cheapest first, without the
/// queried unit itself.
pub async fn building_units_handler(
    State(state): State<AppState>,
    Path(property_id): Path<String>,
) -> Result<Json<Vec<BuildingUnit>>, ApiError> {
    let (_permit, _) = Limiters::acquire_timed(
        state.limiters.db_search.clone(),
        state.limiters.acquire_timeout,
        "building_units",
    )
    .await
    .map_err(|e| {
        error!("Building units for {} not scheduled: {:#}", property_id, e);
        ApiError::InternalError("Failed to fetch building units".to_string())
    })?;

    let units = state
        .gateway
        .building_units(&property_id)
        .await
        .map_err(|e| {
            error!("Building units for {} failed: {:#}", property_id, e);
            ApiError::InternalError("Failed to fetch building units".to_string())
        })?;

    debug!("Building units for {}: {} siblings", property_id, units.len());
    Ok(Json(units))
}
