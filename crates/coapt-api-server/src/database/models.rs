use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One observed price for a listing. `price` is `None` when the source row
/// carries no price.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub price: Option<f64>,
}

/// Another unit in the same building as a queried listing.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct BuildingUnit {
    pub id: String,
    pub address: String,
    pub price: Option<f64>,
    pub bedrooms: Option<i32>,
    pub bathrooms: Option<f64>,
    pub sqft: Option<i32>,
    pub no_fee: bool,
    pub thumbnail_image: Option<String>,
}

/// Listing row returned by a conversational search and carried in share
/// snapshots.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ListingSummary {
    pub id: String,
    pub address: String,
    pub neighborhood: Option<String>,
    pub borough: Option<String>,
    pub price: Option<f64>,
    pub bedrooms: Option<i32>,
    pub bathrooms: Option<f64>,
    pub sqft: Option<i32>,
    pub property_type: Option<String>,
    pub no_fee: bool,
    pub thumbnail_image: Option<String>,
}
