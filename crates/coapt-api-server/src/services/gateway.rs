//! Read-only listing data used by the conversation pipeline and the
//! property detail endpoints.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

use crate::database::models::{BuildingUnit, ListingSummary, PricePoint};
use crate::services::context::SearchContext;

/// Query surface over the listing dataset.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchGateway: Send + Sync {
    /// Price observations for one listing, oldest first. Unknown ids yield `[]`.
    async fn price_history(&self, property_id: &str) -> Result<Vec<PricePoint>>;

    /// Other units in the queried listing's building, cheapest first.
    async fn building_units(&self, property_id: &str) -> Result<Vec<BuildingUnit>>;

    async fn search_listings(
        &self,
        filters: &SearchContext,
        page: ListingPage,
    ) -> Result<Vec<ListingSummary>>;

    /// Number of listings matching `filters`, ignoring paging.
    async fn count_listings(&self, filters: &SearchContext) -> Result<u64>;

    async fn neighborhoods(&self) -> Result<Vec<String>>;
}

/// Result ordering. Unknown sort names fall back to `Price`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Cheapest first, unpriced rows last.
    #[default]
    Price,
    Newest,
    LeastExpensive,
    MostExpensive,
}

impl SortOrder {
    pub fn from_param(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("newest") => SortOrder::Newest,
            Some("least_expensive") => SortOrder::LeastExpensive,
            Some("most_expensive") => SortOrder::MostExpensive,
            _ => SortOrder::Price,
        }
    }
}

/// Which slice of the ordered results to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingPage {
    pub sort: SortOrder,
    pub limit: usize,
    pub offset: usize,
}

impl ListingPage {
    pub fn first(limit: usize) -> Self {
        Self {
            sort: SortOrder::Price,
            limit,
            offset: 0,
        }
    }

    pub fn sorted(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }
}

/// Dataset slug used for neighborhood matching ("Upper West Side" -> "upper-west-side").
pub fn neighborhood_slug(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
}

/// A listing row as held by [`StaticGateway`].
#[derive(Debug, Clone)]
pub struct StaticListing {
    pub summary: ListingSummary,
    pub building_id: Option<String>,
    pub listed_at: Option<NaiveDate>,
    pub tags: Vec<String>,
    pub amenities: Vec<String>,
}

/// In-memory gateway backed by a fixed dataset. Used when no database is
/// configured and by tests.
#[derive(Debug, Clone, Default)]
pub struct StaticGateway {
    listings: Vec<StaticListing>,
    history: HashMap<String, Vec<PricePoint>>,
    neighborhoods: Vec<String>,
}

impl StaticGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listing(mut self, listing: StaticListing) -> Self {
        if let Some(name) = listing.summary.neighborhood.clone() {
            if !self.neighborhoods.iter().any(|n| n.eq_ignore_ascii_case(&name)) {
                self.neighborhoods.push(name);
            }
        }
        self.listings.push(listing);
        self
    }

    pub fn with_price_point(mut self, property_id: &str, date: NaiveDate, price: Option<f64>) -> Self {
        self.history
            .entry(property_id.to_string())
            .or_default()
            .push(PricePoint { date, price });
        self
    }

    /// Small Brooklyn/Manhattan/Queens dataset served when running without Postgres.
    pub fn sample() -> Self {
        let rows = [
            ("wb-101", "101 Berry St #2A", "Williamsburg", "Brooklyn", 2950.0, 2, 1.0, 820, "rental", true, Some("b-berry-101"), &["Renovated"][..], &["laundry", "dishwasher"][..]),
            ("wb-102", "101 Berry St #3C", "Williamsburg", "Brooklyn", 3400.0, 2, 2.0, 910, "rental", false, Some("b-berry-101"), &["Luxury"][..], &["gym", "doorman"][..]),
            ("wb-103", "101 Berry St #5F", "Williamsburg", "Brooklyn", 2600.0, 1, 1.0, 640, "rental", true, Some("b-berry-101"), &[][..], &["laundry"][..]),
            ("wb-201", "88 N 6th St #4", "Williamsburg", "Brooklyn", 4100.0, 3, 2.0, 1150, "rental", false, None, &["Spacious"][..], &["roof deck"][..]),
            ("bw-301", "12 Starr St #1R", "Bushwick", "Brooklyn", 2400.0, 2, 1.0, 760, "rental", true, None, &["Pet Friendly"][..], &[][..]),
            ("uws-401", "210 W 85th St #7B", "Upper West Side", "Manhattan", 5200.0, 2, 2.0, 1050, "condo", false, Some("b-w85-210"), &["Luxury"][..], &["doorman", "elevator"][..]),
            ("uws-402", "210 W 85th St #2D", "Upper West Side", "Manhattan", 3900.0, 1, 1.0, 700, "condo", true, Some("b-w85-210"), &[][..], &["elevator"][..]),
            ("ast-501", "31-10 Broadway #3", "Astoria", "Queens", 2250.0, 1, 1.0, 620, "rental", true, None, &["Great Deal"][..], &["laundry"][..]),
        ];

        let mut gateway = Self::new();
        for (id, address, hood, borough, price, beds, baths, sqft, kind, no_fee, building, tags, amenities) in rows {
            gateway = gateway.with_listing(StaticListing {
                summary: ListingSummary {
                    id: id.to_string(),
                    address: address.to_string(),
                    neighborhood: Some(hood.to_string()),
                    borough: Some(borough.to_string()),
                    price: Some(price),
                    bedrooms: Some(beds),
                    bathrooms: Some(baths),
                    sqft: Some(sqft),
                    property_type: Some(kind.to_string()),
                    no_fee,
                    thumbnail_image: None,
                },
                building_id: building.map(str::to_string),
                listed_at: None,
                tags: tags.iter().map(|t| t.to_string()).collect(),
                amenities: amenities.iter().map(|a| a.to_string()).collect(),
            });
        }

        for (id, listed) in [
            ("wb-101", "2025-10-15"),
            ("wb-102", "2025-08-20"),
            ("wb-103", "2025-10-02"),
            ("wb-201", "2025-09-28"),
            ("bw-301", "2025-10-20"),
            ("uws-401", "2025-06-01"),
            ("uws-402", "2025-09-11"),
        ] {
            if let Some(listing) = gateway.listings.iter_mut().find(|l| l.summary.id == id) {
                listing.listed_at = NaiveDate::parse_from_str(listed, "%Y-%m-%d").ok();
            }
        }

        for (id, points) in [
            ("wb-101", &[("2025-09-01", Some(3100.0)), ("2025-10-15", Some(2950.0))][..]),
            ("wb-102", &[("2025-08-20", Some(3400.0))][..]),
            ("uws-401", &[("2025-06-01", Some(5600.0)), ("2025-07-01", None), ("2025-08-01", Some(5200.0))][..]),
        ] {
            for (date, price) in points {
                if let Ok(date) = NaiveDate::parse_from_str(date, "%Y-%m-%d") {
                    gateway = gateway.with_price_point(id, date, *price);
                }
            }
        }

        gateway
    }

    fn matches(listing: &StaticListing, filters: &SearchContext) -> bool {
        let s = &listing.summary;
        let eq_ci = |field: &Option<String>, wanted: &Option<String>| match wanted {
            Some(w) => field.as_deref().is_some_and(|f| f.eq_ignore_ascii_case(w)),
            None => true,
        };
        let price = s.price.unwrap_or(0.0);

        filters.neighborhood.as_ref().is_none_or(|n| {
            s.neighborhood
                .as_deref()
                .is_some_and(|h| neighborhood_slug(h) == neighborhood_slug(n))
        }) && eq_ci(&s.borough, &filters.borough)
            && eq_ci(&s.property_type, &filters.property_type)
            && filters.address.as_ref().is_none_or(|a| {
                s.address.to_lowercase().contains(&a.to_lowercase())
            })
            && filters.min_price.is_none_or(|min| price >= min as f64)
            && filters.max_price.is_none_or(|max| price <= max as f64)
            && filters
                .bedrooms
                .is_none_or(|b| s.bedrooms == Some(b as i32))
            && filters
                .min_bathrooms
                .is_none_or(|b| s.bathrooms.is_some_and(|have| have >= b))
            && filters
                .min_sqft
                .is_none_or(|min| s.sqft.is_some_and(|have| have >= min as i32))
            && filters
                .max_sqft
                .is_none_or(|max| s.sqft.is_some_and(|have| have <= max as i32))
            && (filters.no_fee != Some(true) || s.no_fee)
            && filters.tags.values.iter().all(|t| listing.tags.contains(t))
            && filters
                .amenities
                .values
                .iter()
                .all(|a| listing.amenities.contains(a))
    }
}

/// Ascending or descending on the present values; `None` always sorts last,
/// matching `NULLS LAST` in Postgres.
fn nulls_last<T: PartialOrd>(a: Option<T>, b: Option<T>, descending: bool) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => {
            let ord = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
            if descending {
                ord.reverse()
            } else {
                ord
            }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn price_order(a: Option<f64>, b: Option<f64>) -> Ordering {
    nulls_last(a, b, false)
}

fn listing_order(sort: SortOrder, a: &StaticListing, b: &StaticListing) -> Ordering {
    let by_sort = match sort {
        SortOrder::Price | SortOrder::LeastExpensive => price_order(a.summary.price, b.summary.price),
        SortOrder::MostExpensive => nulls_last(a.summary.price, b.summary.price, true),
        SortOrder::Newest => nulls_last(a.listed_at, b.listed_at, true),
    };
    by_sort.then_with(|| a.summary.id.cmp(&b.summary.id))
}

#[async_trait]
impl SearchGateway for StaticGateway {
    async fn price_history(&self, property_id: &str) -> Result<Vec<PricePoint>> {
        let mut points = self.history.get(property_id).cloned().unwrap_or_default();
        points.sort_by_key(|p| p.date);
        Ok(points)
    }

    async fn building_units(&self, property_id: &str) -> Result<Vec<BuildingUnit>> {
        let Some(building_id) = self
            .listings
            .iter()
            .find(|l| l.summary.id == property_id)
            .and_then(|l| l.building_id.clone())
        else {
            debug!("No building for property {}", property_id);
            return Ok(Vec::new());
        };

        let mut units: Vec<BuildingUnit> = self
            .listings
            .iter()
            .filter(|l| l.building_id.as_deref() == Some(building_id.as_str()))
            .filter(|l| l.summary.id != property_id)
            .map(|l| BuildingUnit {
                id: l.summary.id.clone(),
                address: l.summary.address.clone(),
                price: l.summary.price,
                bedrooms: l.summary.bedrooms,
                bathrooms: l.summary.bathrooms,
                sqft: l.summary.sqft,
                no_fee: l.summary.no_fee,
                thumbnail_image: l.summary.thumbnail_image.clone(),
            })
            .collect();
        units.sort_by(|a, b| price_order(a.price, b.price));
        Ok(units)
    }

    async fn search_listings(
        &self,
        filters: &SearchContext,
        page: ListingPage,
    ) -> Result<Vec<ListingSummary>> {
        let mut hits: Vec<&StaticListing> = self
            .listings
            .iter()
            .filter(|l| Self::matches(l, filters))
            .collect();
        hits.sort_by(|a, b| listing_order(page.sort, a, b));
        Ok(hits
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .map(|l| l.summary.clone())
            .collect())
    }

    async fn count_listings(&self, filters: &SearchContext) -> Result<u64> {
        Ok(self.listings.iter().filter(|l| Self::matches(l, filters)).count() as u64)
    }

    async fn neighborhoods(&self) -> Result<Vec<String>> {
        Ok(self.neighborhoods.clone())
    }
}
