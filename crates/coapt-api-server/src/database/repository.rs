use super::models::{BuildingUnit, ListingSummary, PricePoint};
use super::DbPool;
use crate::services::context::SearchContext;
use crate::services::gateway::{neighborhood_slug, ListingPage, SearchGateway, SortOrder};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder};
use tracing::debug;

/// Postgres-backed listing gateway over the `real_estate` schema.
pub struct ListingRepository {
    pub pool: DbPool,
}

impl ListingRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Build the listing search query. Extension keys in `filters` are ignored.
    fn build_search_query<'a>(
        filters: &'a SearchContext,
        page: ListingPage,
    ) -> QueryBuilder<'a, Postgres> {
        let mut qb = QueryBuilder::<Postgres>::new(
            r#"SELECT
                fct_id AS id,
                address,
                neighborhood,
                borough,
                price::float8 AS price,
                bedrooms,
                bathrooms::float8 AS bathrooms,
                sqft,
                property_type,
                COALESCE(no_fee, false) AS no_fee,
                images[1] AS thumbnail_image
               FROM real_estate.latest_properties_materialized
               WHERE 1 = 1"#,
        );
        Self::push_filters(&mut qb, filters);

        qb.push(match page.sort {
            SortOrder::Price | SortOrder::LeastExpensive => " ORDER BY price ASC NULLS LAST",
            SortOrder::MostExpensive => " ORDER BY price DESC NULLS LAST",
            SortOrder::Newest => " ORDER BY listed_at DESC NULLS LAST",
        });
        qb.push(", fct_id ASC LIMIT ").push_bind(page.limit as i64);
        qb.push(" OFFSET ").push_bind(page.offset as i64);
        qb
    }

    fn build_count_query(filters: &SearchContext) -> QueryBuilder<'_, Postgres> {
        let mut qb = QueryBuilder::<Postgres>::new(
            r#"SELECT COUNT(*)
               FROM real_estate.latest_properties_materialized
               WHERE 1 = 1"#,
        );
        Self::push_filters(&mut qb, filters);
        qb
    }

    fn push_filters<'a>(qb: &mut QueryBuilder<'a, Postgres>, filters: &'a SearchContext) {
        if let Some(neighborhood) = &filters.neighborhood {
            qb.push(" AND neighborhood = ").push_bind(neighborhood_slug(neighborhood));
        }
        if let Some(borough) = &filters.borough {
            qb.push(" AND borough ILIKE ").push_bind(borough.clone());
        }
        if let Some(property_type) = &filters.property_type {
            qb.push(" AND property_type ILIKE ").push_bind(property_type.clone());
        }
        if let Some(zipcode) = &filters.zipcode {
            qb.push(" AND zipcode = ").push_bind(zipcode.clone());
        }
        if let Some(address) = &filters.address {
            qb.push(" AND address ILIKE ").push_bind(format!("%{}%", address));
        }
        if let Some(min) = filters.min_price {
            qb.push(" AND price >= ").push_bind(min as i64);
        }
        if let Some(max) = filters.max_price {
            qb.push(" AND price <= ").push_bind(max as i64);
        }
        if let Some(bedrooms) = filters.bedrooms {
            qb.push(" AND bedrooms = ").push_bind(bedrooms as i32);
        }
        if let Some(baths) = filters.min_bathrooms {
            qb.push(" AND bathrooms >= ").push_bind(baths);
        }
        if let Some(min) = filters.min_sqft {
            qb.push(" AND sqft >= ").push_bind(min as i32);
        }
        if let Some(max) = filters.max_sqft {
            qb.push(" AND sqft <= ").push_bind(max as i32);
        }
        if filters.no_fee == Some(true) {
            qb.push(" AND no_fee = true");
        }
        if !filters.tags.values.is_empty() {
            qb.push(" AND tag_list @> ").push_bind(filters.tags.values.clone());
        }
        if !filters.amenities.values.is_empty() {
            qb.push(" AND amenities @> ").push_bind(filters.amenities.values.clone());
        }
    }
}

#[async_trait]
impl SearchGateway for ListingRepository {
    async fn price_history(&self, property_id: &str) -> Result<Vec<PricePoint>> {
        let rows = sqlx::query_as::<_, PricePoint>(
            r#"SELECT date::date AS date, price::float8 AS price
               FROM real_estate.fct_properties
               WHERE id = $1
               ORDER BY date ASC"#,
        )
        .bind(property_id)
        .fetch_all(self.pool.get_pool())
        .await?;

        debug!("Loaded {} price points for {}", rows.len(), property_id);
        Ok(rows)
    }

    async fn building_units(&self, property_id: &str) -> Result<Vec<BuildingUnit>> {
        let building_id = sqlx::query_scalar::<_, Option<String>>(
            r#"SELECT building_id
               FROM real_estate.latest_properties_materialized
               WHERE fct_id = $1
               LIMIT 1"#,
        )
        .bind(property_id)
        .fetch_optional(self.pool.get_pool())
        .await?
        .flatten();

        let Some(building_id) = building_id else {
            debug!("Property {} has no building, no sibling units", property_id);
            return Ok(Vec::new());
        };

        let units = sqlx::query_as::<_, BuildingUnit>(
            r#"SELECT
                id,
                address,
                price::float8 AS price,
                bedrooms,
                bathrooms::float8 AS bathrooms,
                sqft,
                COALESCE(no_fee, false) AS no_fee,
                images[1] AS thumbnail_image
               FROM real_estate.latest_properties_materialized
               WHERE building_id = $1 AND fct_id != $2
               ORDER BY price ASC"#,
        )
        .bind(&building_id)
        .bind(property_id)
        .fetch_all(self.pool.get_pool())
        .await?;

        debug!(
            "Found {} sibling units in building {} for {}",
            units.len(),
            building_id,
            property_id
        );
        Ok(units)
    }

    async fn search_listings(
        &self,
        filters: &SearchContext,
        page: ListingPage,
    ) -> Result<Vec<ListingSummary>> {
        let mut qb = Self::build_search_query(filters, page);
        let rows = qb
            .build_query_as::<ListingSummary>()
            .fetch_all(self.pool.get_pool())
            .await?;

        debug!("Listing search returned {} rows", rows.len());
        Ok(rows)
    }

    async fn count_listings(&self, filters: &SearchContext) -> Result<u64> {
        let mut qb = Self::build_count_query(filters);
        let count: i64 = qb
            .build_query_scalar::<i64>()
            .fetch_one(self.pool.get_pool())
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn neighborhoods(&self) -> Result<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            r#"SELECT DISTINCT name
               FROM real_estate.neighborhoods_enhanced_view
               WHERE level IN (3, 4, 5)
               ORDER BY name"#,
        )
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(names)
    }
}
