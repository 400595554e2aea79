use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info};

use super::DbPool;
use crate::database::models::ListingSummary;
use crate::services::context::SearchContext;
use crate::services::conversation::store::{StoreError, ThreadStore};
use crate::services::conversation::types::{ConversationThread, ThreadState, Turn};

const SCHEMA_SQL: &str = r#"CREATE TABLE IF NOT EXISTS conversation_threads (
    thread_id   TEXT PRIMARY KEY,
    history     JSONB NOT NULL DEFAULT '[]'::jsonb,
    context     JSONB NOT NULL DEFAULT '{}'::jsonb,
    listings    JSONB NOT NULL DEFAULT '[]'::jsonb,
    version     BIGINT NOT NULL,
    state       TEXT NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"#;

/// $1 thread id, $2 idle ttl in seconds.
const SELECT_THREAD_SQL: &str = r#"SELECT thread_id, history, context, listings, version, state, updated_at
   FROM conversation_threads
   WHERE thread_id = $1
     AND updated_at > NOW() - ($2::bigint * INTERVAL '1 second')"#;

const SELECT_VERSION_SQL: &str = r#"SELECT version FROM conversation_threads
   WHERE thread_id = $1
     AND updated_at > NOW() - ($2::bigint * INTERVAL '1 second')"#;

/// First write, or reuse of an expired slot. A live row is left alone and
/// nothing is returned.
const INSERT_THREAD_SQL: &str = r#"INSERT INTO conversation_threads
    (thread_id, history, context, listings, version, state, updated_at)
   VALUES ($1, $2, $3, $4, $5, $6, NOW())
   ON CONFLICT (thread_id) DO UPDATE SET
    history = EXCLUDED.history,
    context = EXCLUDED.context,
    listings = EXCLUDED.listings,
    version = EXCLUDED.version,
    state = EXCLUDED.state,
    updated_at = EXCLUDED.updated_at
   WHERE conversation_threads.updated_at
         <= NOW() - ($7::bigint * INTERVAL '1 second')
   RETURNING version"#;

/// Compare-and-set on `version` ($7). History may only grow.
const UPDATE_THREAD_SQL: &str = r#"UPDATE conversation_threads SET
    history = $2,
    context = $3,
    listings = $4,
    version = $5,
    state = $6,
    updated_at = NOW()
   WHERE thread_id = $1
     AND version = $7
     AND jsonb_array_length(history) <= jsonb_array_length($2)
   RETURNING version"#;

const PURGE_IDLE_SQL: &str = r#"DELETE FROM conversation_threads
   WHERE updated_at <= NOW() - ($1::bigint * INTERVAL '1 second')"#;

#[derive(FromRow)]
struct ThreadRow {
    thread_id: String,
    history: Json<Vec<Turn>>,
    context: Json<SearchContext>,
    listings: Json<Vec<ListingSummary>>,
    version: i64,
    state: String,
    updated_at: DateTime<Utc>,
}

impl From<ThreadRow> for ConversationThread {
    fn from(row: ThreadRow) -> Self {
        Self {
            id: row.thread_id,
            history: row.history.0,
            context: row.context.0,
            listings: row.listings.0,
            version: row.version.max(0) as u64,
            state: ThreadState::parse(&row.state),
            updated_at: row.updated_at,
        }
    }
}

/// Thread store persisted in `conversation_threads`, versioned with
/// compare-and-set updates.
pub struct PgThreadStore {
    pool: DbPool,
    idle_ttl: Duration,
}

impl PgThreadStore {
    pub fn new(pool: DbPool, idle_ttl: Duration) -> Self {
        Self { pool, idle_ttl }
    }

    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(SCHEMA_SQL)
        .execute(self.pool.get_pool())
        .await
        .context("Failed to create conversation_threads")?;

        info!("✅ conversation_threads schema ready");
        Ok(())
    }

    fn ttl_secs(&self) -> i64 {
        self.idle_ttl.as_secs() as i64
    }

    async fn current_version(&self, thread_id: &str) -> Result<u64, StoreError> {
        let version = sqlx::query_scalar::<_, i64>(SELECT_VERSION_SQL)
        .bind(thread_id)
        .bind(self.ttl_secs())
        .fetch_optional(self.pool.get_pool())
        .await
        .map_err(anyhow::Error::from)?;

        Ok(version.unwrap_or(0).max(0) as u64)
    }
}

#[async_trait]
impl ThreadStore for PgThreadStore {
    async fn get(&self, thread_id: &str) -> Result<Option<ConversationThread>, StoreError> {
        let row = sqlx::query_as::<_, ThreadRow>(SELECT_THREAD_SQL)
        .bind(thread_id)
        .bind(self.ttl_secs())
        .fetch_optional(self.pool.get_pool())
        .await
        .map_err(anyhow::Error::from)?;

        Ok(row.map(ConversationThread::from))
    }

    async fn put(
        &self,
        thread: &ConversationThread,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let new_version = (expected_version + 1) as i64;
        let history = Json(&thread.history);
        let context = Json(&thread.context);
        let listings = Json(&thread.listings);

        let written = if expected_version == 0 {
            sqlx::query_scalar::<_, i64>(INSERT_THREAD_SQL)
            .bind(&thread.id)
            .bind(history)
            .bind(context)
            .bind(listings)
            .bind(new_version)
            .bind(thread.state.as_str())
            .bind(self.ttl_secs())
            .fetch_optional(self.pool.get_pool())
            .await
            .map_err(anyhow::Error::from)?
        } else {
            sqlx::query_scalar::<_, i64>(UPDATE_THREAD_SQL)
            .bind(&thread.id)
            .bind(history)
            .bind(context)
            .bind(listings)
            .bind(new_version)
            .bind(thread.state.as_str())
            .bind(expected_version as i64)
            .fetch_optional(self.pool.get_pool())
            .await
            .map_err(anyhow::Error::from)?
        };

        match written {
            Some(version) => {
                debug!("Stored thread {} at version {}", thread.id, version);
                Ok(version as u64)
            }
            None => {
                let actual = self.current_version(&thread.id).await?;
                if actual == expected_version {
                    Err(StoreError::HistoryRewrite(thread.id.clone()))
                } else {
                    Err(StoreError::VersionConflict {
                        thread_id: thread.id.clone(),
                        expected: expected_version,
                        actual,
                    })
                }
            }
        }
    }

    async fn purge_idle(&self) -> Result<usize, StoreError> {
        let result = sqlx::query(PURGE_IDLE_SQL)
        .bind(self.ttl_secs())
        .execute(self.pool.get_pool())
        .await
        .map_err(anyhow::Error::from)?;

        let count = result.rows_affected() as usize;
        if count > 0 {
            info!("Purged {} idle threads", count);
        }
        Ok(count)
    }
}
