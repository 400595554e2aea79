use anyhow::Result;
use flume::{bounded, Receiver, Sender};
use sqlx::PgPool;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::types::ActivityLog;
use crate::config::settings::ActivityLogConfig;

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Queue capacity (max logs in memory before backpressure)
    pub queue_capacity: usize,

    /// Batch size for database inserts
    pub batch_size: usize,

    /// Max wait time before flushing batch (milliseconds)
    pub batch_timeout_ms: u64,

    /// Number of worker tasks for database inserts
    pub worker_count: usize,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 100,
            batch_timeout_ms: 1000,
            worker_count: 2,
        }
    }
}

impl From<&ActivityLogConfig> for LoggerConfig {
    fn from(cfg: &ActivityLogConfig) -> Self {
        Self {
            queue_capacity: cfg.queue_capacity.max(1),
            batch_size: cfg.batch_size.max(1),
            batch_timeout_ms: cfg.batch_timeout_ms.max(1),
            worker_count: cfg.worker_count.max(1),
        }
    }
}

/// Async activity logger with queue mechanism.
///
/// Without a database the logger only emits tracing events.
#[derive(Clone)]
pub struct ActivityLogger {
    sender: Option<Sender<ActivityLog>>,
}

impl ActivityLogger {
    /// Initialize logger with background workers
    pub fn new(pool: PgPool, config: LoggerConfig) -> Self {
        let (sender, receiver) = bounded(config.queue_capacity);

        info!(
            "Initializing ActivityLogger: queue={}, batch={}, timeout={}ms, workers={}",
            config.queue_capacity, config.batch_size, config.batch_timeout_ms, config.worker_count
        );

        for worker_id in 0..config.worker_count {
            let pool = pool.clone();
            let receiver = receiver.clone();
            let config = config.clone();

            tokio::spawn(async move {
                Self::worker_loop(worker_id, pool, receiver, config).await;
            });
        }

        Self {
            sender: Some(sender),
        }
    }

    /// Logger that writes nothing to the database.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS tbl_conversation_activity (
                id                  BIGSERIAL PRIMARY KEY,
                thread_id           TEXT NOT NULL,
                share_id            TEXT,
                activity_type       TEXT NOT NULL,
                activity_status     TEXT NOT NULL,
                message_content     TEXT,
                response_content    TEXT,
                stage               TEXT,
                context_snapshot    JSONB,
                listing_count       INTEGER,
                thread_version      BIGINT,
                processing_time_ms  INTEGER,
                error_message       TEXT,
                error_type          TEXT,
                created_at          TIMESTAMPTZ NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Log activity (non-blocking, fire-and-forget)
    pub fn log(&self, activity: ActivityLog) {
        debug!(
            activity = activity.activity_type.as_str(),
            status = activity.activity_status.as_str(),
            thread_id = %activity.thread_id,
            "activity"
        );

        let Some(sender) = &self.sender else {
            return;
        };

        // Try to send, if queue full, drop with warning
        if let Err(e) = sender.try_send(activity) {
            warn!("Failed to enqueue activity log (queue full?): {}", e);
        }
    }

    /// Worker loop - processes logs in batches
    async fn worker_loop(
        worker_id: usize,
        pool: PgPool,
        receiver: Receiver<ActivityLog>,
        config: LoggerConfig,
    ) {
        info!("Logger worker {} started", worker_id);

        let mut batch: Vec<ActivityLog> = Vec::with_capacity(config.batch_size);
        let batch_timeout = Duration::from_millis(config.batch_timeout_ms);

        loop {
            let deadline = tokio::time::Instant::now() + batch_timeout;

            while batch.len() < config.batch_size {
                match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
                    Ok(Ok(log)) => {
                        batch.push(log);
                    }
                    Ok(Err(_)) => {
                        // Channel closed, flush and exit
                        if !batch.is_empty() {
                            Self::flush_batch(&pool, &batch, worker_id).await;
                        }
                        info!("Logger worker {} shutting down (channel closed)", worker_id);
                        return;
                    }
                    Err(_) => {
                        break;
                    }
                }
            }

            if !batch.is_empty() {
                Self::flush_batch(&pool, &batch, worker_id).await;
                batch.clear();
            } else {
                sleep(Duration::from_millis(100)).await;
            }
        }
    }

    /// Flush batch to database
    async fn flush_batch(pool: &PgPool, batch: &[ActivityLog], worker_id: usize) {
        let start = std::time::Instant::now();

        match Self::insert_batch(pool, batch).await {
            Ok(inserted) => {
                debug!(
                    "Worker {} inserted {} activity logs in {:?}",
                    worker_id,
                    inserted,
                    start.elapsed()
                );
            }
            Err(e) => {
                error!("Worker {} failed to insert batch: {}", worker_id, e);
            }
        }
    }

    /// Batch insert to database
    async fn insert_batch(pool: &PgPool, logs: &[ActivityLog]) -> Result<usize> {
        let mut query_builder = sqlx::QueryBuilder::new(
            r#"
            INSERT INTO tbl_conversation_activity (
                thread_id, share_id, activity_type, activity_status,
                message_content, response_content, stage, context_snapshot,
                listing_count, thread_version, processing_time_ms,
                error_message, error_type, created_at
            )
            "#,
        );

        query_builder.push_values(logs, |mut b, log| {
            b.push_bind(&log.thread_id)
                .push_bind(&log.share_id)
                .push_bind(log.activity_type.as_str())
                .push_bind(log.activity_status.as_str())
                .push_bind(&log.message_content)
                .push_bind(&log.response_content)
                .push_bind(&log.stage)
                .push_bind(&log.context_snapshot)
                .push_bind(log.listing_count)
                .push_bind(log.thread_version)
                .push_bind(log.processing_time_ms)
                .push_bind(&log.error_message)
                .push_bind(&log.error_type)
                .push_bind(log.created_at);
        });

        let result = query_builder.build().execute(pool).await?;

        Ok(result.rows_affected() as usize)
    }

    /// Get queue statistics (for monitoring)
    pub fn queue_len(&self) -> usize {
        self.sender.as_ref().map_or(0, |s| s.len())
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }
}

impl Default for ActivityLogger {
    fn default() -> Self {
        Self::disabled()
    }
}
