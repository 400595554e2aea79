use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::logging::{ActivityLog, ActivityLogger, ActivityStatus, ActivityType};
use crate::services::context::{merge, SearchContext};
use crate::services::gateway::SortOrder;
use crate::services::share::{SessionSnapshot, SharedSessionCache};

use super::error::ConversationError;
use super::lease::ThreadLeases;
use super::pipeline::{Pipeline, TurnContext};
use super::store::{StoreError, ThreadStore};
use super::types::{ConversationThread, ThreadState, Turn, TurnOutcome};

pub const DEFAULT_MAX_COMMIT_ATTEMPTS: u32 = 3;

/// Runs chat turns against versioned threads.
///
/// Turns on the same thread are serialized by a lease. Turns on different
/// threads run concurrently. Every write goes through an optimistic
/// compare-and-set that is retried a bounded number of times.
pub struct ConversationManager {
    store: Arc<dyn ThreadStore>,
    pipeline: Pipeline,
    leases: ThreadLeases,
    sessions: Option<Arc<SharedSessionCache>>,
    logger: ActivityLogger,
    max_commit_attempts: u32,
}

impl ConversationManager {
    pub fn new(store: Arc<dyn ThreadStore>, pipeline: Pipeline, logger: ActivityLogger) -> Self {
        Self {
            store,
            pipeline,
            leases: ThreadLeases::new(),
            sessions: None,
            logger,
            max_commit_attempts: DEFAULT_MAX_COMMIT_ATTEMPTS,
        }
    }

    /// Publish every committed turn to the thread's share, if it has one.
    pub fn with_sessions(mut self, sessions: Arc<SharedSessionCache>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_max_commit_attempts(mut self, attempts: u32) -> Self {
        self.max_commit_attempts = attempts.max(1);
        self
    }

    /// Process one user message on `thread_id`.
    ///
    /// `existing` is the client's view of the search so far. It is folded
    /// into the stored context before this turn's filters are applied.
    pub async fn invoke(
        &self,
        message: &str,
        thread_id: &str,
        existing: Option<SearchContext>,
    ) -> Result<TurnOutcome, ConversationError> {
        self.invoke_sorted(message, thread_id, existing, SortOrder::default())
            .await
    }

    /// [`invoke`](Self::invoke) with an explicit result ordering for this turn.
    pub async fn invoke_sorted(
        &self,
        message: &str,
        thread_id: &str,
        existing: Option<SearchContext>,
        sort: SortOrder,
    ) -> Result<TurnOutcome, ConversationError> {
        let start_time = Instant::now();

        let message = message.trim();
        let thread_id = thread_id.trim();
        if message.is_empty() {
            return Err(ConversationError::Validation("Message is required".to_string()));
        }
        if thread_id.is_empty() {
            return Err(ConversationError::Validation("Thread ID is required".to_string()));
        }
        let existing = existing.unwrap_or_default();
        existing
            .validate()
            .map_err(|e| ConversationError::Validation(e.to_string()))?;

        let _lease = self.leases.acquire(thread_id).await;

        self.logger.log(
            ActivityLog::builder(thread_id, ActivityType::TurnReceived)
                .message(message)
                .context(existing.to_value())
                .status(ActivityStatus::Info)
                .build(),
        );

        let previous = self
            .store
            .get(thread_id)
            .await
            .map_err(|e| ConversationError::from_store("Failed to load thread", e))?;

        match &previous {
            None => {
                info!("🆕 New thread {}", thread_id);
                self.logger.log(
                    ActivityLog::builder(thread_id, ActivityType::ThreadCreated)
                        .status(ActivityStatus::Info)
                        .build(),
                );
            }
            Some(thread) if thread.state == ThreadState::Error => {
                info!("Thread {} recovering from error state", thread_id);
                self.logger.log(
                    ActivityLog::builder(thread_id, ActivityType::ErrorCleared)
                        .version(thread.version)
                        .status(ActivityStatus::Info)
                        .build(),
                );
            }
            Some(_) => {}
        }

        let running = self
            .commit(thread_id, None, |thread| {
                thread.state = ThreadState::Running;
            })
            .await?;

        let base = merge(&running.context, &existing);
        let mut turn = TurnContext::new(thread_id, message, running.history.clone(), base);
        turn.sort = sort;

        if let Err(failure) = self.pipeline.run(&mut turn).await {
            error!("❌ Turn on thread {} failed: {}", thread_id, failure);
            let partial = turn.merged();

            self.logger.log(
                ActivityLog::builder(thread_id, ActivityType::StageFailed)
                    .message(message)
                    .stage(failure.stage)
                    .context(partial.to_value())
                    .processing_time(start_time.elapsed().as_millis())
                    .error(format!("{:#}", failure.error), "stage")
                    .build(),
            );

            if let Err(e) = self
                .commit(thread_id, Some(&partial), |thread| {
                    thread.state = ThreadState::Error;
                })
                .await
            {
                warn!("Could not mark thread {} as failed: {}", thread_id, e);
            }

            return Err(ConversationError::upstream(failure.to_string(), Some(partial)));
        }

        let reply = turn
            .reply
            .take()
            .unwrap_or_else(|| "Sorry, I couldn't put a reply together.".to_string());
        let listings = turn.listings.take();
        let user_turn = Turn::user(message);
        let agent_turn = Turn::agent(&reply);
        let partial = turn.merged();

        let committed = self
            .commit(thread_id, Some(&partial), |thread| {
                thread.context = merge(&merge(&thread.context, &existing), &turn.incoming);
                thread.history.push(user_turn.clone());
                thread.history.push(agent_turn.clone());
                if let Some(found) = &listings {
                    thread.listings = found.clone();
                }
                thread.state = ThreadState::Idle;
            })
            .await?;

        if let Some(sessions) = &self.sessions {
            let delivered =
                sessions.publish_for_thread(thread_id, SessionSnapshot::from_thread(&committed));
            if delivered > 0 {
                debug!("Published thread {} v{} to its share", thread_id, committed.version);
            }
        }

        info!(
            "✅ Thread {} committed v{} in {:?} ({:?})",
            thread_id,
            committed.version,
            start_time.elapsed(),
            turn.trace
        );
        self.logger.log(
            ActivityLog::builder(thread_id, ActivityType::TurnCommitted)
                .message(message)
                .response(&reply)
                .context(committed.context.to_value())
                .listing_count(listings.as_ref().map_or(0, Vec::len))
                .version(committed.version)
                .processing_time(start_time.elapsed().as_millis())
                .build(),
        );

        Ok(TurnOutcome {
            reply,
            context: committed.context,
            listings,
        })
    }

    /// Read-modify-write of one thread, re-reading after every conflict.
    async fn commit<F>(
        &self,
        thread_id: &str,
        partial: Option<&SearchContext>,
        mut apply: F,
    ) -> Result<ConversationThread, ConversationError>
    where
        F: FnMut(&mut ConversationThread),
    {
        let mut last_conflict = None;

        for attempt in 1..=self.max_commit_attempts {
            let current = self
                .store
                .get(thread_id)
                .await
                .map_err(|e| ConversationError::from_store("Failed to load thread", e))?;

            let mut thread = current.unwrap_or_else(|| ConversationThread::new(thread_id));
            let expected = thread.version;
            apply(&mut thread);
            thread.touch();

            match self.store.put(&thread, expected).await {
                Ok(version) => {
                    thread.version = version;
                    return Ok(thread);
                }
                Err(e @ (StoreError::VersionConflict { .. } | StoreError::HistoryRewrite(_))) => {
                    warn!(
                        "Commit conflict on thread {} (attempt {}/{}): {}",
                        thread_id, attempt, self.max_commit_attempts, e
                    );
                    self.logger.log(
                        ActivityLog::builder(thread_id, ActivityType::CommitConflict)
                            .version(expected)
                            .status(ActivityStatus::Warning)
                            .message(e.to_string())
                            .build(),
                    );
                    last_conflict = Some(e);
                }
                Err(e) => {
                    return Err(ConversationError::upstream(
                        format!("Failed to save thread: {}", e),
                        partial.cloned(),
                    ));
                }
            }
        }

        let detail = last_conflict.map(|e| e.to_string()).unwrap_or_default();
        Err(ConversationError::upstream(
            format!(
                "ConcurrencyConflict: gave up after {} attempts ({})",
                self.max_commit_attempts, detail
            ),
            partial.cloned(),
        ))
    }

    /// Current stored state of a thread.
    pub async fn load_thread(
        &self,
        thread_id: &str,
    ) -> Result<Option<ConversationThread>, ConversationError> {
        self.store
            .get(thread_id)
            .await
            .map_err(|e| ConversationError::from_store("Failed to load thread", e))
    }

    /// Purge idle threads and release unused thread locks.
    pub async fn purge_idle(&self) -> Result<usize, ConversationError> {
        let purged = self
            .store
            .purge_idle()
            .await
            .map_err(|e| ConversationError::from_store("Failed to purge threads", e))?;
        let pruned = self.leases.prune();
        if purged > 0 || pruned > 0 {
            info!("🧹 Purged {} idle threads, released {} thread locks", purged, pruned);
        }
        Ok(purged)
    }
}
