use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::id::generate_share_id;
use super::mirror::{NoopMirror, SessionMirror};
use super::types::{SessionSnapshot, SessionView, ShareError, VoteDirection, VoteTally, VoterTally};
use crate::config::settings::SharingConfig;
use crate::logging::{ActivityLog, ActivityLogger, ActivityStatus, ActivityType};

#[derive(Debug, Clone)]
pub struct SessionCacheConfig {
    pub idle_ttl: Duration,
    pub sweep_interval: Duration,
    pub max_id_attempts: usize,
}

impl Default for SessionCacheConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
            max_id_attempts: 8,
        }
    }
}

impl From<&SharingConfig> for SessionCacheConfig {
    fn from(cfg: &SharingConfig) -> Self {
        Self {
            idle_ttl: Duration::from_secs(cfg.idle_ttl_seconds.max(1)),
            sweep_interval: Duration::from_secs(cfg.sweep_interval_seconds.max(1)),
            max_id_attempts: cfg.max_id_attempts.max(1),
        }
    }
}

type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

struct SessionEntry {
    owner_thread_id: String,
    viewers: HashSet<String>,
    /// property id -> voter id -> Up/Down
    votes: HashMap<String, HashMap<String, VoteDirection>>,
    snapshot: Arc<SessionSnapshot>,
    revision: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_access: Instant,
    view_tx: watch::Sender<Arc<SessionView>>,
}

impl SessionEntry {
    fn new(share_id: &str, owner_thread_id: &str, seed: SessionSnapshot) -> Self {
        let now = Utc::now();
        let mut entry = Self {
            owner_thread_id: owner_thread_id.to_string(),
            viewers: HashSet::new(),
            votes: HashMap::new(),
            snapshot: Arc::new(seed),
            revision: 0,
            created_at: now,
            updated_at: now,
            last_access: Instant::now(),
            view_tx: watch::Sender::new(Arc::new(SessionView {
                share_id: share_id.to_string(),
                owner_thread_id: owner_thread_id.to_string(),
                revision: 0,
                snapshot: Arc::new(SessionSnapshot::default()),
                votes: BTreeMap::new(),
                viewer_count: 0,
                created_at: now,
                updated_at: now,
            })),
        };
        entry.broadcast(share_id);
        entry
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.last_access.elapsed() > ttl
    }

    fn tally(&self, property_id: &str) -> VoteTally {
        let mut tally = VoteTally::default();
        if let Some(voters) = self.votes.get(property_id) {
            for direction in voters.values() {
                match direction {
                    VoteDirection::Up => tally.upvotes += 1,
                    VoteDirection::Down => tally.downvotes += 1,
                    VoteDirection::None => {}
                }
            }
        }
        tally
    }

    /// Build the next view and hand it to every subscriber in one step.
    fn broadcast(&mut self, share_id: &str) -> Arc<SessionView> {
        self.revision += 1;
        self.updated_at = self.updated_at.max(Utc::now());

        let votes = self
            .votes
            .keys()
            .map(|pid| (pid.clone(), self.tally(pid)))
            .filter(|(_, t)| t.upvotes + t.downvotes > 0)
            .collect();

        let view = Arc::new(SessionView {
            share_id: share_id.to_string(),
            owner_thread_id: self.owner_thread_id.clone(),
            revision: self.revision,
            snapshot: self.snapshot.clone(),
            votes,
            viewer_count: self.viewers.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        });
        self.view_tx.send_replace(view.clone());
        view
    }
}

/// A viewer's subscription to one share.
pub struct ViewerHandle {
    pub share_id: String,
    pub viewer_id: String,
    receiver: watch::Receiver<Arc<SessionView>>,
}

impl ViewerHandle {
    /// Latest view, without waiting.
    pub fn current(&self) -> Arc<SessionView> {
        self.receiver.borrow().clone()
    }

    /// Wait for the next view. `None` once the share is gone.
    pub async fn changed(&mut self) -> Option<Arc<SessionView>> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }
}

/// In-process registry of shared sessions, one per conversation thread.
///
/// Each share keeps a `watch` channel of whole [`SessionView`]s, so viewers
/// only ever observe complete, immutable snapshots.
#[derive(Clone)]
pub struct SharedSessionCache {
    sessions: Arc<DashMap<String, SessionEntry>>,
    by_thread: Arc<DashMap<String, String>>,
    mirror: Arc<dyn SessionMirror>,
    logger: ActivityLogger,
    config: SessionCacheConfig,
    id_generator: IdGenerator,
}

impl SharedSessionCache {
    pub fn new(config: SessionCacheConfig, mirror: Arc<dyn SessionMirror>, logger: ActivityLogger) -> Self {
        info!(
            "Initializing shared session cache (idle ttl {:?}, mirror {})",
            config.idle_ttl,
            mirror.name()
        );
        Self {
            sessions: Arc::new(DashMap::new()),
            by_thread: Arc::new(DashMap::new()),
            mirror,
            logger,
            config,
            id_generator: Arc::new(generate_share_id),
        }
    }

    /// Replace the share id source. Used to exercise collision handling.
    pub fn with_id_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.id_generator = Arc::new(generator);
        self
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Share id for a thread's live session, if any.
    pub fn share_for_thread(&self, thread_id: &str) -> Option<String> {
        let share_id = self.by_thread.get(thread_id)?.value().clone();
        self.is_live(&share_id).then_some(share_id)
    }

    /// Create the share for `owner_thread_id`, or return its live one.
    pub fn create(&self, owner_thread_id: &str, seed: SessionSnapshot) -> Result<String, ShareError> {
        match self.by_thread.entry(owner_thread_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get().clone();
                if self.is_live(&existing) {
                    debug!("Thread {} already shared as {}", owner_thread_id, existing);
                    return Ok(existing);
                }
                if let Some((_, stale)) = self.sessions.remove(&existing) {
                    self.retire(&existing, &stale.owner_thread_id);
                }
                let share_id = self.insert_session(owner_thread_id, seed)?;
                occupied.insert(share_id.clone());
                Ok(share_id)
            }
            Entry::Vacant(vacant) => {
                let share_id = self.insert_session(owner_thread_id, seed)?;
                vacant.insert(share_id.clone());
                Ok(share_id)
            }
        }
    }

    fn insert_session(&self, owner_thread_id: &str, seed: SessionSnapshot) -> Result<String, ShareError> {
        for attempt in 1..=self.config.max_id_attempts {
            let share_id = (self.id_generator)();
            match self.sessions.entry(share_id.clone()) {
                Entry::Occupied(_) => {
                    warn!("Share id collision on attempt {}, regenerating", attempt);
                }
                Entry::Vacant(vacant) => {
                    let entry = vacant.insert(SessionEntry::new(&share_id, owner_thread_id, seed));
                    let view = entry.view_tx.borrow().clone();
                    drop(entry);

                    info!("Created share {} for thread {}", share_id, owner_thread_id);
                    self.logger.log(
                        ActivityLog::builder(owner_thread_id, ActivityType::ShareCreated)
                            .share(&share_id)
                            .build(),
                    );
                    self.mirror_view(view);
                    return Ok(share_id);
                }
            }
        }

        Err(ShareError::IdSpaceExhausted(self.config.max_id_attempts))
    }

    fn is_live(&self, share_id: &str) -> bool {
        self.sessions
            .get(share_id)
            .is_some_and(|e| !e.is_expired(self.config.idle_ttl))
    }

    /// Mutable access to a live session, evicting it if it has gone idle.
    fn live_entry(&self, share_id: &str) -> Result<RefMut<'_, String, SessionEntry>, ShareError> {
        let entry = self.sessions.get_mut(share_id).ok_or(ShareError::NotFound)?;
        if entry.is_expired(self.config.idle_ttl) {
            drop(entry);
            self.evict(share_id);
            return Err(ShareError::NotFound);
        }
        Ok(entry)
    }

    fn evict(&self, share_id: &str) {
        let Some((_, entry)) = self.sessions.remove(share_id) else {
            return;
        };
        self.by_thread
            .remove_if(&entry.owner_thread_id, |_, id| id == share_id);
        self.retire(share_id, &entry.owner_thread_id);
    }

    /// Bookkeeping for a share already taken out of `sessions`. Does not
    /// touch `by_thread`, so it is safe while holding one of its entries.
    fn retire(&self, share_id: &str, owner_thread_id: &str) {
        debug!("Share {} expired, removed from cache", share_id);
        self.logger.log(
            ActivityLog::builder(owner_thread_id, ActivityType::SessionExpired)
                .share(share_id)
                .status(ActivityStatus::Info)
                .build(),
        );
        self.mirror_remove(share_id.to_string());
    }

    /// Current view of a share.
    pub fn get(&self, share_id: &str) -> Result<Arc<SessionView>, ShareError> {
        let mut entry = self.live_entry(share_id)?;
        entry.last_access = Instant::now();
        let view = entry.view_tx.borrow().clone();
        Ok(view)
    }

    /// Join as a new viewer.
    pub fn join(&self, share_id: &str) -> Result<ViewerHandle, ShareError> {
        self.join_as(share_id, &uuid::Uuid::new_v4().to_string())
    }

    /// Join (or rejoin) with a known viewer id.
    pub fn join_as(&self, share_id: &str, viewer_id: &str) -> Result<ViewerHandle, ShareError> {
        let (receiver, owner) = {
            let mut entry = self.live_entry(share_id)?;
            entry.last_access = Instant::now();
            if entry.viewers.insert(viewer_id.to_string()) {
                entry.broadcast(share_id);
            }
            (entry.view_tx.subscribe(), entry.owner_thread_id.clone())
        };

        debug!("Viewer {} joined share {}", viewer_id, share_id);
        self.logger.log(
            ActivityLog::builder(owner, ActivityType::ViewerJoined)
                .share(share_id)
                .build(),
        );

        Ok(ViewerHandle {
            share_id: share_id.to_string(),
            viewer_id: viewer_id.to_string(),
            receiver,
        })
    }

    /// Turn a viewer's participation on or off. Repeating a call is a no-op.
    pub fn toggle_participation(
        &self,
        share_id: &str,
        viewer_id: &str,
        enable: bool,
    ) -> Result<Arc<SessionView>, ShareError> {
        let mut entry = self.live_entry(share_id)?;
        entry.last_access = Instant::now();

        let changed = if enable {
            entry.viewers.insert(viewer_id.to_string())
        } else {
            entry.viewers.remove(viewer_id)
        };

        if !changed {
            return Ok(entry.view_tx.borrow().clone());
        }

        let view = entry.broadcast(share_id);
        let owner = entry.owner_thread_id.clone();
        drop(entry);

        if !enable {
            debug!("Viewer {} left share {}", viewer_id, share_id);
            self.logger.log(
                ActivityLog::builder(owner, ActivityType::ViewerLeft)
                    .share(share_id)
                    .build(),
            );
        }
        Ok(view)
    }

    /// Atomically replace a share's listings, query record and chat history
    /// and broadcast the result.
    pub fn publish(&self, share_id: &str, snapshot: SessionSnapshot) -> Result<Arc<SessionView>, ShareError> {
        let view = {
            let mut entry = self.live_entry(share_id)?;
            entry.last_access = Instant::now();
            entry.snapshot = Arc::new(snapshot);
            entry.broadcast(share_id)
        };

        debug!(
            "Published share {} rev {} to {} viewers",
            share_id, view.revision, view.viewer_count
        );
        self.mirror_view(view.clone());
        Ok(view)
    }

    /// Publish to the thread's share, if it has one. Never fails the caller.
    pub fn publish_for_thread(&self, thread_id: &str, snapshot: SessionSnapshot) -> usize {
        let Some(share_id) = self.by_thread.get(thread_id).map(|e| e.value().clone()) else {
            return 0;
        };

        match self.publish(&share_id, snapshot) {
            Ok(_) => 1,
            Err(ShareError::NotFound) => {
                self.by_thread.remove_if(thread_id, |_, id| id == &share_id);
                debug!("Share {} for thread {} has expired, nothing to publish", share_id, thread_id);
                0
            }
            Err(e) => {
                warn!("Publish to share {} for thread {} failed: {}", share_id, thread_id, e);
                self.logger.log(
                    ActivityLog::builder(thread_id, ActivityType::PublishFailed)
                        .share(&share_id)
                        .error(e.to_string(), "share")
                        .build(),
                );
                0
            }
        }
    }

    /// Cast, change or withdraw (`None`) a vote on a shared listing.
    pub fn vote(
        &self,
        share_id: &str,
        property_id: &str,
        voter_id: &str,
        direction: VoteDirection,
    ) -> Result<VoteTally, ShareError> {
        let mut entry = self.live_entry(share_id)?;
        entry.last_access = Instant::now();

        if !entry.snapshot.contains_listing(property_id) {
            return Err(ShareError::PropertyNotShared);
        }

        let changed = {
            let voters = entry.votes.entry(property_id.to_string()).or_default();
            match direction {
                VoteDirection::None => voters.remove(voter_id).is_some(),
                vote => voters.insert(voter_id.to_string(), vote) != Some(vote),
            }
        };

        let tally = entry.tally(property_id);
        if changed {
            let view = entry.broadcast(share_id);
            drop(entry);
            self.mirror_view(view);
        }
        Ok(tally)
    }

    /// Per-listing tallies. With `voter_id`, each entry also carries that
    /// voter's own vote. Listings nobody voted on are left out.
    pub fn votes_for(
        &self,
        share_id: &str,
        voter_id: Option<&str>,
    ) -> Result<BTreeMap<String, VoterTally>, ShareError> {
        let mut entry = self.live_entry(share_id)?;
        entry.last_access = Instant::now();

        let votes = entry
            .votes
            .iter()
            .map(|(property_id, voters)| {
                let tally = entry.tally(property_id);
                let user_vote = voter_id.and_then(|v| voters.get(v).copied());
                (
                    property_id.clone(),
                    VoterTally {
                        upvotes: tally.upvotes,
                        downvotes: tally.downvotes,
                        user_vote,
                    },
                )
            })
            .filter(|(_, t)| t.upvotes + t.downvotes > 0)
            .collect();
        Ok(votes)
    }

    /// Evict every idle share. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let ttl = self.config.idle_ttl;
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.is_expired(ttl))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for share_id in expired {
            let still_expired = self
                .sessions
                .get(&share_id)
                .is_some_and(|e| e.is_expired(ttl));
            if still_expired {
                self.evict(&share_id);
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Swept {} idle shares", removed);
        }
        removed
    }

    /// Background sweep loop.
    pub async fn run_sweeper(self: Arc<Self>) {
        info!("Share sweeper started (every {:?})", self.config.sweep_interval);
        loop {
            tokio::time::sleep(self.config.sweep_interval).await;
            self.sweep_expired();
        }
    }

    /// Drop every share, closing all viewer channels.
    pub fn shutdown(&self) {
        let count = self.sessions.len();
        self.sessions.clear();
        self.by_thread.clear();
        info!("Shared session cache closed ({} shares dropped)", count);
    }

    fn mirror_view(&self, view: Arc<SessionView>) {
        if !self.mirror.is_enabled() {
            return;
        }
        let mirror = self.mirror.clone();
        let logger = self.logger.clone();
        let ttl = self.config.idle_ttl;

        tokio::spawn(async move {
            if let Err(e) = mirror.store(&view, ttl).await {
                warn!("Mirror write for share {} failed: {:#}", view.share_id, e);
                logger.log(
                    ActivityLog::builder(&view.owner_thread_id, ActivityType::PublishFailed)
                        .share(&view.share_id)
                        .error(format!("{:#}", e), "mirror")
                        .build(),
                );
            }
        });
    }

    fn mirror_remove(&self, share_id: String) {
        if !self.mirror.is_enabled() {
            return;
        }
        let mirror = self.mirror.clone();
        tokio::spawn(async move {
            if let Err(e) = mirror.remove(&share_id).await {
                warn!("Mirror delete for share {} failed: {:#}", share_id, e);
            }
        });
    }
}

impl Default for SharedSessionCache {
    fn default() -> Self {
        Self::new(
            SessionCacheConfig::default(),
            Arc::new(NoopMirror),
            ActivityLogger::disabled(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::ListingSummary;
    use crate::services::context::SearchContext;
    use parking_lot::Mutex;

    fn listing(id: &str) -> ListingSummary {
        ListingSummary {
            id: id.to_string(),
            address: format!("{} Main St", id),
            neighborhood: Some("Williamsburg".to_string()),
            borough: Some("Brooklyn".to_string()),
            price: Some(2900.0),
            bedrooms: Some(2),
            bathrooms: Some(1.0),
            sqft: None,
            property_type: Some("rental".to_string()),
            no_fee: true,
            thumbnail_image: None,
        }
    }

    fn snapshot(ids: &[&str]) -> SessionSnapshot {
        SessionSnapshot {
            listings: ids.iter().map(|id| listing(id)).collect(),
            query_record: SearchContext {
                bedrooms: Some(2),
                ..Default::default()
            },
            chat_history: Vec::new(),
        }
    }

    fn cache_with_ttl(ttl: Duration) -> SharedSessionCache {
        SharedSessionCache::new(
            SessionCacheConfig {
                idle_ttl: ttl,
                ..Default::default()
            },
            Arc::new(NoopMirror),
            ActivityLogger::disabled(),
        )
    }

    #[test]
    fn test_create_is_idempotent_per_thread() {
        let cache = SharedSessionCache::default();
        let a = cache.create("t1", snapshot(&["p1"])).unwrap();
        let b = cache.create("t1", snapshot(&["p2"])).unwrap();
        let c = cache.create("t2", snapshot(&[])).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.share_for_thread("t1"), Some(a));
    }

    #[test]
    fn test_colliding_ids_are_regenerated() {
        let ids = Arc::new(Mutex::new(vec!["fresh", "dup", "dup"]));
        let cache = SharedSessionCache::default().with_id_generator({
            let ids = ids.clone();
            move || ids.lock().pop().unwrap_or("exhausted").to_string()
        });

        assert_eq!(cache.create("t1", snapshot(&[])).unwrap(), "dup");
        assert_eq!(cache.create("t2", snapshot(&[])).unwrap(), "fresh");
    }

    #[test]
    fn test_id_space_exhaustion_is_reported() {
        let cache = SharedSessionCache::default().with_id_generator(|| "same".to_string());
        cache.create("t1", snapshot(&[])).unwrap();
        assert_eq!(
            cache.create("t2", snapshot(&[])),
            Err(ShareError::IdSpaceExhausted(8))
        );
    }

    #[test]
    fn test_join_unknown_share_is_not_found() {
        let cache = SharedSessionCache::default();
        assert!(matches!(cache.join("missing"), Err(ShareError::NotFound)));
        assert!(matches!(cache.get("missing"), Err(ShareError::NotFound)));
    }

    #[tokio::test]
    async fn test_viewers_receive_identical_snapshot() {
        let cache = SharedSessionCache::default();
        let share_id = cache.create("t1", snapshot(&["p1"])).unwrap();

        let mut alice = cache.join(&share_id).unwrap();
        let mut bob = cache.join(&share_id).unwrap();

        cache.publish(&share_id, snapshot(&["p1", "p2"])).unwrap();

        let a = alice.changed().await.unwrap();
        let b = bob.changed().await.unwrap();

        assert!(Arc::ptr_eq(&a.snapshot, &b.snapshot));
        assert_eq!(a.revision, b.revision);
        assert_eq!(a.snapshot.listings.len(), 2);
        assert_eq!(a.viewer_count, 2);
    }

    #[tokio::test]
    async fn test_publish_replaces_wholesale() {
        let cache = SharedSessionCache::default();
        let share_id = cache.create("t1", snapshot(&["p1", "p2"])).unwrap();

        let view = cache.publish(&share_id, snapshot(&["p3"])).unwrap();
        let ids: Vec<&str> = view.snapshot.listings.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["p3"]);
        assert!(view.updated_at >= view.created_at);
    }

    #[test]
    fn test_publish_for_thread_without_share_is_noop() {
        let cache = SharedSessionCache::default();
        assert_eq!(cache.publish_for_thread("nobody", snapshot(&[])), 0);
    }

    #[test]
    fn test_toggle_participation_is_idempotent() {
        let cache = SharedSessionCache::default();
        let share_id = cache.create("t1", snapshot(&[])).unwrap();

        let on = cache.toggle_participation(&share_id, "v1", true).unwrap();
        let again = cache.toggle_participation(&share_id, "v1", true).unwrap();
        assert_eq!(on.viewer_count, 1);
        assert_eq!(again.revision, on.revision);

        let other = cache.toggle_participation(&share_id, "v2", true).unwrap();
        assert_eq!(other.viewer_count, 2);

        let off = cache.toggle_participation(&share_id, "v1", false).unwrap();
        let off_again = cache.toggle_participation(&share_id, "v1", false).unwrap();
        assert_eq!(off.viewer_count, 1);
        assert_eq!(off_again.revision, off.revision);
    }

    #[test]
    fn test_vote_semantics() {
        let cache = SharedSessionCache::default();
        let share_id = cache.create("t1", snapshot(&["p1"])).unwrap();

        let up = cache.vote(&share_id, "p1", "s1", VoteDirection::Up).unwrap();
        assert_eq!(up, VoteTally { upvotes: 1, downvotes: 0 });

        let same = cache.vote(&share_id, "p1", "s1", VoteDirection::Up).unwrap();
        assert_eq!(same, up);

        let swapped = cache.vote(&share_id, "p1", "s1", VoteDirection::Down).unwrap();
        assert_eq!(swapped, VoteTally { upvotes: 0, downvotes: 1 });

        let cleared = cache.vote(&share_id, "p1", "s1", VoteDirection::None).unwrap();
        assert_eq!(cleared, VoteTally::default());

        assert_eq!(
            cache.vote(&share_id, "p9", "s1", VoteDirection::Up),
            Err(ShareError::PropertyNotShared)
        );
    }

    #[test]
    fn test_votes_for_reports_own_vote() {
        let cache = SharedSessionCache::default();
        let share_id = cache.create("t1", snapshot(&["p1", "p2", "p3"])).unwrap();
        cache.vote(&share_id, "p1", "s1", VoteDirection::Up).unwrap();
        cache.vote(&share_id, "p1", "s2", VoteDirection::Up).unwrap();
        cache.vote(&share_id, "p2", "s2", VoteDirection::Down).unwrap();
        cache.vote(&share_id, "p3", "s1", VoteDirection::Up).unwrap();
        cache.vote(&share_id, "p3", "s1", VoteDirection::None).unwrap();

        let mine = cache.votes_for(&share_id, Some("s1")).unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(
            mine["p1"],
            VoterTally { upvotes: 2, downvotes: 0, user_vote: Some(VoteDirection::Up) }
        );
        assert_eq!(
            mine["p2"],
            VoterTally { upvotes: 0, downvotes: 1, user_vote: None }
        );

        let anonymous = cache.votes_for(&share_id, None).unwrap();
        assert!(anonymous.values().all(|t| t.user_vote.is_none()));
        assert_eq!(cache.votes_for("missing", Some("s1")), Err(ShareError::NotFound));
    }

    /// Records mirror traffic so eviction side effects can be checked.
    #[derive(Default)]
    struct RecordingMirror {
        stored: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl SessionMirror for RecordingMirror {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn store(&self, view: &SessionView, _ttl: Duration) -> anyhow::Result<()> {
            self.stored.lock().push(view.share_id.clone());
            Ok(())
        }

        async fn remove(&self, share_id: &str) -> anyhow::Result<()> {
            self.removed.lock().push(share_id.to_string());
            Ok(())
        }
    }

    fn recorded_cache(ttl: Duration) -> (SharedSessionCache, Arc<RecordingMirror>) {
        let mirror = Arc::new(RecordingMirror::default());
        let cache = SharedSessionCache::new(
            SessionCacheConfig {
                idle_ttl: ttl,
                ..Default::default()
            },
            mirror.clone(),
            ActivityLogger::disabled(),
        );
        (cache, mirror)
    }

    #[tokio::test]
    async fn test_recreating_expired_share_retires_old_one() {
        let (cache, mirror) = recorded_cache(Duration::from_millis(20));
        let old = cache.create("t1", snapshot(&[])).unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let new = cache.create("t1", snapshot(&[])).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_ne!(old, new);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.share_for_thread("t1"), Some(new));
        assert_eq!(*mirror.removed.lock(), vec![old]);
    }

    #[tokio::test]
    async fn test_publish_after_expiry_forgets_thread_share() {
        let (cache, mirror) = recorded_cache(Duration::from_millis(20));
        let share_id = cache.create("t1", snapshot(&[])).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(cache.publish_for_thread("t1", snapshot(&["p1"])), 0);
        assert!(!cache.by_thread.contains_key("t1"));
        assert_eq!(cache.publish_for_thread("t1", snapshot(&["p1"])), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*mirror.removed.lock(), vec![share_id.clone()]);
        // Only the create was mirrored.
        assert_eq!(*mirror.stored.lock(), vec![share_id]);
    }

    #[tokio::test]
    async fn test_idle_shares_expire_lazily_and_by_sweep() {
        let cache = cache_with_ttl(Duration::from_millis(20));
        let lazy = cache.create("t1", snapshot(&[])).unwrap();
        let _swept = cache.create("t2", snapshot(&[])).unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(matches!(cache.join(&lazy), Err(ShareError::NotFound)));
        assert_eq!(cache.sweep_expired(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.share_for_thread("t1"), None);
    }

    #[tokio::test]
    async fn test_viewer_stream_ends_when_share_evicted() {
        let cache = cache_with_ttl(Duration::from_millis(20));
        let share_id = cache.create("t1", snapshot(&[])).unwrap();
        let mut viewer = cache.join(&share_id).unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.sweep_expired();

        assert!(viewer.changed().await.is_none());
    }
}
