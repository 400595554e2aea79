use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::types::SessionView;

/// Out-of-process copy of share views, for other instances and late readers.
#[async_trait]
pub trait SessionMirror: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_enabled(&self) -> bool {
        true
    }

    async fn store(&self, view: &SessionView, ttl: Duration) -> Result<()>;

    async fn remove(&self, share_id: &str) -> Result<()>;
}

/// Mirror used when Redis is not configured or unreachable.
pub struct NoopMirror;

#[async_trait]
impl SessionMirror for NoopMirror {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn store(&self, _view: &SessionView, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _share_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Exponential delay between Redis connection attempts.
#[derive(Debug, Clone)]
struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    delay: Duration,
    next_attempt: Option<Instant>,
}

impl ReconnectBackoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            delay: initial,
            next_attempt: None,
        }
    }

    fn ready(&self, now: Instant) -> bool {
        self.next_attempt.is_none_or(|at| now >= at)
    }

    /// Schedule the next attempt and return how long it is away.
    fn failed(&mut self, now: Instant) -> Duration {
        let wait = self.delay;
        self.next_attempt = Some(now + wait);
        self.delay = (self.delay * 2).min(self.max);
        wait
    }

    fn succeeded(&mut self) {
        self.delay = self.initial;
        self.next_attempt = None;
    }
}

/// Redis mirror: `SET <prefix>:<id> EX ttl` plus a `PUBLISH` on
/// `<prefix>:<id>:updates`.
///
/// Connecting is lazy. While Redis is unreachable, writes are skipped and
/// the next write after the backoff delay tries again. Once connected, the
/// connection manager handles reconnects itself.
pub struct RedisMirror {
    client: redis::Client,
    conn: tokio::sync::Mutex<Option<ConnectionManager>>,
    backoff: parking_lot::Mutex<ReconnectBackoff>,
    connect_timeout: Duration,
    connect_attempts: AtomicU32,
    key_prefix: String,
}

impl RedisMirror {
    pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
    pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

    /// Validate `url` without connecting.
    pub fn new(url: &str, key_prefix: &str, connect_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid Redis URL")?;
        Ok(Self {
            client,
            conn: tokio::sync::Mutex::new(None),
            backoff: parking_lot::Mutex::new(ReconnectBackoff::new(
                Self::INITIAL_BACKOFF,
                Self::MAX_BACKOFF,
            )),
            connect_timeout,
            connect_attempts: AtomicU32::new(0),
            key_prefix: key_prefix.to_string(),
        })
    }

    /// Live connection, connecting first if the backoff allows it.
    /// `None` means Redis is currently unreachable.
    async fn connection(&self) -> Option<ConnectionManager> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Some(conn.clone());
        }
        if !self.backoff.lock().ready(Instant::now()) {
            return None;
        }

        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        let attempt = tokio::time::timeout(
            self.connect_timeout,
            ConnectionManager::new(self.client.clone()),
        )
        .await;

        match attempt {
            Ok(Ok(conn)) => {
                info!("✅ Redis mirror connected ({})", self.key_prefix);
                self.backoff.lock().succeeded();
                *slot = Some(conn.clone());
                Some(conn)
            }
            Ok(Err(e)) => {
                let wait = self.backoff.lock().failed(Instant::now());
                warn!("⚠️ Redis mirror connect failed, retrying in {:?}: {}", wait, e);
                None
            }
            Err(_) => {
                let wait = self.backoff.lock().failed(Instant::now());
                warn!(
                    "⚠️ Redis mirror connect timed out after {:?}, retrying in {:?}",
                    self.connect_timeout, wait
                );
                None
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    fn key(&self, share_id: &str) -> String {
        format!("{}:{}", self.key_prefix, share_id)
    }
}

#[async_trait]
impl SessionMirror for RedisMirror {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn store(&self, view: &SessionView, ttl: Duration) -> Result<()> {
        let Some(mut conn) = self.connection().await else {
            debug!("Redis mirror offline, skipping share {}", view.share_id);
            return Ok(());
        };
        let payload = serde_json::to_string(view)?;
        let key = self.key(&view.share_id);

        conn.set_ex::<_, _, ()>(&key, &payload, ttl.as_secs().max(1))
            .await
            .context("SET share view")?;
        let receivers: i64 = conn
            .publish(format!("{}:updates", key), &payload)
            .await
            .context("PUBLISH share view")?;

        debug!(
            "Mirrored share {} rev {} to Redis ({} subscribers)",
            view.share_id, view.revision, receivers
        );
        Ok(())
    }

    async fn remove(&self, share_id: &str) -> Result<()> {
        let Some(mut conn) = self.connection().await else {
            debug!("Redis mirror offline, skipping delete of share {}", share_id);
            return Ok(());
        };
        conn.del::<_, ()>(self.key(share_id))
            .await
            .context("DEL share view")?;
        Ok(())
    }
}

/// Build the share mirror. An unreachable Redis is retried in the
/// background of later writes; only a disabled mirror or a malformed URL
/// yields [`NoopMirror`].
pub async fn connect_mirror(
    enabled: bool,
    url: &str,
    key_prefix: &str,
    timeout: Duration,
) -> Arc<dyn SessionMirror> {
    if !enabled {
        info!("Redis mirror disabled, shares stay in-process");
        return Arc::new(NoopMirror);
    }

    let mirror = match RedisMirror::new(url, key_prefix, timeout) {
        Ok(mirror) => mirror,
        Err(e) => {
            warn!("⚠️ Redis mirror misconfigured, continuing without it: {:#}", e);
            return Arc::new(NoopMirror);
        }
    };

    if mirror.connection().await.is_none() {
        warn!("⚠️ Redis unavailable at startup, share mirror will keep retrying");
    }
    Arc::new(mirror)
}
