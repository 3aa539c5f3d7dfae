//! Expiring key/value cache for derived views that are expensive to build.
//!
//! Expiry is checked on every read, so a stale value is never returned even
//! if the sweeper has not run yet.  The sweeper only bounds memory: it wakes
//! on a fixed period and drops whatever has expired.  It holds a weak
//! reference and exits once the last cache handle is dropped.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::trace;

/// How often expired entries are physically removed.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(5);

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

type Map<V> = RwLock<HashMap<String, Entry<V>>>;

pub struct TtlCache<V> {
    entries: Arc<Map<V>>,
    ttl: Duration,
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            ttl: self.ttl,
        }
    }
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Must be called from within a Tokio runtime (spawns the sweeper).
    pub fn new(ttl: Duration) -> Self {
        Self::with_sweep_period(ttl, SWEEP_PERIOD)
    }

    pub fn with_sweep_period(ttl: Duration, period: Duration) -> Self {
        let entries: Arc<Map<V>> = Arc::new(RwLock::new(HashMap::new()));
        tokio::spawn(sweep(Arc::downgrade(&entries), period));
        Self { entries, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store `value`, replacing any previous entry and restarting its TTL.
    pub fn set(&self, key: impl Into<String>, value: V) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), entry);
    }

    /// The live value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|e| Instant::now() < e.expires_at)
            .map(|e| e.value.clone())
    }

    pub fn remove(&self, key: &str) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Physically stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn sweep<V>(entries: Weak<Map<V>>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(entries) = entries.upgrade() else {
            trace!("cache dropped; sweeper exiting");
            return;
        };
        let now = Instant::now();
        let mut map = entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = map.len();
        map.retain(|_, e| e.expires_at > now);
        let removed = before - map.len();
        if removed > 0 {
            trace!(removed, "swept expired cache entries");
        }
    }
}
