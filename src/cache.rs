use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Key/value store with per-entry expiry. Backends are in-memory today; a
/// shared store only has to honour "never return an expired entry".
pub trait CacheStore<V>: Send + Sync {
    fn get(&self, key: &str) -> Option<V>;
    fn insert(&self, key: &str, value: V);
    fn insert_with_ttl(&self, key: &str, value: V, ttl: Duration);
    fn remove(&self, key: &str);
    /// Drop expired entries, returning how many were removed.
    fn sweep(&self) -> usize;
    fn clear(&self);
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

pub struct TtlCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    default_ttl: Duration,
}

impl<V: Clone + Send + Sync> TtlCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        TtlCache {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Read-modify-write under one lock. `f` sees the live value (if any) and
    /// returns the replacement plus a result. A written entry expires one
    /// default TTL from now; returning `None` leaves the entry untouched.
    pub fn upsert_with<R>(&self, key: &str, f: impl FnOnce(Option<&V>) -> (Option<V>, R)) -> R {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let live = entries.get(key).filter(|e| e.is_live(now));

        let (replacement, result) = f(live.map(|e| &e.value));
        match replacement {
            Some(value) => {
                let expires_at = now + self.default_ttl;
                entries.insert(key.to_string(), CacheEntry { value, expires_at });
            }
            None => {
                if entries.get(key).is_some_and(|e| !e.is_live(now)) {
                    entries.remove(key);
                }
            }
        }
        result
    }
}

impl<V: Clone + Send + Sync> CacheStore<V> for TtlCache<V> {
    fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn insert(&self, key: &str, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    fn insert_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().insert(key.to_string(), entry);
    }

    fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Periodically drop expired entries so memory tracks the live set.
pub fn spawn_sweeper<V: 'static>(
    name: &'static str,
    cache: Arc<dyn CacheStore<V>>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = cache.sweep();
            if removed > 0 {
                log::debug!("{name} cache: swept {removed} expired entries");
            }
        }
    })
}
