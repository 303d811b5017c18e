use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::time::Duration;

use crate::cache::{CacheStore, TtlCache};

/// Per-identity quota over a rolling window. Identities are only ever held as
/// SHA-256 hashes of their lowercased form.
pub struct RateLimiter {
    limit: u32,
    counts: TtlCache<u32>,
    whitelist: RwLock<HashSet<String>>,
}

pub fn hash_identity(identity: &str) -> String {
    let digest = Sha256::digest(identity.to_lowercase().as_bytes());
    hex::encode(digest)
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        RateLimiter {
            limit,
            counts: TtlCache::new(window),
            whitelist: RwLock::new(HashSet::new()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Count one request for `identity` and report whether it is over quota.
    /// A rejected request is not counted. Every counted request restarts the
    /// window, so the quota only comes back after a full window of quiet.
    pub fn is_exceeded(&self, identity: &str) -> bool {
        let hashed = hash_identity(identity);
        if self.whitelist.read().contains(&hashed) {
            return false;
        }

        let limit = self.limit;
        self.counts.upsert_with(&hashed, |current| {
            let count = current.copied().unwrap_or(0);
            if count >= limit {
                (None, true)
            } else {
                (Some(count + 1), false)
            }
        })
    }

    /// Requests left in the current window, without counting one.
    pub fn remaining(&self, identity: &str) -> u32 {
        let used = self.counts.get(&hash_identity(identity)).unwrap_or(0);
        self.limit.saturating_sub(used)
    }

    pub fn add_to_whitelist(&self, identity: &str) {
        self.whitelist.write().insert(hash_identity(identity));
    }

    pub fn remove_from_whitelist(&self, identity: &str) {
        self.whitelist.write().remove(&hash_identity(identity));
    }

    pub fn is_whitelisted(&self, identity: &str) -> bool {
        self.whitelist.read().contains(&hash_identity(identity))
    }

    pub fn reset_all(&self) {
        self.counts.clear();
    }

    /// Drop expired windows; called from the maintenance loop.
    pub fn sweep(&self) -> usize {
        self.counts.sweep()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourth_request_is_rejected() {
        let limiter = RateLimiter::new(3, Duration::from_secs(86400));
        assert!(!limiter.is_exceeded("a@x.org"));
        assert!(!limiter.is_exceeded("a@x.org"));
        assert!(!limiter.is_exceeded("a@x.org"));
        assert!(limiter.is_exceeded("a@x.org"));
        assert!(limiter.is_exceeded("A@X.org"));
        assert_eq!(limiter.remaining("a@x.org"), 0);

        limiter.add_to_whitelist("a@x.org");
        assert!(!limiter.is_exceeded("a@x.org"));
        assert!(limiter.is_whitelisted("A@x.ORG"));

        limiter.remove_from_whitelist("a@x.org");
        assert!(limiter.is_exceeded("a@x.org"));
    }

    #[test]
    fn test_identities_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(!limiter.is_exceeded("a@x.org"));
        assert!(!limiter.is_exceeded("b@x.org"));
        assert!(limiter.is_exceeded("a@x.org"));
    }

    #[test]
    fn test_reset_all_clears_counts() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(!limiter.is_exceeded("a@x.org"));
        assert!(limiter.is_exceeded("a@x.org"));
        limiter.reset_all();
        assert!(!limiter.is_exceeded("a@x.org"));
    }

    #[tokio::test]
    async fn test_window_expiry_restores_quota() {
        let limiter = RateLimiter::new(1, Duration::from_millis(30));
        assert!(!limiter.is_exceeded("a@x.org"));
        assert!(limiter.is_exceeded("a@x.org"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!limiter.is_exceeded("a@x.org"));
    }

    #[tokio::test]
    async fn test_counted_request_rolls_the_window() {
        let limiter = RateLimiter::new(3, Duration::from_millis(400));
        assert!(!limiter.is_exceeded("a@x.org"));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!limiter.is_exceeded("a@x.org"));
        // Past the first request's window, but the second one restarted it.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!limiter.is_exceeded("a@x.org"));
        assert!(limiter.is_exceeded("a@x.org"));

        // Rejected requests do not extend the window.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(limiter.is_exceeded("a@x.org"));
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!limiter.is_exceeded("a@x.org"));
    }

    #[test]
    fn test_hash_is_case_insensitive_hex() {
        let h = hash_identity("User@Example.com");
        assert_eq!(h, hash_identity("user@example.com"));
        assert_eq!(h.len(), 64);
        assert!(!h.contains('@'));
    }
}
