//! Rate limiting implementation for the request shield.
//!
//! Fixed-window counters are kept per key in a [`RateLimitStore`]. Entries that
//! accrued violations survive the background sweep so abuse history is not lost
//! when a window rolls over.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::core::clock::{Clock, SystemClock};
use crate::models::RateLimitConfig;
use crate::utils::{ceil_seconds_until, duration_from_ms, saturating_add};

/// Consumption of one key in its current window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitEntry {
    pub count: u32,
    pub window_reset_at: DateTime<Utc>,
    /// Survives window resets
    pub violation_count: u32,
}

impl RateLimitEntry {
    /// A window is over once its reset instant is reached
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_reset_at
    }
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

/// Limiter statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RateLimitStats {
    pub total_entries: usize,
    pub active_entries: usize,
    pub total_violations: u64,
}

/// Storage for per-key rate limit entries
pub trait RateLimitStore: Send {
    fn get(&self, key: &str) -> Option<&RateLimitEntry>;
    fn get_mut(&mut self, key: &str) -> Option<&mut RateLimitEntry>;
    fn insert(&mut self, key: String, entry: RateLimitEntry);
    fn remove(&mut self, key: &str) -> Option<RateLimitEntry>;
    /// Keep only the entries for which `keep` returns true; returns how many were dropped
    fn retain(&mut self, keep: &mut dyn FnMut(&str, &RateLimitEntry) -> bool) -> usize;
    fn entries(&self) -> Box<dyn Iterator<Item = (&str, &RateLimitEntry)> + '_>;
    fn clear(&mut self);
}

/// In-process store backed by a `HashMap`
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: HashMap<String, RateLimitEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimitStore for MemoryStore {
    fn get(&self, key: &str) -> Option<&RateLimitEntry> {
        self.entries.get(key)
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut RateLimitEntry> {
        self.entries.get_mut(key)
    }

    fn insert(&mut self, key: String, entry: RateLimitEntry) {
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, key: &str) -> Option<RateLimitEntry> {
        self.entries.remove(key)
    }

    fn retain(&mut self, keep: &mut dyn FnMut(&str, &RateLimitEntry) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, entry| keep(key.as_str(), &*entry));
        before - self.entries.len()
    }

    fn entries(&self) -> Box<dyn Iterator<Item = (&str, &RateLimitEntry)> + '_> {
        Box::new(self.entries.iter().map(|(key, entry)| (key.as_str(), entry)))
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

type SharedStore = Arc<Mutex<Box<dyn RateLimitStore>>>;

fn lock_store(store: &SharedStore) -> MutexGuard<'_, Box<dyn RateLimitStore>> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove expired entries that carry no violations
fn sweep(store: &SharedStore, now: DateTime<Utc>) -> usize {
    let mut store = lock_store(store);
    store.retain(&mut |_, entry| !(entry.is_expired(now) && entry.violation_count == 0))
}

/// Fixed-window rate limiter
pub struct RateLimiter {
    store: SharedStore,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    /// Create a new rate limiter instance backed by a [`MemoryStore`]
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_store(config, Box::new(MemoryStore::new()), Arc::new(SystemClock))
    }

    /// Create a rate limiter with a custom store and time source
    pub fn with_store(
        config: RateLimitConfig,
        store: Box<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            config,
            clock,
            cleanup_task: Mutex::new(None),
        }
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_store(config, Box::new(MemoryStore::new()), clock)
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check whether a request for `key` is allowed and count it
    ///
    /// # Arguments
    ///
    /// * `key` - The key to rate limit (e.g., IP address or user ID)
    pub fn is_allowed(&self, key: &str) -> RateLimitDecision {
        let now = self.clock.now();
        let max = self.config.max_requests;
        let mut store = lock_store(&self.store);

        match store.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                if entry.count >= max {
                    entry.violation_count = entry.violation_count.saturating_add(1);
                    metrics::increment_counter!("shield_rate_limit_denied_total");
                    warn!(
                        "Rate limit exceeded for {} ({} violations)",
                        key, entry.violation_count
                    );
                    RateLimitDecision {
                        allowed: false,
                        remaining: 0,
                        reset_at: entry.window_reset_at,
                        retry_after_seconds: Some(ceil_seconds_until(now, entry.window_reset_at)),
                    }
                } else {
                    entry.count += 1;
                    RateLimitDecision {
                        allowed: true,
                        remaining: max - entry.count,
                        reset_at: entry.window_reset_at,
                        retry_after_seconds: None,
                    }
                }
            }
            Some(entry) => {
                entry.count = 1;
                entry.window_reset_at = self.window_end(now);
                RateLimitDecision {
                    allowed: true,
                    remaining: max.saturating_sub(1),
                    reset_at: entry.window_reset_at,
                    retry_after_seconds: None,
                }
            }
            None => {
                let reset_at = self.window_end(now);
                store.insert(
                    key.to_string(),
                    RateLimitEntry {
                        count: 1,
                        window_reset_at: reset_at,
                        violation_count: 0,
                    },
                );
                RateLimitDecision {
                    allowed: true,
                    remaining: max.saturating_sub(1),
                    reset_at,
                    retry_after_seconds: None,
                }
            }
        }
    }

    fn window_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        saturating_add(now, duration_from_ms(self.config.window_ms))
    }

    /// Drop the entry for `key` unconditionally
    pub fn reset(&self, key: &str) {
        lock_store(&self.store).remove(key);
    }

    pub fn entry(&self, key: &str) -> Option<RateLimitEntry> {
        lock_store(&self.store).get(key).cloned()
    }

    /// Run one sweep now; returns the number of entries removed
    pub fn cleanup(&self) -> usize {
        sweep(&self.store, self.clock.now())
    }

    /// Start the periodic background sweep. Must be called from within a tokio runtime.
    /// Calling it again while a sweep is running is a no-op.
    pub fn start_cleanup(&self) {
        let mut task = self
            .cleanup_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }

        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let period = StdDuration::from_secs(self.config.cleanup_interval_secs.max(1));

        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = sweep(&store, clock.now());
                if removed > 0 {
                    metrics::counter!("shield_rate_limit_sweep_removed_total", removed as u64);
                }
                debug!("Rate limit sweep removed {} expired entries", removed);
            }
        }));
    }

    /// Stop the background sweep and clear all entries. Safe to call repeatedly.
    pub fn destroy(&self) {
        if let Some(task) = self
            .cleanup_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        lock_store(&self.store).clear();
    }

    pub fn stats(&self) -> RateLimitStats {
        let now = self.clock.now();
        let store = lock_store(&self.store);
        store
            .entries()
            .fold(RateLimitStats::default(), |mut stats, (_, entry)| {
                stats.total_entries += 1;
                if !entry.is_expired(now) {
                    stats.active_entries += 1;
                }
                stats.total_violations += u64::from(entry.violation_count);
                stats
            })
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(task) = self
            .cleanup_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use chrono::Duration;

    fn limiter(max_requests: u32, window_ms: u64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let config = RateLimitConfig {
            enabled: true,
            window_ms,
            max_requests,
            cleanup_interval_secs: 60,
        };
        (RateLimiter::with_clock(config, clock.clone()), clock)
    }

    #[test]
    fn test_rate_limiter() {
        let (limiter, _clock) = limiter(2, 60_000);

        // First request should succeed
        let first = limiter.is_allowed("test_key");
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);

        // Second request should succeed
        let second = limiter.is_allowed("test_key");
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        // Third request should fail
        let third = limiter.is_allowed("test_key");
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
        assert_eq!(third.retry_after_seconds, Some(60));

        // Reset should allow new requests
        limiter.reset("test_key");
        assert!(limiter.is_allowed("test_key").allowed);
    }

    #[test]
    fn test_keys_are_independent() {
        let (limiter, _clock) = limiter(1, 60_000);
        assert!(limiter.is_allowed("a").allowed);
        assert!(!limiter.is_allowed("a").allowed);
        assert!(limiter.is_allowed("b").allowed);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let (limiter, clock) = limiter(1, 10_000);
        limiter.is_allowed("k");
        clock.advance(Duration::milliseconds(8_500));
        let denied = limiter.is_allowed("k");
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_seconds, Some(2));
    }

    #[test]
    fn test_window_expiry_resets_count_but_keeps_violations() {
        let (limiter, clock) = limiter(3, 1_000);
        for _ in 0..3 {
            assert!(limiter.is_allowed("k").allowed);
        }
        assert!(!limiter.is_allowed("k").allowed);
        assert!(!limiter.is_allowed("k").allowed);

        clock.advance(Duration::milliseconds(1_000));
        let decision = limiter.is_allowed("k");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);

        let entry = limiter.entry("k").unwrap();
        assert_eq!(entry.count, 1);
        assert_eq!(entry.violation_count, 2);
    }

    #[test]
    fn test_window_resets_at_exact_boundary() {
        let (limiter, clock) = limiter(1, 1_000);
        limiter.is_allowed("k");
        clock.advance(Duration::milliseconds(999));
        assert!(!limiter.is_allowed("k").allowed);
        clock.advance(Duration::milliseconds(1));
        let decision = limiter.is_allowed("k");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_oversized_window_clamps_reset() {
        let (limiter, _clock) = limiter(1, u64::MAX);
        let first = limiter.is_allowed("k");
        assert!(first.allowed);
        assert_eq!(first.reset_at, DateTime::<Utc>::MAX_UTC);

        let denied = limiter.is_allowed("k");
        assert!(!denied.allowed);
        assert!(denied.retry_after_seconds.unwrap() > 0);
    }

    #[test]
    fn test_cleanup_keeps_entries_with_violations() {
        let (limiter, clock) = limiter(1, 1_000);
        limiter.is_allowed("clean");
        limiter.is_allowed("abuser");
        limiter.is_allowed("abuser");
        limiter.is_allowed("fresh");

        clock.advance(Duration::milliseconds(1_500));
        limiter.is_allowed("fresh");

        assert_eq!(limiter.cleanup(), 1);
        assert!(limiter.entry("clean").is_none());
        assert!(limiter.entry("abuser").is_some());
        assert!(limiter.entry("fresh").is_some());
    }

    #[test]
    fn test_stats() {
        let (limiter, clock) = limiter(1, 1_000);
        limiter.is_allowed("a");
        limiter.is_allowed("a");
        limiter.is_allowed("a");
        clock.advance(Duration::milliseconds(2_000));
        limiter.is_allowed("b");

        let stats = limiter.stats();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.active_entries, 1);
        assert_eq!(stats.total_violations, 2);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (limiter, _clock) = limiter(5, 1_000);
        limiter.is_allowed("a");
        limiter.destroy();
        limiter.destroy();
        assert_eq!(limiter.stats().total_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_removes_expired_entries() {
        let (limiter, clock) = limiter(5, 1_000);
        limiter.start_cleanup();
        limiter.start_cleanup();
        limiter.is_allowed("a");

        clock.advance(Duration::milliseconds(5_000));
        tokio::time::sleep(StdDuration::from_secs(61)).await;

        assert_eq!(limiter.stats().total_entries, 0);

        limiter.destroy();
        limiter.destroy();
    }
}
