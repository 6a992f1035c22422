//! Per-key admission control
//!
//! Every transport daemon runs inbound traffic through a [`RateLimiter`]
//! keyed by client address (or Telegram user ID). Each key owns a token
//! bucket of capacity `C` that refills to `C` at each wall-clock second, so
//! over any one-second window at most `C` requests are admitted per key.
//!
//! # Architecture
//!
//! ```text
//! register(key)
//!     |
//!     v
//! DashMap<String, Arc<Bucket>>     (outer map, insert/evict only)
//!     |
//!     +-- Mutex<BucketState>       (per-key token state, try_lock)
//! ```
//!
//! The limiter never blocks its caller: the bucket mutex is acquired with
//! `try_lock`, and a contended bucket yields a rejection instead of waiting.
//! A rejected caller must be refused at the transport layer (UDP: drop the
//! packet, TCP: close without reply).
//!
//! Idle buckets are removed by a coarse background sweeper so the table does
//! not grow without bound under address-scanning traffic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

/// Buckets with no `register` call for this long are swept
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// How often the background sweeper wakes up
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct BucketState {
    tokens: u32,
    window_start: Instant,
}

struct Bucket {
    state: Mutex<BucketState>,
    /// Milliseconds since the limiter was created, for idle detection
    last_seen_ms: AtomicU64,
}

/// Token-bucket admission control keyed by client address
pub struct RateLimiter {
    buckets: DashMap<String, Arc<Bucket>>,
    capacity: u32,
    created: Instant,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter admitting at most `capacity` requests per key per
    /// second. A non-positive capacity is clamped to 1.
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity: capacity.max(1),
            created: Instant::now(),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Decide whether `key` is within quota right now.
    ///
    /// Returns true to admit. Never blocks: a missing key allocates a fresh
    /// full bucket, and a bucket whose lock is contended counts as rejected.
    pub fn register(&self, key: &str) -> bool {
        let bucket = match self.buckets.get(key) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                let bucket = Arc::new(Bucket {
                    state: Mutex::new(BucketState {
                        tokens: self.capacity,
                        window_start: Instant::now(),
                    }),
                    last_seen_ms: AtomicU64::new(0),
                });
                self.buckets
                    .entry(key.to_string())
                    .or_insert(bucket)
                    .value()
                    .clone()
            }
        };

        bucket
            .last_seen_ms
            .store(self.elapsed_ms(), Ordering::Relaxed);

        let admitted = match bucket.state.try_lock() {
            Some(mut state) => {
                let now = Instant::now();
                if now.duration_since(state.window_start) >= Duration::from_secs(1) {
                    state.tokens = self.capacity;
                    state.window_start = now;
                }
                if state.tokens > 0 {
                    state.tokens -= 1;
                    true
                } else {
                    false
                }
            }
            // Contended bucket: refuse rather than wait
            None => false,
        };

        if admitted {
            self.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    /// Remove buckets idle for longer than `max_idle`; returns how many.
    pub fn cleanup_idle(&self, max_idle: Duration) -> usize {
        let now_ms = self.elapsed_ms();
        let max_idle_ms = u64::try_from(max_idle.as_millis()).unwrap_or(u64::MAX);
        let stale: Vec<String> = self
            .buckets
            .iter()
            .filter(|entry| {
                now_ms.saturating_sub(entry.value().last_seen_ms.load(Ordering::Relaxed))
                    > max_idle_ms
            })
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = 0;
        for key in stale {
            if self.buckets.remove(&key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Spawn the coarse background sweeper for this limiter.
    pub fn start_sweeper(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = limiter.cleanup_idle(IDLE_TIMEOUT);
                if removed > 0 {
                    debug!(removed, "swept idle rate-limit buckets");
                }
            }
        });
    }

    /// Number of tracked keys
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }

    /// Admitted request count
    #[must_use]
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Rejected request count
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Admission Tests
    // ========================================================================

    #[test]
    fn test_first_contact_admitted() {
        let limiter = RateLimiter::new(5);
        assert!(limiter.register("10.0.0.1"));
        assert_eq!(limiter.key_count(), 1);
    }

    #[test]
    fn test_exactly_capacity_admitted_per_window() {
        // 10 requests in well under a second: exactly 5 pass
        let limiter = RateLimiter::new(5);
        let mut admitted = 0;
        for _ in 0..10 {
            if limiter.register("10.0.0.1") {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
        assert_eq!(limiter.admitted(), 5);
        assert_eq!(limiter.rejected(), 5);
    }

    #[test]
    fn test_window_refills() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.register("k"));
        assert!(limiter.register("k"));
        assert!(!limiter.register("k"));
        std::thread::sleep(Duration::from_millis(1050));
        assert!(limiter.register("k"));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.register("10.0.0.1"));
        assert!(!limiter.register("10.0.0.1"));
        assert!(limiter.register("10.0.0.2"));
    }

    #[test]
    fn test_capacity_clamped_to_one() {
        let limiter = RateLimiter::new(0);
        assert!(limiter.register("k"));
        assert!(!limiter.register("k"));
    }

    // ========================================================================
    // Eviction Tests
    // ========================================================================

    #[test]
    fn test_cleanup_spares_fresh_entries() {
        let limiter = RateLimiter::new(5);
        limiter.register("fresh");
        assert_eq!(limiter.cleanup_idle(Duration::from_secs(60)), 0);
        assert_eq!(limiter.key_count(), 1);
    }

    #[test]
    fn test_cleanup_removes_idle_entries() {
        let limiter = RateLimiter::new(5);
        limiter.register("idle");
        std::thread::sleep(Duration::from_millis(30));
        limiter.register("fresh");
        let removed = limiter.cleanup_idle(Duration::from_millis(10));
        assert_eq!(removed, 1);
        assert_eq!(limiter.key_count(), 1);
    }

    #[test]
    fn test_evicted_key_starts_with_full_bucket() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.register("k"));
        assert!(!limiter.register("k"));
        std::thread::sleep(Duration::from_millis(20));
        limiter.cleanup_idle(Duration::from_millis(5));
        assert!(limiter.register("k"));
    }

    // ========================================================================
    // Concurrency Tests
    // ========================================================================

    #[test]
    fn test_concurrent_single_key_never_exceeds_capacity() {
        let limiter = Arc::new(RateLimiter::new(8));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    let mut admitted = 0u32;
                    for _ in 0..100 {
                        if limiter.register("shared") {
                            admitted += 1;
                        }
                    }
                    admitted
                })
            })
            .collect();
        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // All 400 calls land within a couple of windows at most; the bound
        // to verify is that no single second admitted more than capacity.
        assert!(total <= 8 * 3, "admitted {total} across at most 3 windows");
        assert!(total >= 8);
    }

    #[test]
    fn test_concurrent_distinct_keys() {
        let limiter = Arc::new(RateLimiter::new(5));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        limiter.register(&format!("10.0.0.{i}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(limiter.key_count(), 8);
    }
}
