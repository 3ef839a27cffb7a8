//! Cached mapping entry with time-to-live bookkeeping.

use std::time::{Duration, Instant};

use crate::types::StoreMapping;

/// One cached mapping row plus the instant it was stored and its current
/// time-to-live.
///
/// Expiry never evicts: an expired entry is still returned to the caller,
/// flagged stale, so a lookup can fall back to the store and refresh it. The
/// time-to-live grows on each refresh of the same row, doubling up to a
/// configured cap, so rows that keep revalidating unchanged are probed less
/// and less often.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    mapping: StoreMapping,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    /// Create a fresh entry stored now.
    pub fn new(mapping: StoreMapping, ttl: Duration) -> Self {
        Self {
            mapping,
            stored_at: Instant::now(),
            ttl,
        }
    }

    /// The cached mapping row.
    pub fn mapping(&self) -> &StoreMapping {
        &self.mapping
    }

    /// Current time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether the time-to-live has elapsed.
    pub fn is_expired(&self) -> bool {
        self.stored_at.elapsed() >= self.ttl
    }

    /// Re-stamp the entry after a successful revalidation against the store,
    /// replacing the row and growing the time-to-live.
    pub fn refresh(&mut self, mapping: StoreMapping, base_ttl: Duration, max_ttl: Duration) {
        self.mapping = mapping;
        self.stored_at = Instant::now();
        self.ttl = Self::next_ttl(self.ttl, base_ttl, max_ttl);
    }

    /// Monotone capped back-off: zero starts at the base, anything else
    /// doubles up to the cap.
    pub fn next_ttl(current: Duration, base_ttl: Duration, max_ttl: Duration) -> Duration {
        if current.is_zero() {
            base_ttl
        } else {
            (current * 2).min(max_ttl)
        }
    }
}
