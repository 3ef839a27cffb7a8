//! Configuration for the shard map manager.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::{ExponentialBackoff, FixedInterval, Incremental, RetryPolicy};

/// Spacing scheme store round trips retry with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetryBehavior {
    /// The same pause between every attempt.
    FixedInterval,

    /// Pause growing by a fixed increment on every attempt.
    Incremental,

    /// Jittered exponential backoff, capped.
    #[default]
    ExponentialBackoff,
}

/// Mapping cache tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Time-to-live a freshly cached row starts with.
    pub base_ttl: Duration,

    /// Cap on the time-to-live back-off.
    pub max_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            base_ttl: Duration::from_secs(30),
            max_ttl: Duration::from_secs(600),
        }
    }
}

impl CacheConfig {
    pub fn with_base_ttl(mut self, base_ttl: Duration) -> Self {
        self.base_ttl = base_ttl;
        self
    }

    pub fn with_max_ttl(mut self, max_ttl: Duration) -> Self {
        self.max_ttl = max_ttl;
        self
    }
}

/// Retry tuning for store round trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Spacing scheme between attempts.
    pub behavior: RetryBehavior,

    /// Retries per phase before the failure surfaces.
    pub max_retries: u32,

    /// Backoff scale before the first retry.
    pub min_backoff: Duration,

    /// Upper bound on any backoff pause.
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            behavior: RetryBehavior::default(),
            max_retries: 5,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    pub fn with_behavior(mut self, behavior: RetryBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_min_backoff(mut self, min_backoff: Duration) -> Self {
        self.min_backoff = min_backoff;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Build the retry policy this configuration describes, over the store
    /// transient-error detector.
    pub fn build_policy(&self) -> RetryPolicy {
        match self.behavior {
            RetryBehavior::FixedInterval => RetryPolicy::new(Box::new(FixedInterval {
                max_retries: self.max_retries,
                interval: self.min_backoff,
            })),
            RetryBehavior::Incremental => RetryPolicy::new(Box::new(Incremental {
                max_retries: self.max_retries,
                initial: self.min_backoff,
                increment: self.min_backoff,
            })),
            RetryBehavior::ExponentialBackoff => RetryPolicy::new(Box::new(ExponentialBackoff {
                max_retries: self.max_retries,
                min_backoff: self.min_backoff,
                max_backoff: self.max_backoff,
            })),
        }
    }
}

/// Top-level configuration of a [`ShardMapManager`](crate::ShardMapManager).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardMapManagerConfig {
    /// Mapping cache tuning.
    pub cache: CacheConfig,

    /// Retry tuning for store round trips.
    pub retry: RetryConfig,
}

impl ShardMapManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}
