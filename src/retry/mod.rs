//! Retry policy for store round trips.
//!
//! Retry wraps whole phases: a failed phase is re-executed from its
//! beginning, never resumed mid-way, which the phase contracts make safe.
//! Only transport-level failures classified transient are retried; logical
//! rejections surface immediately.

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Spacing of retry attempts. `delay` returns the pause before attempt
/// `attempt` (1-based, counting retries), or `None` when the budget is spent.
pub trait RetryStrategy: Send + Sync + fmt::Debug {
    fn delay(&self, attempt: u32) -> Option<Duration>;
}

/// The same pause between every attempt.
#[derive(Debug, Clone)]
pub struct FixedInterval {
    /// Number of retries before giving up.
    pub max_retries: u32,

    /// Pause between attempts.
    pub interval: Duration,
}

impl RetryStrategy for FixedInterval {
    fn delay(&self, attempt: u32) -> Option<Duration> {
        (attempt <= self.max_retries).then_some(self.interval)
    }
}

/// Pause growing by a fixed increment on every attempt.
#[derive(Debug, Clone)]
pub struct Incremental {
    /// Number of retries before giving up.
    pub max_retries: u32,

    /// Pause before the first retry.
    pub initial: Duration,

    /// Added to the pause on each further retry.
    pub increment: Duration,
}

impl RetryStrategy for Incremental {
    fn delay(&self, attempt: u32) -> Option<Duration> {
        (attempt <= self.max_retries).then(|| self.initial + self.increment * (attempt - 1))
    }
}

/// Exponentially growing pause with random jitter, capped.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Number of retries before giving up.
    pub max_retries: u32,

    /// Pause scale before the first retry.
    pub min_backoff: Duration,

    /// Upper bound on any pause.
    pub max_backoff: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            max_retries: 5,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_retries {
            return None;
        }
        let exp = 2u64.saturating_pow(attempt - 1);
        let base = self.min_backoff.saturating_mul(exp.min(u32::MAX as u64) as u32);
        let capped = base.min(self.max_backoff);
        // Jitter in [50%, 100%] of the capped pause.
        let jittered = capped.mul_f64(rand::thread_rng().gen_range(0.5..=1.0));
        Some(jittered)
    }
}

/// Classifies store failures as transient (retry) or permanent (surface).
pub trait TransientErrorDetector: Send + Sync + fmt::Debug {
    fn is_transient(&self, error: &StoreError) -> bool;
}

/// Detector deferring to [`StoreError::is_transient`]: connectivity loss and
/// timeouts retry, everything else surfaces.
#[derive(Debug, Clone, Default)]
pub struct StoreTransientErrorDetector;

impl TransientErrorDetector for StoreTransientErrorDetector {
    fn is_transient(&self, error: &StoreError) -> bool {
        error.is_transient()
    }
}

/// Notification passed to the retry callback before each pause.
#[derive(Debug, Clone)]
pub struct RetryingEvent {
    /// 1-based retry attempt about to be made.
    pub attempt: u32,

    /// Pause before the attempt.
    pub delay: Duration,

    /// Rendering of the error that triggered the retry.
    pub last_error: String,
}

/// Retry policy combining a strategy with a transient-error detector.
pub struct RetryPolicy {
    strategy: Box<dyn RetryStrategy>,
    detector: Box<dyn TransientErrorDetector>,
    on_retry: Option<Box<dyn Fn(&RetryingEvent) + Send + Sync>>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("strategy", &self.strategy)
            .field("detector", &self.detector)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// Policy with the given strategy and the store transient detector.
    pub fn new(strategy: Box<dyn RetryStrategy>) -> Self {
        Self {
            strategy,
            detector: Box::new(StoreTransientErrorDetector),
            on_retry: None,
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self::new(Box::new(FixedInterval {
            max_retries: 0,
            interval: Duration::ZERO,
        }))
    }

    /// Replace the transient-error detector.
    pub fn with_detector(mut self, detector: Box<dyn TransientErrorDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Observe retries, for surfacing retry telemetry to the embedding
    /// application.
    pub fn with_on_retry(
        mut self,
        callback: Box<dyn Fn(&RetryingEvent) + Send + Sync>,
    ) -> Self {
        self.on_retry = Some(callback);
        self
    }

    /// Run `operation` until it succeeds, fails permanently, or the retry
    /// budget is spent. The last error is returned on exhaustion.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !self.detector.is_transient(&error) {
                        return Err(error);
                    }
                    attempt += 1;
                    let delay = match self.strategy.delay(attempt) {
                        Some(delay) => delay,
                        None => {
                            warn!(attempt, %error, "retry budget exhausted");
                            return Err(error);
                        }
                    };
                    debug!(attempt, ?delay, %error, "retrying store request");
                    if let Some(callback) = &self.on_retry {
                        callback(&RetryingEvent {
                            attempt,
                            delay,
                            last_error: error.to_string(),
                        });
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Box::new(ExponentialBackoff::default()))
    }
}
