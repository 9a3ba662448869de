//! Retry utilities: backoff builders for the stream store and publish path.
//!
//! Reconnects use a bounded linear schedule; publish appends use `backon`
//! with a constant delay and a small, fixed number of attempts.

use std::time::Duration;

use backon::ConstantBuilder;

/// Default step added per reconnect attempt.
pub const RECONNECT_STEP: Duration = Duration::from_millis(50);
/// Default ceiling for the reconnect delay.
pub const RECONNECT_MAX: Duration = Duration::from_millis(5000);

/// Linear reconnect schedule: `min(attempt * step, max)`.
///
/// Never exhausts; the store keeps trying until it reconnects or is closed.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    step: Duration,
    max: Duration,
    attempt: u32,
}

impl LinearBackoff {
    pub fn new(step: Duration, max: Duration) -> Self {
        Self {
            step,
            max,
            attempt: 0,
        }
    }

    /// Delay before the given (1-indexed) attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt).min(self.max)
    }
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self::new(RECONNECT_STEP, RECONNECT_MAX)
    }
}

impl Iterator for LinearBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        Some(self.delay_for_attempt(self.attempt))
    }
}

/// Backoff for re-attempting a stream append after a transient failure.
///
/// - Constant delay
/// - `retries` extra attempts (the publish path defaults to one)
/// - No jitter; a single producer retrying once does not stampede
pub fn append_backoff(delay: Duration, retries: usize) -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(delay)
        .with_max_times(retries)
}
