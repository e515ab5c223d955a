//! Polling strategies for subscriptions.
//!
//! A strategy decides how long a subscription waits before its next read,
//! given how many messages the last read returned (`retrieved`) versus the
//! batch size it asked for (`expected`). A saturated read means the
//! subscription is behind and should poll again immediately; anything less
//! means it is at the tail and can afford to wait.
//!
//! Strategies are stateful (backoff counters, adaptive delays), so each
//! subscription gets a fresh instance minted from a [`PollingFactory`].

use std::sync::Arc;
use std::time::Duration;

/// Default polling interval for subscriptions.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(100);

/// Decides the delay before a subscription's next read.
pub trait PollingStrategy: Send {
    /// Returns the next delay given the last read's yield.
    fn next_delay(&mut self, retrieved: i64, expected: i64) -> Duration;
}

/// Mints a fresh strategy instance per subscription.
pub type PollingFactory = Arc<dyn Fn() -> Box<dyn PollingStrategy> + Send + Sync>;

pub(crate) fn mint(factory: &PollingFactory) -> Box<dyn PollingStrategy> {
    factory.as_ref()()
}

/// Polls at a fixed interval, or immediately while saturated.
pub struct ConstantPolling {
    interval: Duration,
}

impl ConstantPolling {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Factory minting a constant strategy per subscription.
    pub fn factory(interval: Duration) -> PollingFactory {
        Arc::new(move || Box::new(ConstantPolling::new(interval)))
    }
}

impl PollingStrategy for ConstantPolling {
    fn next_delay(&mut self, retrieved: i64, expected: i64) -> Duration {
        if retrieved == expected {
            Duration::ZERO
        } else {
            self.interval
        }
    }
}

/// Backs off exponentially while reads come back empty.
///
/// Any read returning at least one message resets the backoff; a saturated
/// read polls again immediately.
pub struct ExpBackoffPolling {
    min: Duration,
    max: Duration,
    multiplier: f64,
    empty_reads: u32,
}

impl ExpBackoffPolling {
    pub fn new(min: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            min,
            max,
            multiplier,
            empty_reads: 0,
        }
    }

    /// Factory minting a backoff strategy per subscription.
    pub fn factory(min: Duration, max: Duration, multiplier: f64) -> PollingFactory {
        Arc::new(move || Box::new(ExpBackoffPolling::new(min, max, multiplier)))
    }
}

impl PollingStrategy for ExpBackoffPolling {
    fn next_delay(&mut self, retrieved: i64, expected: i64) -> Duration {
        if retrieved == expected {
            self.empty_reads = 0;
            return Duration::ZERO;
        }
        if retrieved > 0 {
            self.empty_reads = 0;
            return self.min;
        }

        let delay = self
            .min
            .mul_f64(self.multiplier.powi(self.empty_reads as i32))
            .min(self.max);
        self.empty_reads = self.empty_reads.saturating_add(1);
        delay
    }
}

/// Adjusts the delay to hold read utilisation near a target.
///
/// Utilisation is `retrieved / expected`. Reads below the target lengthen
/// the delay by `step`; reads above it shorten the delay, clamped to
/// `[min, max]`. A saturated read polls again immediately.
pub struct DynamicPolling {
    target: f64,
    step: Duration,
    min: Duration,
    max: Duration,
    delay: Duration,
}

impl DynamicPolling {
    /// `target` is the desired utilisation in `(0, 1]`.
    pub fn new(target: f64, step: Duration, min: Duration, max: Duration) -> Self {
        Self {
            target,
            step,
            min,
            max,
            delay: min,
        }
    }

    /// Factory minting a dynamic strategy per subscription.
    pub fn factory(target: f64, step: Duration, min: Duration, max: Duration) -> PollingFactory {
        Arc::new(move || Box::new(DynamicPolling::new(target, step, min, max)))
    }
}

impl PollingStrategy for DynamicPolling {
    fn next_delay(&mut self, retrieved: i64, expected: i64) -> Duration {
        if retrieved == expected {
            return Duration::ZERO;
        }

        let actual = retrieved as f64 / expected as f64;
        if actual < self.target {
            self.delay = self.delay.saturating_add(self.step).min(self.max);
        } else if actual > self.target {
            self.delay = self.delay.saturating_sub(self.step).max(self.min);
        }

        self.delay
    }
}
