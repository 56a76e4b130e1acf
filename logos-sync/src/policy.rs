//! Latency → batching parameters.
//!
//! Fixed tiers, no smoothing or hysteresis:
//!
//! | latency (s)        | batch size | flush interval |
//! |--------------------|------------|----------------|
//! | `>= 0.5`           | 20         | 200 ms         |
//! | `(0.2, 0.5)`       | 15         | 150 ms         |
//! | `<= 0.2` (default) | 10         | 100 ms         |

use std::time::Duration;

/// Batching parameters derived from the latency estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchingParams {
    /// Advisory batch size for the current latency tier.
    pub batch_size_threshold: usize,
    /// Period of the flush timer.
    pub flush_interval: Duration,
}

impl BatchingParams {
    pub const fn new(batch_size_threshold: usize, flush_interval_ms: u64) -> Self {
        Self {
            batch_size_threshold,
            flush_interval: Duration::from_millis(flush_interval_ms),
        }
    }

    pub fn flush_interval_ms(&self) -> u64 {
        self.flush_interval.as_millis() as u64
    }
}

impl Default for BatchingParams {
    fn default() -> Self {
        Self::new(10, 100)
    }
}

/// Maps a latency estimate to [`BatchingParams`] by fixed thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptivePolicy {
    /// Latencies at or above this use `high`.
    pub high_latency_secs: f64,
    /// Latencies above this (and below `high_latency_secs`) use `medium`.
    pub medium_latency_secs: f64,
    pub high: BatchingParams,
    pub medium: BatchingParams,
    pub low: BatchingParams,
}

impl Default for AdaptivePolicy {
    fn default() -> Self {
        Self {
            high_latency_secs: 0.5,
            medium_latency_secs: 0.2,
            high: BatchingParams::new(20, 200),
            medium: BatchingParams::new(15, 150),
            low: BatchingParams::new(10, 100),
        }
    }
}

impl AdaptivePolicy {
    /// Recompute batching parameters for a latency in seconds.
    ///
    /// NaN and negative readings fall into the low tier.
    pub fn tune(&self, latency_secs: f64) -> BatchingParams {
        if latency_secs.is_nan() || latency_secs <= self.medium_latency_secs {
            self.low
        } else if latency_secs >= self.high_latency_secs {
            self.high
        } else {
            self.medium
        }
    }

    /// Parameters before any probe has completed.
    pub fn baseline(&self) -> BatchingParams {
        self.low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiers() {
        let policy = AdaptivePolicy::default();

        let high = policy.tune(0.6);
        assert_eq!(high.batch_size_threshold, 20);
        assert_eq!(high.flush_interval_ms(), 200);

        let medium = policy.tune(0.3);
        assert_eq!(medium.batch_size_threshold, 15);
        assert_eq!(medium.flush_interval_ms(), 150);

        let low = policy.tune(0.1);
        assert_eq!(low.batch_size_threshold, 10);
        assert_eq!(low.flush_interval_ms(), 100);
    }

    #[test]
    fn test_tier_boundaries() {
        let policy = AdaptivePolicy::default();
        assert_eq!(policy.tune(0.2), BatchingParams::new(10, 100));
        assert_eq!(policy.tune(0.2000001), BatchingParams::new(15, 150));
        assert_eq!(policy.tune(0.4999), BatchingParams::new(15, 150));
        assert_eq!(policy.tune(0.5), BatchingParams::new(20, 200));
    }

    #[test]
    fn test_degenerate_readings() {
        let policy = AdaptivePolicy::default();
        assert_eq!(policy.tune(0.0), policy.low);
        assert_eq!(policy.tune(-1.0), policy.low);
        assert_eq!(policy.tune(f64::NAN), policy.low);
        assert_eq!(policy.tune(f64::INFINITY), policy.high);
        assert_eq!(policy.tune(30.0), policy.high);
    }

    #[test]
    fn test_baseline_is_default_tier() {
        let policy = AdaptivePolicy::default();
        assert_eq!(policy.baseline(), BatchingParams::default());
        assert_eq!(policy.baseline().flush_interval, Duration::from_millis(100));
    }
}
