// SPDX-License-Identifier: Apache-2.0

//! Circuit-breaker configuration (spec §4.4, §6 "circuitBreakerOptions").

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Thresholds and window sizing for the per-resource circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerOptions {
    /// Consecutive-failure count that alone trips `Closed -> Open`.
    pub failure_threshold: u32,
    /// Failure-rate (0.0..=1.0) that, combined with `min_sample`, also trips the breaker.
    pub rate_threshold: f64,
    /// Minimum number of operations observed before `rate_threshold` is evaluated.
    pub min_sample: u32,
    /// Duration spent `Open` before transitioning to `HalfOpen`.
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,
    /// Duration of the rolling outcome window used to compute `failureRate`/`consecutiveFailures`.
    #[serde(with = "humantime_serde")]
    pub rolling_window: Duration,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            rate_threshold: 0.5,
            min_sample: 10,
            open_timeout: Duration::from_secs(30),
            rolling_window: Duration::from_secs(60),
        }
    }
}

/// Memory-management knobs for the breaker registry (spec §4.4 "Memory-management options").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerMemoryOptions {
    /// Periodically purge expired rolling-window entries and idle breakers.
    pub enable_automatic_cleanup: bool,
    /// Upper bound on the number of tracked breakers; oldest-idle breakers are evicted past it.
    pub max_tracked_breakers: usize,
}

impl Default for CircuitBreakerMemoryOptions {
    fn default() -> Self {
        Self {
            enable_automatic_cleanup: true,
            max_tracked_breakers: 10_000,
        }
    }
}
