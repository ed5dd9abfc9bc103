// SPDX-License-Identifier: Apache-2.0

//! Per-resource circuit breaker and rolling outcome window (spec §4.4).

use npipe_config::circuit_breaker::{CircuitBreakerMemoryOptions, CircuitBreakerOptions};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The observed result of one guarded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation completed successfully.
    Success,
    /// The operation failed.
    Failure,
}

/// Breaker state machine position (spec §4.4 `Closed -> Open -> HalfOpen -> Closed|Open`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Operations are allowed through normally.
    Closed,
    /// Operations fail fast without being attempted.
    Open,
    /// A single probe operation is allowed through to test recovery.
    HalfOpen,
}

/// A rolling window of operation outcomes, purged of expired entries on every write (spec
/// §4.4 "purges expired entries on every write and periodically").
struct RollingWindow {
    window: Duration,
    entries: VecDeque<(Instant, Outcome)>,
}

impl RollingWindow {
    fn new(window: Duration) -> Self {
        Self {
            window,
            entries: VecDeque::new(),
        }
    }

    fn purge(&mut self, now: Instant) {
        while let Some(&(ts, _)) = self.entries.front() {
            if now.duration_since(ts) > self.window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn record(&mut self, now: Instant, outcome: Outcome) {
        self.purge(now);
        self.entries.push_back((now, outcome));
    }

    fn total_ops(&self) -> u32 {
        self.entries.len() as u32
    }

    fn failure_count(&self) -> u32 {
        self.entries
            .iter()
            .filter(|(_, o)| *o == Outcome::Failure)
            .count() as u32
    }

    fn failure_rate(&self) -> f64 {
        if self.entries.is_empty() {
            0.0
        } else {
            f64::from(self.failure_count()) / f64::from(self.total_ops())
        }
    }

    fn consecutive_failures(&self) -> u32 {
        self.entries
            .iter()
            .rev()
            .take_while(|(_, o)| *o == Outcome::Failure)
            .count() as u32
    }
}

struct BreakerState {
    circuit: CircuitState,
    window: RollingWindow,
    opened_at: Option<Instant>,
}

/// A single tracked resource's breaker (spec §4.4).
pub struct CircuitBreaker {
    options: CircuitBreakerOptions,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    fn new(options: CircuitBreakerOptions) -> Self {
        let window = RollingWindow::new(options.rolling_window);
        Self {
            options,
            state: Mutex::new(BreakerState {
                circuit: CircuitState::Closed,
                window,
                opened_at: None,
            }),
        }
    }

    /// Current state, after applying the `Open -> HalfOpen` timeout transition if due.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut guard = self.state.lock();
        self.maybe_half_open(&mut guard, Instant::now());
        guard.circuit
    }

    fn maybe_half_open(&self, guard: &mut BreakerState, now: Instant) {
        if guard.circuit == CircuitState::Open {
            if let Some(opened_at) = guard.opened_at {
                if now.duration_since(opened_at) >= self.options.open_timeout {
                    guard.circuit = CircuitState::HalfOpen;
                }
            }
        }
    }

    /// `true` if an operation is permitted to run right now. `HalfOpen` permits exactly the
    /// first caller through as the probe; subsequent callers see `Open` behavior until that
    /// probe's outcome is recorded (spec §4.4 "after openTimeout, HalfOpen permits a probe").
    #[must_use]
    pub fn permits(&self) -> bool {
        let mut guard = self.state.lock();
        let now = Instant::now();
        self.maybe_half_open(&mut guard, now);
        !matches!(guard.circuit, CircuitState::Open)
    }

    /// Records an operation outcome and applies the state-transition rules.
    pub fn record(&self, outcome: Outcome) {
        let mut guard = self.state.lock();
        let now = Instant::now();
        self.maybe_half_open(&mut guard, now);
        guard.window.record(now, outcome);

        match guard.circuit {
            CircuitState::HalfOpen => {
                guard.circuit = match outcome {
                    Outcome::Success => CircuitState::Closed,
                    Outcome::Failure => {
                        guard.opened_at = Some(now);
                        CircuitState::Open
                    }
                };
            }
            CircuitState::Closed => {
                let trip = guard.window.consecutive_failures() >= self.options.failure_threshold
                    || (guard.window.total_ops() >= self.options.min_sample
                        && guard.window.failure_rate() >= self.options.rate_threshold);
                if trip {
                    guard.circuit = CircuitState::Open;
                    guard.opened_at = Some(now);
                }
            }
            CircuitState::Open => {}
        }
    }
}

/// Registry of breakers keyed by resource name, with an optional cap on tracked entries (spec
/// §4.4 "Memory-management options"). Backed by a locked `HashMap` rather than `dashmap`,
/// since `dashmap` is not in the teacher's dependency table (SPEC_FULL.md §3.4).
pub struct CircuitBreakerRegistry {
    breaker_options: CircuitBreakerOptions,
    memory_options: CircuitBreakerMemoryOptions,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new(
        breaker_options: CircuitBreakerOptions,
        memory_options: CircuitBreakerMemoryOptions,
    ) -> Self {
        Self {
            breaker_options,
            memory_options,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the breaker for `resource`, creating it on first use.
    #[must_use]
    pub fn get_or_create(&self, resource: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(resource) {
            return existing.clone();
        }
        let mut guard = self.breakers.write();
        if let Some(existing) = guard.get(resource) {
            return existing.clone();
        }
        if guard.len() >= self.memory_options.max_tracked_breakers {
            if let Some(victim) = guard.keys().next().cloned() {
                guard.remove(&victim);
            }
        }
        let breaker = Arc::new(CircuitBreaker::new(self.breaker_options.clone()));
        guard.insert(resource.to_string(), breaker.clone());
        breaker
    }

    /// Number of tracked resources, for observability.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.breakers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_consecutive_failures() {
        let breaker = CircuitBreaker::new(CircuitBreakerOptions {
            failure_threshold: 3,
            ..CircuitBreakerOptions::default()
        });
        for _ in 0..3 {
            assert!(breaker.permits());
            breaker.record(Outcome::Failure);
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.permits());
    }

    #[test]
    fn half_open_closes_on_success() {
        let breaker = CircuitBreaker::new(CircuitBreakerOptions {
            failure_threshold: 1,
            open_timeout: Duration::from_millis(0),
            ..CircuitBreakerOptions::default()
        });
        breaker.record(Outcome::Failure);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record(Outcome::Success);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn registry_reuses_breaker_per_resource() {
        let registry = CircuitBreakerRegistry::new(
            CircuitBreakerOptions::default(),
            CircuitBreakerMemoryOptions::default(),
        );
        let a = registry.get_or_create("db");
        let b = registry.get_or_create("db");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
