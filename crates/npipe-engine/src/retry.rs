// SPDX-License-Identifier: Apache-2.0

//! Per-item retry with backoff+jitter, and the per-node restart budget (spec §4.5).
//!
//! Grounded directly on `otap-df-engine::retry_processor`'s exponential-backoff shape
//! (multiplier, max delay, pending-attempt tracking), generalized from that crate's fixed
//! ACK/NACK retry loop into the spec's two independent budgets.

use crate::error::IsTransient;
use npipe_config::retry::{OverflowPolicy, RetryOptions};
use rand::Rng;
use std::time::Duration;

/// The outcome of running `retry_with_backoff` to completion.
pub enum RetryOutcome<T, E> {
    /// The operation succeeded, possibly after some retries.
    Succeeded {
        /// The successful result.
        value: T,
        /// Number of retries performed before success (0 = succeeded on first attempt).
        attempts_used: u32,
    },
    /// The operation's error was not transient; it was never retried.
    NonTransient(E),
    /// Retries were exhausted without success.
    Exhausted {
        /// The last error observed.
        last_error: E,
        /// Total attempts made, including the first.
        attempts: u32,
    },
}

/// Computes the k-th backoff delay: `base * 2^k`, jittered ±25%, capped at `max_backoff`
/// (spec §4.5, testable property 7).
#[must_use]
pub fn backoff_delay(options: &RetryOptions, attempt: u32) -> Duration {
    let base_nanos = options.base_delay.as_nanos() as f64;
    let exp = base_nanos * 2f64.powi(attempt as i32);
    let jitter = rand::rng().random_range(0.75..=1.25);
    let jittered = (exp * jitter).max(0.0);
    let capped = jittered.min(options.max_backoff.as_nanos() as f64);
    Duration::from_nanos(capped as u64)
}

/// Runs `operation` under the per-item retry budget in `options`.
///
/// `operation` is called once, then up to `options.max_item_retries` additional times as long
/// as the returned error is [`IsTransient::is_transient`]. Between attempts the task sleeps
/// for [`backoff_delay`], honoring `cancellation` as a suspension point (spec §5 "Suspension
/// points").
pub async fn retry_with_backoff<T, E, F, Fut>(
    options: &RetryOptions,
    cancellation: &tokio_util::sync::CancellationToken,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    E: IsTransient,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => {
                return RetryOutcome::Succeeded {
                    value,
                    attempts_used: attempt,
                };
            }
            Err(err) => {
                if !err.is_transient() {
                    return RetryOutcome::NonTransient(err);
                }
                if attempt >= options.max_item_retries {
                    return RetryOutcome::Exhausted {
                        last_error: err,
                        attempts: attempt + 1,
                    };
                }
                let delay = backoff_delay(options, attempt);
                tokio::select! {
                    biased;
                    () = cancellation.cancelled() => {
                        return RetryOutcome::Exhausted {
                            last_error: err,
                            attempts: attempt + 1,
                        };
                    }
                    () = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

/// Tracks how many times a node has been restarted, enforcing `maxNodeRestartAttempts`
/// (spec §4.5 "per-node restart").
pub struct RestartBudget {
    max_attempts: u32,
    used: u32,
}

impl RestartBudget {
    /// Builds a fresh budget from the node's effective retry options.
    #[must_use]
    pub fn new(options: &RetryOptions) -> Self {
        Self {
            max_attempts: options.max_node_restart_attempts,
            used: 0,
        }
    }

    /// Consumes one restart attempt, returning `true` if it was within budget.
    pub fn try_consume(&mut self) -> bool {
        if self.used >= self.max_attempts {
            false
        } else {
            self.used += 1;
            true
        }
    }

    /// Attempts used so far.
    #[must_use]
    pub fn used(&self) -> u32 {
        self.used
    }
}

/// Bounds how many upstream items may be materialized to support a node restart (spec §4.5
/// "materializes up to maxMaterializedItems").
pub struct MaterializationBudget {
    cap: usize,
    policy: OverflowPolicy,
    buffered: Vec<crate::item::Item>,
}

impl MaterializationBudget {
    /// Builds a budget from the node's retry options.
    #[must_use]
    pub fn new(options: &RetryOptions) -> Self {
        Self {
            cap: options.max_materialized_items,
            policy: options.materialization_overflow_policy,
            buffered: Vec::new(),
        }
    }

    /// Attempts to buffer one more item.
    ///
    /// Under [`OverflowPolicy::Strict`], returns `Err(())` once the cap is hit so the caller
    /// can raise [`crate::error::Error::MaterializationCapFault`]. Under
    /// [`OverflowPolicy::WarnContinue`], silently drops items past the cap (the caller is
    /// expected to log a warning once).
    pub fn push(&mut self, item: crate::item::Item) -> Result<(), ()> {
        if self.buffered.len() >= self.cap {
            return match self.policy {
                OverflowPolicy::Strict => Err(()),
                OverflowPolicy::WarnContinue => Ok(()),
            };
        }
        self.buffered.push(item);
        Ok(())
    }

    /// Drains the materialized items for replay into a [`npipe_channel::DataPipe::materialized`].
    pub fn into_items(self) -> Vec<crate::item::Item> {
        self.buffered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UserError;

    #[test]
    fn backoff_stays_within_quarter_jitter_and_cap() {
        let options = RetryOptions {
            base_delay: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            ..RetryOptions::default()
        };
        for attempt in 0..6 {
            let delay = backoff_delay(&options, attempt);
            let base = options.base_delay.as_secs_f64() * 2f64.powi(attempt as i32);
            let lower = (base * 0.75).min(options.max_backoff.as_secs_f64());
            let upper = (base * 1.25).min(options.max_backoff.as_secs_f64());
            let observed = delay.as_secs_f64();
            assert!(observed >= lower - 1e-6 && observed <= upper + 1e-6);
        }
    }

    #[tokio::test]
    async fn exhausts_after_configured_retries() {
        let options = RetryOptions {
            max_item_retries: 3,
            base_delay: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            ..RetryOptions::default()
        };
        let cancellation = tokio_util::sync::CancellationToken::new();
        let mut attempts = 0u32;
        let outcome = retry_with_backoff(&options, &cancellation, || {
            attempts += 1;
            async { Err::<(), UserError>(UserError::transient("boom")) }
        })
        .await;
        match outcome {
            RetryOutcome::Exhausted { attempts: n, .. } => assert_eq!(n, 4),
            _ => panic!("expected exhaustion"),
        }
        assert_eq!(attempts, 4);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let options = RetryOptions::default();
        let cancellation = tokio_util::sync::CancellationToken::new();
        let mut attempts = 0u32;
        let outcome = retry_with_backoff(&options, &cancellation, || {
            attempts += 1;
            async { Err::<(), UserError>(UserError::permanent("nope")) }
        })
        .await;
        assert!(matches!(outcome, RetryOutcome::NonTransient(_)));
        assert_eq!(attempts, 1);
    }
}
