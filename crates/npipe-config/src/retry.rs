// SPDX-License-Identifier: Apache-2.0

//! Retry and node-restart configuration (spec §4.5, §6 "retryOptions").

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Policy applied when materializing upstream input for node restart exceeds its cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Fail the pipeline (or the operation) when the cap is exceeded.
    Strict,
    /// Log a warning, truncate, and continue.
    WarnContinue,
}

/// Per-item retry and per-node restart budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Maximum number of per-item retry attempts after the first failure.
    pub max_item_retries: u32,
    /// Base delay for exponential backoff (`base * 2^attempt`).
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Upper bound on any single backoff delay.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Maximum number of times a fatal node failure may trigger a restart.
    pub max_node_restart_attempts: u32,
    /// Maximum number of items to materialize from a streaming upstream input to support
    /// node restart.
    pub max_materialized_items: usize,
    /// Behavior when `max_materialized_items` is exceeded.
    pub materialization_overflow_policy: OverflowPolicy,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_item_retries: 3,
            base_delay: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            max_node_restart_attempts: 1,
            max_materialized_items: 10_000,
            materialization_overflow_policy: OverflowPolicy::Strict,
        }
    }
}
