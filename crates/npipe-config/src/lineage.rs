// SPDX-License-Identifier: Apache-2.0

//! Lineage-tracking and graph-validation configuration (spec §4.3, §4.9, §6).

use crate::retry::OverflowPolicy;
use serde::{Deserialize, Serialize};

/// Lineage collection settings (spec §6 "lineageOptions").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LineageOptions {
    /// Whether per-item lineage envelopes are created at all.
    pub item_level_enabled: bool,
    /// Deterministic sampling rate: an envelope is collected iff `hash(lineageId) % sampleEvery == 0`.
    pub sample_every: u32,
    /// Maximum number of hops recorded per item before truncation.
    pub max_hops_per_item: usize,
    /// Maximum number of items a lineage mapper may materialize for fan-out/fan-in seeding.
    pub materialization_cap: usize,
    /// Behavior when `materialization_cap` is exceeded.
    pub overflow_policy: OverflowPolicy,
}

impl Default for LineageOptions {
    fn default() -> Self {
        Self {
            item_level_enabled: true,
            sample_every: 1,
            max_hops_per_item: 64,
            materialization_cap: 10_000,
            overflow_policy: OverflowPolicy::WarnContinue,
        }
    }
}

/// Strictness of build-time graph validation (spec §4.9, §6 "validationMode").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Any check failure aborts `build()`.
    #[default]
    Strict,
    /// Selected checks log and continue instead of failing `build()`.
    Warn,
}
