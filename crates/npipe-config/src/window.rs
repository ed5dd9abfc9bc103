// SPDX-License-Identifier: Apache-2.0

//! Window family specifications (spec §3 "Window").

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The three window families an aggregate node can be configured with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowSpec {
    /// Fixed, non-overlapping `duration`-sized periods aligned to the epoch.
    Tumbling {
        /// The window's fixed duration.
        duration: Duration,
    },
    /// Windows of `size` starting every `step`; an item belongs to `ceil(size/step)` windows.
    Sliding {
        /// Total window size.
        size: Duration,
        /// Distance between successive window starts.
        step: Duration,
    },
    /// Per-key windows that close after `gap` of inactivity, or at `max_duration` if set.
    Session {
        /// Inactivity gap after which an open session closes.
        gap: Duration,
        /// Optional hard cap on a session's total duration.
        max_duration: Option<Duration>,
    },
}

impl WindowSpec {
    /// Number of sliding sub-windows a single item falls into; `1` for tumbling/session.
    #[must_use]
    pub fn fanout(&self) -> usize {
        match self {
            WindowSpec::Tumbling { .. } | WindowSpec::Session { .. } => 1,
            WindowSpec::Sliding { size, step } => {
                let size = size.as_nanos().max(1);
                let step = step.as_nanos().max(1);
                size.div_ceil(step) as usize
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sliding_fanout_rounds_up() {
        let spec = WindowSpec::Sliding {
            size: Duration::from_secs(10),
            step: Duration::from_secs(3),
        };
        assert_eq!(spec.fanout(), 4);
    }

    #[test]
    fn tumbling_fanout_is_one() {
        let spec = WindowSpec::Tumbling {
            duration: Duration::from_secs(10),
        };
        assert_eq!(spec.fanout(), 1);
    }
}
