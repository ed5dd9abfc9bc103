// SPDX-License-Identifier: Apache-2.0

//! Watermark generation and late-data filtering (spec §4.2).

use crate::item::{Item, Timestamp};
use std::time::{Duration, Instant};

/// Produces a monotone watermark from a stream of observed event timestamps.
pub trait WatermarkGenerator: Send {
    /// Called on every item's event timestamp; returns a new watermark if one should be
    /// emitted at this point (`Periodic` emits only on its own wall-clock cadence).
    fn on_event(&mut self, timestamp: Timestamp) -> Option<Timestamp>;

    /// Called periodically by the node runner regardless of item arrival, so a `Periodic`
    /// generator can emit even during a quiet stream.
    fn on_tick(&mut self, now: Instant) -> Option<Timestamp>;
}

/// `watermark = maxSeenTimestamp - maxLag`, re-evaluated on every item (spec §4.2).
pub struct BoundedOutOfOrderness {
    max_lag_millis: i64,
    max_seen: Timestamp,
    last_emitted: Option<Timestamp>,
}

impl BoundedOutOfOrderness {
    /// Builds a generator with the given out-of-orderness bound.
    #[must_use]
    pub fn new(max_lag: Duration) -> Self {
        Self {
            max_lag_millis: i64::try_from(max_lag.as_millis()).unwrap_or(i64::MAX),
            max_seen: Timestamp::MIN,
            last_emitted: None,
        }
    }

    fn candidate(&self) -> Timestamp {
        self.max_seen.saturating_sub(self.max_lag_millis)
    }
}

impl WatermarkGenerator for BoundedOutOfOrderness {
    fn on_event(&mut self, timestamp: Timestamp) -> Option<Timestamp> {
        self.max_seen = self.max_seen.max(timestamp);
        let candidate = self.candidate();
        if self.last_emitted.is_none_or(|last| candidate > last) {
            self.last_emitted = Some(candidate);
            Some(candidate)
        } else {
            None
        }
    }

    fn on_tick(&mut self, _now: Instant) -> Option<Timestamp> {
        None
    }
}

/// Emits `maxSeenTimestamp - maxLag` at a fixed wall-clock cadence rather than on every item
/// (spec §4.2 `Periodic(interval, maxLag)`).
pub struct Periodic {
    interval: Duration,
    max_lag_millis: i64,
    max_seen: Timestamp,
    last_tick: Instant,
    last_emitted: Option<Timestamp>,
}

impl Periodic {
    /// Builds a periodic generator.
    #[must_use]
    pub fn new(interval: Duration, max_lag: Duration) -> Self {
        Self {
            interval,
            max_lag_millis: i64::try_from(max_lag.as_millis()).unwrap_or(i64::MAX),
            max_seen: Timestamp::MIN,
            last_tick: Instant::now(),
            last_emitted: None,
        }
    }
}

impl WatermarkGenerator for Periodic {
    fn on_event(&mut self, timestamp: Timestamp) -> Option<Timestamp> {
        self.max_seen = self.max_seen.max(timestamp);
        None
    }

    fn on_tick(&mut self, now: Instant) -> Option<Timestamp> {
        if now.duration_since(self.last_tick) < self.interval {
            return None;
        }
        self.last_tick = now;
        let candidate = self.max_seen.saturating_sub(self.max_lag_millis);
        if self.last_emitted.is_none_or(|last| candidate > last) {
            self.last_emitted = Some(candidate);
            Some(candidate)
        } else {
            None
        }
    }
}

/// A watermark-aware stream element: either a data item or an advancing watermark (spec §4.2
/// "interleaves `DataItem(value)` and `WatermarkItem(w)`").
#[derive(Debug, Clone)]
pub enum Watermarked<T> {
    /// A regular data item.
    Data(T),
    /// An advancing watermark.
    Watermark(Timestamp),
}

/// Drops data items whose timestamp is strictly earlier than the most recently emitted
/// watermark; watermarks themselves always pass through (spec §4.2).
pub struct LateDataFilter {
    current_watermark: Timestamp,
}

impl Default for LateDataFilter {
    fn default() -> Self {
        Self {
            current_watermark: Timestamp::MIN,
        }
    }
}

impl LateDataFilter {
    /// Builds a filter with no watermark observed yet (accepts everything).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently observed watermark.
    #[must_use]
    pub fn current_watermark(&self) -> Timestamp {
        self.current_watermark
    }

    /// Feeds one watermark-aware element, returning `Some` if it should pass through and `None`
    /// if the element is a `DataItem` that arrived after the watermark already passed it.
    ///
    /// A `Watermarked::Watermark` never results in a drop; it also only ever advances
    /// `current_watermark` forward (spec invariant "Watermark monotonicity"). A `DataItem` with
    /// no timestamp can't be judged late and always passes through.
    pub fn accept(&mut self, element: Watermarked<Item>) -> Option<Watermarked<Item>> {
        match element {
            Watermarked::Watermark(w) => {
                self.current_watermark = self.current_watermark.max(w);
                Some(Watermarked::Watermark(self.current_watermark))
            }
            Watermarked::Data(value) => match value.timestamp() {
                Some(ts) if self.is_late(ts) => {
                    tracing::trace!(
                        timestamp = ts,
                        watermark = self.current_watermark,
                        "dropping late item"
                    );
                    None
                }
                _ => Some(Watermarked::Data(value)),
            },
        }
    }

    /// `true` if `timestamp` is strictly before the current watermark (spec §4.2 "late").
    #[must_use]
    pub fn is_late(&self, timestamp: Timestamp) -> bool {
        timestamp < self.current_watermark
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_out_of_orderness_saturates_at_minimum() {
        let mut gen = BoundedOutOfOrderness::new(Duration::from_secs(2));
        assert_eq!(gen.on_event(1_000), Some(Timestamp::MIN));
    }

    #[test]
    fn watermark_advances_monotonically() {
        let mut gen = BoundedOutOfOrderness::new(Duration::from_millis(500));
        let w1 = gen.on_event(1_000).unwrap();
        let w2 = gen.on_event(900).unwrap_or(w1);
        assert!(w2 >= w1);
        let w3 = gen.on_event(5_000).unwrap();
        assert!(w3 >= w2);
    }

    #[test]
    fn late_items_detected_after_watermark_advance() {
        let mut filter = LateDataFilter::new();
        filter.accept(Watermarked::Watermark(10_000));
        assert!(filter.is_late(5_000));
        assert!(!filter.is_late(15_000));
    }

    #[test]
    fn accept_drops_data_item_behind_the_watermark() {
        let mut filter = LateDataFilter::new();
        filter.accept(Watermarked::Watermark(10_000));
        let late = filter.accept(Watermarked::Data(Item::with_timestamp(1i32, 5_000)));
        assert!(late.is_none());
        let on_time = filter.accept(Watermarked::Data(Item::with_timestamp(2i32, 15_000)));
        assert!(on_time.is_some());
    }
}
