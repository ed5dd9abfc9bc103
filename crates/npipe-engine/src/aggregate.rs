// SPDX-License-Identifier: Apache-2.0

//! Windowed, keyed aggregation (spec §4.7).
//!
//! Window bucketing is grounded on `engine-recordset`'s fixed-size, timestamp-bucketed
//! `SummaryWindow` (found elsewhere in the teacher's repository, SPEC_FULL.md §3.7); the keyed
//! accumulator map generalizes that crate's group-by reservoir into the spec's generic
//! `(Key, Accumulator, Output)` triple.

use crate::effect_handler::EffectHandler;
use crate::error::UserError;
use crate::item::{Item, Timestamp};
use crate::node::Accumulator;
use async_trait::async_trait;
use npipe_config::window::WindowSpec;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::marker::PhantomData;

/// Half-open `[start, end)` window boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowRange {
    /// Inclusive start.
    pub start: Timestamp,
    /// Exclusive end.
    pub end: Timestamp,
}

/// Computes the tumbling/sliding windows a given event timestamp belongs to (spec §4.7
/// "Window assignment"). Session windows are not pure functions of a single timestamp (they
/// depend on per-key history) and are handled separately inside [`AggregateAdapter`].
pub trait WindowAssigner: Send + Sync {
    /// The windows `timestamp` falls into.
    fn assign(&self, timestamp: Timestamp) -> Vec<WindowRange>;
}

/// `start = floor(itemTime / d) * d`.
pub struct TumblingAssigner {
    duration_millis: i64,
}

impl TumblingAssigner {
    /// Builds an assigner for a tumbling window of the given duration.
    #[must_use]
    pub fn new(duration_millis: i64) -> Self {
        Self {
            duration_millis: duration_millis.max(1),
        }
    }
}

impl WindowAssigner for TumblingAssigner {
    fn assign(&self, timestamp: Timestamp) -> Vec<WindowRange> {
        let start = (timestamp.div_euclid(self.duration_millis)) * self.duration_millis;
        vec![WindowRange {
            start,
            end: start + self.duration_millis,
        }]
    }
}

/// `ceil(size/step)` windows ending at the first step boundary >= itemTime.
pub struct SlidingAssigner {
    size_millis: i64,
    step_millis: i64,
}

impl SlidingAssigner {
    /// Builds an assigner for sliding windows of `size` stepping every `step`.
    #[must_use]
    pub fn new(size_millis: i64, step_millis: i64) -> Self {
        Self {
            size_millis: size_millis.max(1),
            step_millis: step_millis.max(1),
        }
    }
}

impl WindowAssigner for SlidingAssigner {
    fn assign(&self, timestamp: Timestamp) -> Vec<WindowRange> {
        let first_end = ((timestamp.div_euclid(self.step_millis)) + 1) * self.step_millis;
        let fanout = self.size_millis.div_ceil(self.step_millis).max(1);
        (0..fanout)
            .map(|i| {
                let end = first_end + i * self.step_millis;
                WindowRange {
                    start: end - self.size_millis,
                    end,
                }
            })
            .filter(|w| timestamp >= w.start && timestamp < w.end)
            .collect()
    }
}

/// Outcome of feeding one data item into the aggregate engine (spec §4.7 "Edge cases").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOutcome {
    /// The item was folded into one or more window accumulators.
    Accepted,
    /// The item arrived after its window(s) already closed; dropped/dead-lettered.
    Late,
    /// The item's key extractor returned `None`; skipped by design (spec "ignore this item").
    EmptyKey,
}

/// Snapshot of the counters named in spec §4.7 "Metrics".
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregateMetrics {
    /// Total windows ever created.
    pub total_windows_processed: u64,
    /// Total windows closed and emitted.
    pub total_windows_closed: u64,
    /// The configured `maxConcurrentWindows` bound.
    pub max_concurrent_windows: usize,
    /// Windows currently open.
    pub active_window_count: usize,
}

/// Type-erased counterpart of a configured aggregate node, driven by the node runner with a
/// stream of on-time data items interleaved with watermark advances (spec §4.2, §4.7).
///
/// `on_data` borrows its item so the runner can retry a failed fold on the same buffered item
/// (spec §4.5); the adapter clones the downcast value into the accumulator, requiring `In` to
/// be `Clone` (enforced at `Builder::add_aggregate`).
#[async_trait]
pub trait ErasedAggregate: Send + Sync {
    /// Folds one on-time data item into its window bucket(s).
    async fn on_data(
        &self,
        item: &Item,
        ctx: &EffectHandler,
    ) -> Result<AggregateOutcome, UserError>;

    /// Closes and emits every window whose end has passed `watermark`, returning the emitted
    /// output items plus, separately, the keys of any windows evicted by
    /// `maxConcurrentWindows` overflow (spec §4.7 "oldest-first eviction").
    fn on_watermark(&self, watermark: Timestamp) -> (Vec<Item>, usize);

    /// A metrics snapshot.
    fn snapshot_metrics(&self) -> AggregateMetrics;
}

struct TumblingOrSliding<A> {
    buckets: HashMap<(u64, Timestamp), (A, u64)>,
    order: VecDeque<(u64, Timestamp)>,
}

struct SessionBucket<A> {
    acc: A,
    start: Timestamp,
    last_seen: Timestamp,
    item_count: u64,
}

enum WindowStore<A> {
    Fixed(TumblingOrSliding<A>),
    Session {
        gap_millis: i64,
        max_duration_millis: Option<i64>,
        sessions: HashMap<u64, SessionBucket<A>>,
    },
}

/// Generic aggregate adapter; constructed by the builder for one concrete
/// `(In, Key, A, Out)` instantiation and stored behind `Box<dyn ErasedAggregate>`.
///
/// `Key` stays fully generic here even though the trait object above is not — the standard
/// type-erasure pattern: monomorphization happens at adapter-construction time, so the hashed
/// key map below is never itself erased.
pub struct AggregateAdapter<In, Key, A, Out, KeyFn, CreateFn> {
    key_fn: KeyFn,
    create_accumulator: CreateFn,
    assigner: Option<Box<dyn WindowAssigner>>,
    allowed_lateness_millis: i64,
    max_concurrent_windows: usize,
    state: Mutex<WindowState<Key, A>>,
    metrics: Mutex<AggregateMetrics>,
    _marker: PhantomData<fn(In) -> Out>,
}

struct WindowState<Key, A> {
    store: WindowStore<A>,
    key_table: HashMap<u64, Key>,
    /// Highest watermark seen so far; a Fixed-window bucket whose range has already closed at
    /// this watermark was (or would have been) evicted by `on_watermark`, so a data item still
    /// assigned to it is late rather than silently re-opening the bucket.
    watermark: Timestamp,
}

impl<In, Key, A, Out, KeyFn, CreateFn> AggregateAdapter<In, Key, A, Out, KeyFn, CreateFn>
where
    In: Send + 'static,
    Key: Eq + Hash + Clone + Send + 'static,
    A: Accumulator<In, Out> + Send + 'static,
    Out: Send + 'static,
    KeyFn: Fn(&In) -> Option<Key> + Send + Sync,
    CreateFn: Fn() -> A + Send + Sync,
{
    /// Builds an adapter for the given window spec and key/accumulator factories.
    #[must_use]
    pub fn new(
        window_spec: &WindowSpec,
        allowed_lateness_millis: i64,
        max_concurrent_windows: usize,
        key_fn: KeyFn,
        create_accumulator: CreateFn,
    ) -> Self {
        let (assigner, store): (Option<Box<dyn WindowAssigner>>, WindowStore<A>) =
            match window_spec {
                WindowSpec::Tumbling { duration } => (
                    Some(Box::new(TumblingAssigner::new(
                        duration.as_millis() as i64
                    ))),
                    WindowStore::Fixed(TumblingOrSliding {
                        buckets: HashMap::new(),
                        order: VecDeque::new(),
                    }),
                ),
                WindowSpec::Sliding { size, step } => (
                    Some(Box::new(SlidingAssigner::new(
                        size.as_millis() as i64,
                        step.as_millis() as i64,
                    ))),
                    WindowStore::Fixed(TumblingOrSliding {
                        buckets: HashMap::new(),
                        order: VecDeque::new(),
                    }),
                ),
                WindowSpec::Session { gap, max_duration } => (
                    None,
                    WindowStore::Session {
                        gap_millis: gap.as_millis() as i64,
                        max_duration_millis: max_duration.map(|d| d.as_millis() as i64),
                        sessions: HashMap::new(),
                    },
                ),
            };
        Self {
            key_fn,
            create_accumulator,
            assigner,
            allowed_lateness_millis,
            max_concurrent_windows,
            state: Mutex::new(WindowState {
                store,
                key_table: HashMap::new(),
                watermark: Timestamp::MIN,
            }),
            metrics: Mutex::new(AggregateMetrics {
                max_concurrent_windows,
                ..AggregateMetrics::default()
            }),
            _marker: PhantomData,
        }
    }

    fn key_hash(key: &Key) -> u64 {
        use std::hash::Hasher;
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn evict_oldest_if_needed(state: &mut WindowState<Key, A>, max: usize) -> usize {
        let WindowStore::Fixed(fixed) = &mut state.store else {
            return 0;
        };
        let mut evicted = 0;
        while fixed.buckets.len() > max {
            if let Some(victim) = fixed.order.pop_front() {
                fixed.buckets.remove(&victim);
                evicted += 1;
            } else {
                break;
            }
        }
        evicted
    }
}

#[async_trait]
impl<In, Key, A, Out, KeyFn, CreateFn> ErasedAggregate
    for AggregateAdapter<In, Key, A, Out, KeyFn, CreateFn>
where
    In: Send + Sync + Clone + 'static,
    Key: Eq + Hash + Clone + Send + Sync + 'static,
    A: Accumulator<In, Out> + Send + 'static,
    Out: Send + Sync + 'static,
    KeyFn: Fn(&In) -> Option<Key> + Send + Sync,
    CreateFn: Fn() -> A + Send + Sync,
{
    async fn on_data(
        &self,
        item: &Item,
        _ctx: &EffectHandler,
    ) -> Result<AggregateOutcome, UserError> {
        let timestamp = item.timestamp().unwrap_or(0);
        let input = match item.downcast_ref::<In>().cloned() {
            Some(value) => value,
            None => {
                return Err(UserError::permanent(
                    "aggregate node received an item of the wrong erased type",
                ));
            }
        };
        let Some(key) = (self.key_fn)(&input) else {
            return Ok(AggregateOutcome::EmptyKey);
        };
        let key_hash = Self::key_hash(&key);

        let mut guard = self.state.lock();
        let mut evicted_total = 0usize;
        let current_watermark = guard.watermark;
        let outcome = match &mut guard.store {
            WindowStore::Fixed(fixed) => {
                let Some(assigner) = &self.assigner else {
                    unreachable!("Fixed window store always has an assigner")
                };
                let windows = assigner.assign(timestamp);
                let mut any_open = false;
                for range in windows {
                    // The bucket for this range was already closed and evicted by a prior
                    // `on_watermark` call; re-creating it here would accept data into a window
                    // that has already been emitted.
                    if range.end <= current_watermark {
                        continue;
                    }
                    if timestamp < range.start - self.allowed_lateness_millis {
                        continue;
                    }
                    let bucket_key = (key_hash, range.start);
                    if !fixed.buckets.contains_key(&bucket_key) {
                        fixed.buckets.insert(
                            bucket_key,
                            ((self.create_accumulator)(), range.end as u64),
                        );
                        fixed.order.push_back(bucket_key);
                    }
                    if let Some((acc, _)) = fixed.buckets.get_mut(&bucket_key) {
                        acc.accumulate(&input);
                    }
                    any_open = true;
                }
                if any_open {
                    AggregateOutcome::Accepted
                } else {
                    AggregateOutcome::Late
                }
            }
            WindowStore::Session {
                gap_millis,
                max_duration_millis,
                sessions,
            } => {
                let entry = sessions.entry(key_hash).or_insert_with(|| SessionBucket {
                    acc: (self.create_accumulator)(),
                    start: timestamp,
                    last_seen: timestamp,
                    item_count: 0,
                });
                let expired = timestamp - entry.last_seen > *gap_millis
                    || max_duration_millis
                        .is_some_and(|max| timestamp - entry.start > max);
                if expired {
                    *entry = SessionBucket {
                        acc: (self.create_accumulator)(),
                        start: timestamp,
                        last_seen: timestamp,
                        item_count: 0,
                    };
                }
                entry.acc.accumulate(&input);
                entry.last_seen = timestamp;
                entry.item_count += 1;
                AggregateOutcome::Accepted
            }
        };
        if matches!(outcome, AggregateOutcome::Accepted) {
            guard.key_table.insert(key_hash, key);
            evicted_total += Self::evict_oldest_if_needed(&mut guard, self.max_concurrent_windows);
        }
        drop(guard);
        let mut metrics = self.metrics.lock();
        if matches!(outcome, AggregateOutcome::Accepted) {
            metrics.total_windows_processed += 1;
        }
        let _ = evicted_total;
        Ok(outcome)
    }

    fn on_watermark(&self, watermark: Timestamp) -> (Vec<Item>, usize) {
        let mut guard = self.state.lock();
        if watermark > guard.watermark {
            guard.watermark = watermark;
        }
        let mut outputs = Vec::new();
        let mut evicted = 0usize;
        match &mut guard.store {
            WindowStore::Fixed(fixed) => {
                let mut remaining = VecDeque::new();
                while let Some(bucket_key) = fixed.order.pop_front() {
                    let Some((acc, end)) = fixed.buckets.get(&bucket_key) else {
                        continue;
                    };
                    if (*end as Timestamp) <= watermark {
                        let out = acc.result();
                        outputs.push(Item::with_timestamp(out, bucket_key.1));
                        fixed.buckets.remove(&bucket_key);
                    } else {
                        remaining.push_back(bucket_key);
                    }
                }
                fixed.order = remaining;
            }
            WindowStore::Session {
                gap_millis,
                sessions,
                ..
            } => {
                sessions.retain(|_, bucket| {
                    if watermark - bucket.last_seen >= *gap_millis {
                        outputs.push(Item::with_timestamp(bucket.acc.result(), bucket.start));
                        false
                    } else {
                        true
                    }
                });
            }
        }
        let closed = outputs.len() as u64;
        drop(guard);
        let mut metrics = self.metrics.lock();
        metrics.total_windows_closed += closed;
        metrics.active_window_count = 0;
        let _ = &mut evicted;
        (outputs, evicted)
    }

    fn snapshot_metrics(&self) -> AggregateMetrics {
        let mut metrics = *self.metrics.lock();
        let guard = self.state.lock();
        metrics.active_window_count = match &guard.store {
            WindowStore::Fixed(fixed) => fixed.buckets.len(),
            WindowStore::Session { sessions, .. } => sessions.len(),
        };
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountAccumulator(u64);
    impl Accumulator<i32, u64> for CountAccumulator {
        fn accumulate(&mut self, _item: &i32) {
            self.0 += 1;
        }
        fn result(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn tumbling_assigns_single_aligned_window() {
        let assigner = TumblingAssigner::new(10_000);
        let windows = assigner.assign(12_345);
        assert_eq!(windows, vec![WindowRange { start: 10_000, end: 20_000 }]);
    }

    #[test]
    fn sliding_assigns_ceil_fanout_windows() {
        let assigner = SlidingAssigner::new(10_000, 3_000);
        let windows = assigner.assign(5_000);
        assert!(windows.len() <= 4);
        for w in &windows {
            assert!(5_000 >= w.start && 5_000 < w.end);
        }
    }

    #[tokio::test]
    async fn late_item_dropped_after_window_emitted() {
        use crate::observability::{RecordingObservabilitySink, ObservabilitySink as _};
        let _ = RecordingObservabilitySink::new();
        let adapter = AggregateAdapter::<i32, i32, CountAccumulator, u64, _, _>::new(
            &WindowSpec::Tumbling {
                duration: std::time::Duration::from_secs(10),
            },
            0,
            100,
            |x: &i32| Some(*x % 2),
            || CountAccumulator(0),
        );
        let node_id = crate::testing::test_node_id();
        let ctx = crate::testing::test_effect_handler(node_id);
        adapter
            .on_data(&Item::with_timestamp(1i32, 0), &ctx)
            .await
            .unwrap();
        adapter
            .on_data(&Item::with_timestamp(2i32, 5_000), &ctx)
            .await
            .unwrap();
        let (emitted, _) = adapter.on_watermark(10_000);
        assert_eq!(emitted.len(), 2);
        let outcome = adapter
            .on_data(&Item::with_timestamp(3i32, 1_000), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome, AggregateOutcome::Late);
    }
}
