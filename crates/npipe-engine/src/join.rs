// SPDX-License-Identifier: Apache-2.0

//! Time-windowed stream join (spec §4.8).

use crate::effect_handler::EffectHandler;
use crate::error::UserError;
use crate::item::{Item, Timestamp};
use crate::node::JoinLogic;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;

/// Which sides of an unmatched pair a join emits on window close (spec §4.8 "Supported
/// modes").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// Emit only when both sides are present.
    Inner,
    /// Emit the left side with a null right partner if no match closes the window.
    LeftOuter,
    /// Emit the right side with a null left partner if no match closes the window.
    RightOuter,
    /// Both outer behaviors combined.
    FullOuter,
}

/// Which side of a join an arriving item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The join's left input.
    Left,
    /// The join's right input.
    Right,
}

/// Type-erased counterpart of a configured join node.
///
/// `on_item` borrows its item so the runner can retry a failed combine on the same buffered
/// item (spec §4.5); the adapter clones the downcast value into its side buffer, requiring `L`
/// and `R` to be `Clone` (enforced at `Builder::add_join`).
#[async_trait]
pub trait ErasedJoin: Send + Sync {
    /// Feeds one item from the named side, returning every item emitted as an immediate
    /// consequence (cross-product matches against the opposite side's current buffer).
    async fn on_item(
        &self,
        side: Side,
        item: &Item,
        ctx: &EffectHandler,
    ) -> Result<Vec<Item>, UserError>;

    /// Advances the watermark, purging expired buffer entries and emitting outer-join
    /// unmatched rows whose window has closed (spec §4.8 "Eviction").
    async fn on_watermark(&self, watermark: Timestamp, ctx: &EffectHandler) -> Vec<Item>;
}

struct BufferedEntry<T> {
    value: T,
    timestamp: Timestamp,
    matched: bool,
}

struct JoinState<Key, L, R> {
    left: HashMap<Key, Vec<BufferedEntry<L>>>,
    right: HashMap<Key, Vec<BufferedEntry<R>>>,
}

/// Generic join adapter; constructed by the builder for one concrete `(L, R, Key, Out)`
/// instantiation.
pub struct JoinAdapter<L, R, Key, Out, KeyL, KeyR, Logic> {
    key_left: KeyL,
    key_right: KeyR,
    logic: Logic,
    mode: JoinMode,
    window_millis: i64,
    state: Mutex<JoinState<Key, L, R>>,
    _marker: PhantomData<fn() -> Out>,
}

impl<L, R, Key, Out, KeyL, KeyR, Logic> JoinAdapter<L, R, Key, Out, KeyL, KeyR, Logic>
where
    L: Send + 'static,
    R: Send + 'static,
    Key: Eq + Hash + Clone + Send + 'static,
    KeyL: Fn(&L) -> Key + Send + Sync,
    KeyR: Fn(&R) -> Key + Send + Sync,
    Logic: JoinLogic<L, R, Out> + Send + Sync,
{
    /// Builds an adapter for the given join window and mode.
    #[must_use]
    pub fn new(
        key_left: KeyL,
        key_right: KeyR,
        logic: Logic,
        mode: JoinMode,
        window_millis: i64,
    ) -> Self {
        Self {
            key_left,
            key_right,
            logic,
            mode,
            window_millis,
            state: Mutex::new(JoinState {
                left: HashMap::new(),
                right: HashMap::new(),
            }),
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<L, R, Key, Out, KeyL, KeyR, Logic> ErasedJoin for JoinAdapter<L, R, Key, Out, KeyL, KeyR, Logic>
where
    L: Send + Sync + Clone + 'static,
    R: Send + Sync + Clone + 'static,
    Key: Eq + Hash + Clone + Send + Sync + 'static,
    Out: Send + 'static,
    KeyL: Fn(&L) -> Key + Send + Sync,
    KeyR: Fn(&R) -> Key + Send + Sync,
    Logic: JoinLogic<L, R, Out> + Send + Sync,
{
    async fn on_item(
        &self,
        side: Side,
        item: &Item,
        ctx: &EffectHandler,
    ) -> Result<Vec<Item>, UserError> {
        let timestamp = item.timestamp().unwrap_or(0);
        let mut outputs = Vec::new();
        match side {
            Side::Left => {
                let value: L = item
                    .downcast_ref::<L>()
                    .cloned()
                    .ok_or_else(|| UserError::permanent("join received wrong left item type"))?;
                let key = (self.key_left)(&value);
                let mut guard = self.state.lock();
                let matches: Vec<Timestamp> = guard
                    .right
                    .get(&key)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter(|e| (e.timestamp - timestamp).abs() <= self.window_millis)
                            .map(|e| e.timestamp)
                            .collect()
                    })
                    .unwrap_or_default();
                for right_ts in &matches {
                    if let Some(entries) = guard.right.get_mut(&key) {
                        if let Some(entry) = entries.iter_mut().find(|e| e.timestamp == *right_ts)
                        {
                            entry.matched = true;
                            if let Some(out) = self
                                .logic
                                .combine(Some(&value), Some(&entry.value), ctx)
                                .await?
                            {
                                outputs.push(Item::with_timestamp(out, timestamp));
                            }
                        }
                    }
                }
                guard.left.entry(key).or_default().push(BufferedEntry {
                    value,
                    timestamp,
                    matched: !matches.is_empty(),
                });
            }
            Side::Right => {
                let value: R = item
                    .downcast_ref::<R>()
                    .cloned()
                    .ok_or_else(|| UserError::permanent("join received wrong right item type"))?;
                let key = (self.key_right)(&value);
                let mut guard = self.state.lock();
                let matches: Vec<Timestamp> = guard
                    .left
                    .get(&key)
                    .map(|entries| {
                        entries
                            .iter()
                            .filter(|e| (e.timestamp - timestamp).abs() <= self.window_millis)
                            .map(|e| e.timestamp)
                            .collect()
                    })
                    .unwrap_or_default();
                for left_ts in &matches {
                    if let Some(entries) = guard.left.get_mut(&key) {
                        if let Some(entry) = entries.iter_mut().find(|e| e.timestamp == *left_ts) {
                            entry.matched = true;
                            if let Some(out) = self
                                .logic
                                .combine(Some(&entry.value), Some(&value), ctx)
                                .await?
                            {
                                outputs.push(Item::with_timestamp(out, timestamp));
                            }
                        }
                    }
                }
                guard.right.entry(key).or_default().push(BufferedEntry {
                    value,
                    timestamp,
                    matched: !matches.is_empty(),
                });
            }
        }
        Ok(outputs)
    }

    async fn on_watermark(&self, watermark: Timestamp, ctx: &EffectHandler) -> Vec<Item> {
        let cutoff = watermark - self.window_millis;
        let (left_unmatched, right_unmatched) = {
            let mut guard = self.state.lock();
            let emit_left = matches!(self.mode, JoinMode::LeftOuter | JoinMode::FullOuter);
            let emit_right = matches!(self.mode, JoinMode::RightOuter | JoinMode::FullOuter);

            let mut left_unmatched = Vec::new();
            for entries in guard.left.values_mut() {
                let mut i = 0;
                while i < entries.len() {
                    if entries[i].timestamp < cutoff {
                        let entry = entries.remove(i);
                        if emit_left && !entry.matched {
                            left_unmatched.push((entry.value, entry.timestamp));
                        }
                    } else {
                        i += 1;
                    }
                }
            }
            let mut right_unmatched = Vec::new();
            for entries in guard.right.values_mut() {
                let mut i = 0;
                while i < entries.len() {
                    if entries[i].timestamp < cutoff {
                        let entry = entries.remove(i);
                        if emit_right && !entry.matched {
                            right_unmatched.push((entry.value, entry.timestamp));
                        }
                    } else {
                        i += 1;
                    }
                }
            }
            (left_unmatched, right_unmatched)
        };

        let mut outputs = Vec::new();
        for (value, timestamp) in left_unmatched {
            if let Ok(Some(out)) = self.logic.combine(Some(&value), None, ctx).await {
                outputs.push(Item::with_timestamp(out, timestamp));
            }
        }
        for (value, timestamp) in right_unmatched {
            if let Ok(Some(out)) = self.logic.combine(None, Some(&value), ctx).await {
                outputs.push(Item::with_timestamp(out, timestamp));
            }
        }
        outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ConcatJoin;
    #[async_trait]
    impl JoinLogic<i32, i32, (i32, i32)> for ConcatJoin {
        async fn combine(
            &self,
            left: Option<&i32>,
            right: Option<&i32>,
            _ctx: &EffectHandler,
        ) -> Result<Option<(i32, i32)>, UserError> {
            Ok(match (left, right) {
                (Some(l), Some(r)) => Some((*l, *r)),
                _ => None,
            })
        }
    }

    #[tokio::test]
    async fn inner_join_emits_only_on_match() {
        let adapter = JoinAdapter::new(
            |l: &i32| *l,
            |r: &i32| *r,
            ConcatJoin,
            JoinMode::Inner,
            5_000,
        );
        let node_id = crate::testing::test_node_id();
        let ctx = crate::testing::test_effect_handler(node_id);
        let left_out = adapter
            .on_item(Side::Left, &Item::with_timestamp(1i32, 0), &ctx)
            .await
            .unwrap();
        assert!(left_out.is_empty());
        let right_out = adapter
            .on_item(Side::Right, &Item::with_timestamp(1i32, 1_000), &ctx)
            .await
            .unwrap();
        assert_eq!(right_out.len(), 1);
        let unmatched = adapter
            .on_item(Side::Left, &Item::with_timestamp(2i32, 2_000), &ctx)
            .await
            .unwrap();
        assert!(unmatched.is_empty());
    }
}
