// SPDX-License-Identifier: Apache-2.0

//! The type-erased item envelope that flows through the physical pipe layer (spec §3 "Item").
//!
//! The typed builder (`builder.rs`) gives users a fully generic `Transform<In, Out>` surface;
//! underneath, every edge carries the same `Item` so one node runner implementation can drive
//! all five node kinds without the engine being generic over the whole graph's type set.

use crate::lineage::LineageEnvelope;
use std::any::Any;
use std::fmt;

/// Milliseconds since the Unix epoch. The engine never reads wall-clock time itself outside
/// tests; every timestamp on an `Item` is supplied by the producing source or extractor.
pub type Timestamp = i64;

/// A type-erased payload plus the bookkeeping the engine needs regardless of payload type:
/// an optional event timestamp (for watermark generation) and an optional lineage envelope.
pub struct Item {
    payload: Box<dyn Any + Send>,
    timestamp: Option<Timestamp>,
    lineage: Option<LineageEnvelope>,
}

impl Item {
    /// Wraps a typed value with no timestamp and no lineage envelope.
    pub fn new<T: Send + 'static>(value: T) -> Self {
        Self {
            payload: Box::new(value),
            timestamp: None,
            lineage: None,
        }
    }

    /// Wraps a typed value carrying an event timestamp.
    pub fn with_timestamp<T: Send + 'static>(value: T, timestamp: Timestamp) -> Self {
        Self {
            payload: Box::new(value),
            timestamp: Some(timestamp),
            lineage: None,
        }
    }

    /// This item's event timestamp, if any was attached at the source.
    #[must_use]
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }

    /// Attaches or replaces the event timestamp.
    pub fn set_timestamp(&mut self, timestamp: Timestamp) {
        self.timestamp = Some(timestamp);
    }

    /// This item's lineage envelope, if lineage tracking is enabled for the pipeline.
    #[must_use]
    pub fn lineage(&self) -> Option<&LineageEnvelope> {
        self.lineage.as_ref()
    }

    /// Mutable access to the lineage envelope, for the node runner to append hops.
    pub fn lineage_mut(&mut self) -> Option<&mut LineageEnvelope> {
        self.lineage.as_mut()
    }

    /// Attaches a lineage envelope (normally done once, by the producing source).
    pub fn set_lineage(&mut self, envelope: LineageEnvelope) {
        self.lineage = Some(envelope);
    }

    /// Takes the lineage envelope out, leaving the item without one. Used when an item is
    /// consumed and re-wrapped (e.g. a join emitting a new combined item that inherits both
    /// parents' traversal paths by way of the lineage mapper rather than by object identity).
    pub fn take_lineage(&mut self) -> Option<LineageEnvelope> {
        self.lineage.take()
    }

    /// Attempts to recover the concrete type `T` this item was built from, consuming it.
    ///
    /// # Errors
    ///
    /// Returns `self` unchanged if the erased payload is not actually a `T` — a defensive
    /// check that should never trip given the builder only ever downcasts at the type it
    /// itself erased (spec §9 "reflection-based discovery cached as immutable metadata").
    pub fn downcast<T: 'static>(self) -> Result<T, Self> {
        let Item {
            payload,
            timestamp,
            lineage,
        } = self;
        match payload.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(payload) => Err(Item {
                payload,
                timestamp,
                lineage,
            }),
        }
    }

    /// Borrows the concrete type `T`, if the erased payload matches.
    #[must_use]
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("type", &self.payload.type_id())
            .field("timestamp", &self.timestamp)
            .field("has_lineage", &self.lineage.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_concrete_type() {
        let item = Item::with_timestamp(42i32, 1_000);
        assert_eq!(item.timestamp(), Some(1_000));
        assert_eq!(item.downcast::<i32>().unwrap(), 42);
    }

    #[test]
    fn downcast_mismatch_returns_item_unchanged() {
        let item = Item::new(42i32);
        let item = item.downcast::<String>().unwrap_err();
        assert_eq!(item.downcast::<i32>().unwrap(), 42);
    }
}
