// SPDX-License-Identifier: Apache-2.0

//! User-facing node behavior traits and their type-erased runtime counterparts (spec §4.6,
//! §9 "polymorphic behavior sets keyed by node kind").
//!
//! Users implement the generic `Source`/`Transform`/`Join`/`Aggregate`/`Sink` traits against
//! their own concrete types; the builder (`builder.rs`) wraps each implementation in an
//! adapter that erases it to operate on [`crate::item::Item`], so the node runner (`runner.rs`)
//! can drive all five kinds through one loop shape regardless of payload type.

use crate::effect_handler::EffectHandler;
use crate::error::UserError;
use crate::item::Item;
use async_trait::async_trait;
use npipe_channel::PipeSender;
use npipe_config::node::Cardinality;
use std::marker::PhantomData;

/// The result of a transform/join callback: either zero-or-more outputs, or an explicit
/// rejection (spec §9 "Decision sum type `{Ok(out), Reject(reason), FailItem(cause)}`" — the
/// `FailItem` arm is modeled as this trait method's `Result::Err` instead, so a node's
/// `UserFault` always flows through one path).
pub enum Decision<Out> {
    /// Zero or more items to emit downstream.
    Ok(Vec<Out>),
    /// The item was intentionally filtered out; not an error.
    Reject(String),
}

impl<Out> Decision<Out> {
    /// A single emitted output (the common one-to-one case).
    #[must_use]
    pub fn emit(value: Out) -> Self {
        Decision::Ok(vec![value])
    }
}

/// Produces items given a sender, for as long as it has more to emit (spec §6 "Source
/// (produces a data-pipe given context)").
#[async_trait]
pub trait Source<Out: Send + 'static>: Send + Sync {
    /// Emits items onto `tx` until the source is exhausted or `ctx` is canceled.
    async fn run(&self, tx: ItemSender<Out>, ctx: &EffectHandler) -> Result<(), UserError>;
}

/// Maps, filters, or expands one input item (spec §6 "Transform (maps one input to one
/// output per call)"). `cardinality` is a static hint the runner uses for the
/// `itemsProcessed`/`itemsEmitted` testable property; it is not enforced, only reported.
#[async_trait]
pub trait Transform<In: Send + 'static, Out: Send + 'static>: Send + Sync {
    /// The declared input-to-output multiplicity this transform was built with.
    fn cardinality(&self) -> Cardinality {
        Cardinality::OneToOne
    }

    /// Processes one input item.
    async fn call(&self, input: In, ctx: &EffectHandler) -> Result<Decision<Out>, UserError>;
}

/// Correlates two input streams keyed by `K` (spec §6 "Join (two inputs, one output)").
/// Key extraction is supplied separately at build time (`builder.rs`); this trait only
/// combines a matched (or unmatched, for outer joins) pair into an output item.
#[async_trait]
pub trait JoinLogic<L: Send + 'static, R: Send + 'static, Out: Send + 'static>: Send + Sync {
    /// Combines a left/right pair (either side `None` for an outer-join unmatched emission)
    /// into an output item, or `None` to suppress emission for this pair.
    async fn combine(
        &self,
        left: Option<&L>,
        right: Option<&R>,
        ctx: &EffectHandler,
    ) -> Result<Option<Out>, UserError>;
}

/// Per-key, per-window mutable state folded by an aggregate node (spec §6 "Aggregate (input
/// -> keyed windowed output)"). Implementations are created fresh per `(window, key)` bucket.
pub trait Accumulator<In, Out>: Send {
    /// Folds one more item into this accumulator.
    fn accumulate(&mut self, item: &In);

    /// Produces the window's final result when it closes.
    fn result(&self) -> Out;
}

/// Consumes items with no output (spec §6 "Sink (consumes input pipe)").
#[async_trait]
pub trait Sink<In: Send + 'static>: Send + Sync {
    /// Consumes one input item.
    async fn call(&self, input: In, ctx: &EffectHandler) -> Result<(), UserError>;
}

/// A type-preserving wrapper around the item-level [`PipeSender`], handed to [`Source::run`]
/// implementations so user code never sees the erased [`Item`] type. Counts every
/// successfully-sent item so the node runner can report `itemsEmitted` for sources, whose
/// user code otherwise runs as one opaque call rather than the per-item loop the runner drives
/// for transforms/joins/aggregates/sinks (spec §4.12).
pub struct ItemSender<T> {
    inner: PipeSender<Item>,
    emitted: std::sync::Arc<std::sync::atomic::AtomicU64>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> ItemSender<T> {
    /// Wraps a raw item-level sender for a specific source output type.
    #[must_use]
    pub fn new(inner: PipeSender<Item>) -> Self {
        Self::with_counter(inner, std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0)))
    }

    /// Wraps a raw item-level sender, sharing `emitted` with the caller so it can read the
    /// running count after [`Source::run`] returns.
    #[must_use]
    pub(crate) fn with_counter(
        inner: PipeSender<Item>,
        emitted: std::sync::Arc<std::sync::atomic::AtomicU64>,
    ) -> Self {
        Self {
            inner,
            emitted,
            _marker: PhantomData,
        }
    }

    /// Sends one value, with no event timestamp attached.
    ///
    /// # Errors
    ///
    /// Returns the value back if the downstream consumer has released the pipe.
    pub async fn send(&self, value: T) -> Result<(), npipe_channel::SendError<T>> {
        self.inner
            .send(Item::new(value))
            .await
            .map(|()| {
                self.emitted
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            })
            .map_err(|e| npipe_channel::SendError::Closed(downcast_or_panic(e.into_inner())))
    }

    /// Sends one value carrying an event timestamp, for watermark-driven downstream nodes.
    ///
    /// # Errors
    ///
    /// Returns the value back if the downstream consumer has released the pipe.
    pub async fn send_timestamped(
        &self,
        value: T,
        timestamp: crate::item::Timestamp,
    ) -> Result<(), npipe_channel::SendError<T>> {
        self.inner
            .send(Item::with_timestamp(value, timestamp))
            .await
            .map(|()| {
                self.emitted
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            })
            .map_err(|e| npipe_channel::SendError::Closed(downcast_or_panic(e.into_inner())))
    }
}

fn downcast_or_panic<T: 'static>(item: Item) -> T {
    item.downcast::<T>()
        .unwrap_or_else(|_| unreachable!("ItemSender<T> only ever boxes T"))
}

/// Type-erased counterpart of [`Source`], built by the builder's adapter for one concrete
/// `Out` type.
#[async_trait]
pub trait ErasedSource: Send + Sync {
    /// Runs the source to completion, emitting erased items onto `tx` and returning how many
    /// were successfully sent.
    async fn run(&self, tx: PipeSender<Item>, ctx: &EffectHandler) -> Result<u64, UserError>;
}

/// Type-erased counterpart of [`Transform`].
///
/// Takes `input` by reference rather than by value: the node runner retries a failed call by
/// re-invoking this method on the same `Item`, which only works if the item's ownership stays
/// with the runner across attempts (spec §4.5 "per-item retry"). The adapter clones the
/// downcast value for the user callback, so wiring a transform through the builder requires
/// its `In` to be `Clone`.
#[async_trait]
pub trait ErasedTransform: Send + Sync {
    /// Processes one erased input item.
    async fn call(&self, input: &Item, ctx: &EffectHandler) -> Result<ErasedDecision, UserError>;

    /// The transform's declared cardinality.
    fn cardinality(&self) -> Cardinality;
}

/// Type-erased counterpart of [`Decision`].
pub enum ErasedDecision {
    /// Zero or more erased outputs.
    Ok(Vec<Item>),
    /// The item was filtered out.
    Reject(String),
}

/// Type-erased counterpart of [`Sink`]. Borrows `input` for the same reason as
/// [`ErasedTransform::call`] — the runner retries by re-invoking on the same item.
#[async_trait]
pub trait ErasedSink: Send + Sync {
    /// Consumes one erased input item.
    async fn call(&self, input: &Item, ctx: &EffectHandler) -> Result<(), UserError>;
}

/// The five node-kind behaviors a [`crate::runner::NodeRunner`] can drive (spec §9 "represent
/// a node as a tagged variant").
///
/// Holds each behavior behind an `Arc` rather than a `Box`: the pipeline runner (`pipeline.rs`)
/// needs to respawn a fresh [`crate::runner::NodeRunner`] against the same configured behavior
/// when a `RestartNode` decision is made, which requires cloning the behavior out of the
/// frozen node table rather than consuming it once.
#[derive(Clone)]
pub enum NodeBehavior {
    /// Produces items with no input.
    Source(std::sync::Arc<dyn ErasedSource>),
    /// Maps one input stream into one output stream.
    Transform(std::sync::Arc<dyn ErasedTransform>),
    /// Correlates two input streams (driven by `crate::join`, not this enum's runner path).
    Join(std::sync::Arc<dyn crate::join::ErasedJoin>),
    /// Folds a keyed, windowed input stream (driven by `crate::aggregate`).
    Aggregate(std::sync::Arc<dyn crate::aggregate::ErasedAggregate>),
    /// Consumes items with no output.
    Sink(std::sync::Arc<dyn ErasedSink>),
}
