// SPDX-License-Identifier: Apache-2.0

//! The fluent, typed pipeline builder (spec §4.9).
//!
//! Grounded on `otap-df-config::pipeline::PipelineConfig::validate`'s structural checks,
//! wrapped here around [`npipe_config::GraphBuilder`] so every `connect` call is additionally
//! checked at compile time by the handles' Rust generic parameters — the defensive
//! `TypeKey`-based check in `npipe-config` remains as the backstop for declaratively-assembled
//! graphs (SPEC_FULL.md §3.9).
//!
//! Every `add_*` method has an `add_*_with` counterpart taking a [`NodeOptions`] so callers can
//! override a node's `execution_strategy`/`retry_options` away from the pipeline default (spec
//! §6, §4.9). The runner only gives `ExecutionStrategy::Resilient` distinct behavior
//! (`resilient_call` gating); `Parallel`/`Batching` are accepted and stored on the node the same
//! as any other strategy but run through the same sequential per-item loop as `Sequential` —
//! a disclosed scope cut, recorded in DESIGN.md alongside the `!Send`/`Send` reduction.

use crate::aggregate::{AggregateAdapter, ErasedAggregate};
use crate::join::{ErasedJoin, JoinAdapter, JoinMode};
use crate::node::{Accumulator, ErasedDecision, ErasedSink, ErasedSource, ErasedTransform, JoinLogic, Sink, Source, Transform};
use crate::{effect_handler::EffectHandler, error::UserError, item::Item};
use async_trait::async_trait;
use npipe_channel::PipeSender;
use npipe_config::graph::{GraphBuilder, NodeSpec, TypeKey};
use npipe_config::node::{Cardinality, ExecutionStrategy, MergeStrategy, NodeId, NodeKind, PortName};
use npipe_config::retry::RetryOptions;
use npipe_config::window::WindowSpec;
use npipe_config::{Error as ConfigError, PipelineDefinition};
use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;
use std::time::Duration;

/// A typed output port, returned by handles that produce items.
pub struct Output<T> {
    node: NodeId,
    port: PortName,
    _marker: PhantomData<fn() -> T>,
}

/// A typed input port, accepted by handles that consume items.
pub struct Input<T> {
    node: NodeId,
    port: PortName,
    _marker: PhantomData<fn(T)>,
}

macro_rules! handle {
    ($name:ident) => {
        /// Typed handle returned by the builder, carrying its node id for `connect` calls.
        pub struct $name<T> {
            node: NodeId,
            _marker: PhantomData<fn(T) -> T>,
        }

        impl<T> $name<T> {
            /// The underlying node id, for diagnostics.
            #[must_use]
            pub fn node_id(&self) -> NodeId {
                self.node
            }
        }

        impl<T> Clone for $name<T> {
            fn clone(&self) -> Self {
                Self {
                    node: self.node,
                    _marker: PhantomData,
                }
            }
        }
        impl<T> Copy for $name<T> {}
    };
}

handle!(SourceHandle);
handle!(SinkHandle);

impl<T: 'static> SourceHandle<T> {
    /// This source's output port.
    #[must_use]
    pub fn output(&self) -> Output<T> {
        Output {
            node: self.node,
            port: PortName::default(),
            _marker: PhantomData,
        }
    }
}

impl<T: 'static> SinkHandle<T> {
    /// This sink's input port.
    #[must_use]
    pub fn input(&self) -> Input<T> {
        Input {
            node: self.node,
            port: PortName::default(),
            _marker: PhantomData,
        }
    }
}

/// Typed handle for a transform node.
pub struct TransformHandle<In, Out> {
    node: NodeId,
    _marker: PhantomData<fn(In) -> Out>,
}

impl<In, Out> Clone for TransformHandle<In, Out> {
    fn clone(&self) -> Self {
        Self {
            node: self.node,
            _marker: PhantomData,
        }
    }
}
impl<In, Out> Copy for TransformHandle<In, Out> {}

impl<In: 'static, Out: 'static> TransformHandle<In, Out> {
    /// This transform's input port.
    #[must_use]
    pub fn input(&self) -> Input<In> {
        Input {
            node: self.node,
            port: PortName::default(),
            _marker: PhantomData,
        }
    }

    /// This transform's output port.
    #[must_use]
    pub fn output(&self) -> Output<Out> {
        Output {
            node: self.node,
            port: PortName::default(),
            _marker: PhantomData,
        }
    }
}

/// Typed handle for a join node.
pub struct JoinHandle<L, R, Out> {
    node: NodeId,
    _marker: PhantomData<fn(L, R) -> Out>,
}

impl<L, R, Out> Clone for JoinHandle<L, R, Out> {
    fn clone(&self) -> Self {
        Self {
            node: self.node,
            _marker: PhantomData,
        }
    }
}
impl<L, R, Out> Copy for JoinHandle<L, R, Out> {}

impl<L: 'static, R: 'static, Out: 'static> JoinHandle<L, R, Out> {
    /// The left input port.
    #[must_use]
    pub fn left_input(&self) -> Input<L> {
        Input {
            node: self.node,
            port: PortName::from("left"),
            _marker: PhantomData,
        }
    }

    /// The right input port.
    #[must_use]
    pub fn right_input(&self) -> Input<R> {
        Input {
            node: self.node,
            port: PortName::from("right"),
            _marker: PhantomData,
        }
    }

    /// The output port.
    #[must_use]
    pub fn output(&self) -> Output<Out> {
        Output {
            node: self.node,
            port: PortName::default(),
            _marker: PhantomData,
        }
    }
}

/// Typed handle for an aggregate node.
pub struct AggregateHandle<In, Out> {
    node: NodeId,
    _marker: PhantomData<fn(In) -> Out>,
}

impl<In, Out> Clone for AggregateHandle<In, Out> {
    fn clone(&self) -> Self {
        Self {
            node: self.node,
            _marker: PhantomData,
        }
    }
}
impl<In, Out> Copy for AggregateHandle<In, Out> {}

impl<In: 'static, Out: 'static> AggregateHandle<In, Out> {
    /// The input port.
    #[must_use]
    pub fn input(&self) -> Input<In> {
        Input {
            node: self.node,
            port: PortName::default(),
            _marker: PhantomData,
        }
    }

    /// The output port.
    #[must_use]
    pub fn output(&self) -> Output<Out> {
        Output {
            node: self.node,
            port: PortName::default(),
            _marker: PhantomData,
        }
    }
}

struct SourceAdapter<Out, S> {
    inner: S,
    _marker: PhantomData<fn() -> Out>,
}

#[async_trait]
impl<Out: Send + 'static, S: Source<Out>> ErasedSource for SourceAdapter<Out, S> {
    async fn run(&self, tx: PipeSender<Item>, ctx: &EffectHandler) -> Result<u64, UserError> {
        let emitted = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
        let sender = crate::node::ItemSender::with_counter(tx, emitted.clone());
        self.inner.run(sender, ctx).await?;
        Ok(emitted.load(std::sync::atomic::Ordering::Relaxed))
    }
}

struct TransformAdapter<In, Out, T> {
    inner: T,
    _marker: PhantomData<fn(In) -> Out>,
}

#[async_trait]
impl<In: Send + Sync + Clone + 'static, Out: Send + 'static, T: Transform<In, Out>> ErasedTransform
    for TransformAdapter<In, Out, T>
{
    async fn call(&self, input: &Item, ctx: &EffectHandler) -> Result<ErasedDecision, UserError> {
        let value = input
            .downcast_ref::<In>()
            .cloned()
            .ok_or_else(|| UserError::permanent("transform received an item of the wrong type"))?;
        match self.inner.call(value, ctx).await? {
            crate::node::Decision::Ok(outputs) => Ok(ErasedDecision::Ok(
                outputs.into_iter().map(Item::new).collect(),
            )),
            crate::node::Decision::Reject(reason) => Ok(ErasedDecision::Reject(reason)),
        }
    }

    fn cardinality(&self) -> Cardinality {
        self.inner.cardinality()
    }
}

struct SinkAdapter<In, S> {
    inner: S,
    _marker: PhantomData<fn(In)>,
}

#[async_trait]
impl<In: Send + Sync + Clone + 'static, S: Sink<In>> ErasedSink for SinkAdapter<In, S> {
    async fn call(&self, input: &Item, ctx: &EffectHandler) -> Result<(), UserError> {
        let value = input
            .downcast_ref::<In>()
            .cloned()
            .ok_or_else(|| UserError::permanent("sink received an item of the wrong type"))?;
        self.inner.call(value, ctx).await
    }
}

/// Per-node overrides accepted by every `add_*` method (spec §4.9 "Configuration operations
/// attach ... retryOptions", §6 `executionStrategy`). Defaults to `Sequential` execution and no
/// retry override, matching every node's behavior before this type existed.
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    /// How the runner schedules this node's item processing.
    pub execution_strategy: ExecutionStrategy,
    /// Retry/restart budget override for this node; `None` falls back to the pipeline default.
    pub retry_options: Option<RetryOptions>,
}

impl NodeOptions {
    /// `Sequential` execution with `retry_options` set, leaving execution strategy at its
    /// default.
    #[must_use]
    pub fn with_retry(retry_options: RetryOptions) -> Self {
        Self {
            execution_strategy: ExecutionStrategy::default(),
            retry_options: Some(retry_options),
        }
    }

    /// The given execution strategy with no retry override.
    #[must_use]
    pub fn with_execution_strategy(execution_strategy: ExecutionStrategy) -> Self {
        Self {
            execution_strategy,
            retry_options: None,
        }
    }
}

/// Declares nodes and edges, mirroring `npipe_config::GraphBuilder`'s lifecycle plus the
/// node-behavior storage the runner needs (spec §4.9's fluent operations).
pub struct Builder {
    graph: GraphBuilder,
    behaviors: HashMap<NodeId, crate::node::NodeBehavior>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new(npipe_config::ValidationMode::Strict)
    }
}

impl Builder {
    /// Builds an empty builder with the given validation strictness.
    #[must_use]
    pub fn new(validation_mode: npipe_config::ValidationMode) -> Self {
        Self {
            graph: GraphBuilder::new(validation_mode),
            behaviors: HashMap::new(),
        }
    }

    /// Declares a source node (spec §4.9 `addSource<T>`).
    pub fn add_source<Out: Send + 'static>(
        &mut self,
        name: &str,
        source: impl Source<Out> + 'static,
    ) -> Result<SourceHandle<Out>, ConfigError> {
        self.add_source_with(name, source, NodeOptions::default())
    }

    /// [`Builder::add_source`] with a per-node [`NodeOptions`] override.
    pub fn add_source_with<Out: Send + 'static>(
        &mut self,
        name: &str,
        source: impl Source<Out> + 'static,
        options: NodeOptions,
    ) -> Result<SourceHandle<Out>, ConfigError> {
        let id = self.graph.add_node(NodeSpec {
            name: name.to_string(),
            kind: NodeKind::Source,
            input_ports: Vec::new(),
            output_type: Some(TypeKey::of::<Out>()),
            declared_cardinality: None,
            merge_strategy: None,
            execution_strategy: options.execution_strategy,
            retry_options: options.retry_options,
        })?;
        self.behaviors.insert(
            id,
            crate::node::NodeBehavior::Source(std::sync::Arc::new(SourceAdapter {
                inner: source,
                _marker: PhantomData,
            })),
        );
        Ok(SourceHandle {
            node: id,
            _marker: PhantomData,
        })
    }

    /// Declares a transform node (spec §4.9 `addTransform<In,Out>`). `In` must be `Clone`
    /// because the runner retries a failed call by re-invoking it on the same buffered item
    /// (spec §4.5).
    pub fn add_transform<In: Send + Sync + Clone + 'static, Out: Send + 'static>(
        &mut self,
        name: &str,
        cardinality: Cardinality,
        transform: impl Transform<In, Out> + 'static,
    ) -> Result<TransformHandle<In, Out>, ConfigError> {
        self.add_transform_with(name, cardinality, transform, NodeOptions::default())
    }

    /// [`Builder::add_transform`] with a per-node [`NodeOptions`] override.
    pub fn add_transform_with<In: Send + Sync + Clone + 'static, Out: Send + 'static>(
        &mut self,
        name: &str,
        cardinality: Cardinality,
        transform: impl Transform<In, Out> + 'static,
        options: NodeOptions,
    ) -> Result<TransformHandle<In, Out>, ConfigError> {
        let id = self.graph.add_node(NodeSpec {
            name: name.to_string(),
            kind: NodeKind::Transform,
            input_ports: vec![(PortName::default(), TypeKey::of::<In>())],
            output_type: Some(TypeKey::of::<Out>()),
            declared_cardinality: Some(cardinality),
            merge_strategy: None,
            execution_strategy: options.execution_strategy,
            retry_options: options.retry_options,
        })?;
        self.behaviors.insert(
            id,
            crate::node::NodeBehavior::Transform(std::sync::Arc::new(TransformAdapter {
                inner: transform,
                _marker: PhantomData,
            })),
        );
        Ok(TransformHandle {
            node: id,
            _marker: PhantomData,
        })
    }

    /// Declares a sink node (spec §4.9 `addSink<T>`). `In` must be `Clone`, for the same
    /// retry reason as [`Builder::add_transform`].
    pub fn add_sink<In: Send + Sync + Clone + 'static>(
        &mut self,
        name: &str,
        sink: impl Sink<In> + 'static,
    ) -> Result<SinkHandle<In>, ConfigError> {
        self.add_sink_with(name, sink, NodeOptions::default())
    }

    /// [`Builder::add_sink`] with a per-node [`NodeOptions`] override.
    pub fn add_sink_with<In: Send + Sync + Clone + 'static>(
        &mut self,
        name: &str,
        sink: impl Sink<In> + 'static,
        options: NodeOptions,
    ) -> Result<SinkHandle<In>, ConfigError> {
        let id = self.graph.add_node(NodeSpec {
            name: name.to_string(),
            kind: NodeKind::Sink,
            input_ports: vec![(PortName::default(), TypeKey::of::<In>())],
            output_type: None,
            declared_cardinality: None,
            merge_strategy: None,
            execution_strategy: options.execution_strategy,
            retry_options: options.retry_options,
        })?;
        self.behaviors.insert(
            id,
            crate::node::NodeBehavior::Sink(std::sync::Arc::new(SinkAdapter {
                inner: sink,
                _marker: PhantomData,
            })),
        );
        Ok(SinkHandle {
            node: id,
            _marker: PhantomData,
        })
    }

    /// Declares a join node (spec §4.9 `addJoin<L,R,K,Out>`). `L` and `R` must be `Clone`,
    /// for the same retry reason as [`Builder::add_transform`].
    #[allow(clippy::too_many_arguments)]
    pub fn add_join<L, R, Key, Out>(
        &mut self,
        name: &str,
        key_left: impl Fn(&L) -> Key + Send + Sync + 'static,
        key_right: impl Fn(&R) -> Key + Send + Sync + 'static,
        logic: impl JoinLogic<L, R, Out> + 'static,
        mode: JoinMode,
        window: Duration,
    ) -> Result<JoinHandle<L, R, Out>, ConfigError>
    where
        L: Send + Sync + Clone + 'static,
        R: Send + Sync + Clone + 'static,
        Key: Eq + Hash + Clone + Send + Sync + 'static,
        Out: Send + 'static,
    {
        self.add_join_with(
            name,
            key_left,
            key_right,
            logic,
            mode,
            window,
            NodeOptions::default(),
        )
    }

    /// [`Builder::add_join`] with a per-node [`NodeOptions`] override.
    #[allow(clippy::too_many_arguments)]
    pub fn add_join_with<L, R, Key, Out>(
        &mut self,
        name: &str,
        key_left: impl Fn(&L) -> Key + Send + Sync + 'static,
        key_right: impl Fn(&R) -> Key + Send + Sync + 'static,
        logic: impl JoinLogic<L, R, Out> + 'static,
        mode: JoinMode,
        window: Duration,
        options: NodeOptions,
    ) -> Result<JoinHandle<L, R, Out>, ConfigError>
    where
        L: Send + Sync + Clone + 'static,
        R: Send + Sync + Clone + 'static,
        Key: Eq + Hash + Clone + Send + Sync + 'static,
        Out: Send + 'static,
    {
        let id = self.graph.add_node(NodeSpec {
            name: name.to_string(),
            kind: NodeKind::Join,
            input_ports: vec![
                (PortName::from("left"), TypeKey::of::<L>()),
                (PortName::from("right"), TypeKey::of::<R>()),
            ],
            output_type: Some(TypeKey::of::<Out>()),
            declared_cardinality: Some(Cardinality::ManyToMany),
            merge_strategy: Some(MergeStrategy::Interleave),
            execution_strategy: options.execution_strategy,
            retry_options: options.retry_options,
        })?;
        let adapter: std::sync::Arc<dyn ErasedJoin> = std::sync::Arc::new(JoinAdapter::new(
            key_left,
            key_right,
            logic,
            mode,
            window.as_millis() as i64,
        ));
        self.behaviors
            .insert(id, crate::node::NodeBehavior::Join(adapter));
        Ok(JoinHandle {
            node: id,
            _marker: PhantomData,
        })
    }

    /// Declares an aggregate node (spec §4.9 `addAggregate<In,K,Acc,Out>`). `In` must be
    /// `Clone`, for the same retry reason as [`Builder::add_transform`].
    #[allow(clippy::too_many_arguments)]
    pub fn add_aggregate<In, Key, Acc, Out>(
        &mut self,
        name: &str,
        window_spec: WindowSpec,
        max_concurrent_windows: usize,
        allowed_lateness: Duration,
        key_fn: impl Fn(&In) -> Option<Key> + Send + Sync + 'static,
        create_accumulator: impl Fn() -> Acc + Send + Sync + 'static,
    ) -> Result<AggregateHandle<In, Out>, ConfigError>
    where
        In: Send + Sync + Clone + 'static,
        Key: Eq + Hash + Clone + Send + Sync + 'static,
        Acc: Accumulator<In, Out> + Send + 'static,
        Out: Send + Sync + 'static,
    {
        self.add_aggregate_with(
            name,
            window_spec,
            max_concurrent_windows,
            allowed_lateness,
            key_fn,
            create_accumulator,
            NodeOptions::default(),
        )
    }

    /// [`Builder::add_aggregate`] with a per-node [`NodeOptions`] override.
    #[allow(clippy::too_many_arguments)]
    pub fn add_aggregate_with<In, Key, Acc, Out>(
        &mut self,
        name: &str,
        window_spec: WindowSpec,
        max_concurrent_windows: usize,
        allowed_lateness: Duration,
        key_fn: impl Fn(&In) -> Option<Key> + Send + Sync + 'static,
        create_accumulator: impl Fn() -> Acc + Send + Sync + 'static,
        options: NodeOptions,
    ) -> Result<AggregateHandle<In, Out>, ConfigError>
    where
        In: Send + Sync + Clone + 'static,
        Key: Eq + Hash + Clone + Send + Sync + 'static,
        Acc: Accumulator<In, Out> + Send + 'static,
        Out: Send + Sync + 'static,
    {
        let id = self.graph.add_node(NodeSpec {
            name: name.to_string(),
            kind: NodeKind::Aggregate,
            input_ports: vec![(PortName::default(), TypeKey::of::<In>())],
            output_type: Some(TypeKey::of::<Out>()),
            declared_cardinality: Some(Cardinality::ManyToOne),
            merge_strategy: None,
            execution_strategy: options.execution_strategy,
            retry_options: options.retry_options,
        })?;
        let adapter: std::sync::Arc<dyn ErasedAggregate> = std::sync::Arc::new(AggregateAdapter::new(
            &window_spec,
            allowed_lateness.as_millis() as i64,
            max_concurrent_windows,
            key_fn,
            create_accumulator,
        ));
        self.behaviors
            .insert(id, crate::node::NodeBehavior::Aggregate(adapter));
        Ok(AggregateHandle {
            node: id,
            _marker: PhantomData,
        })
    }

    /// Connects a typed output port to a typed input port of the same element type (spec
    /// §4.9 `connect(src, dst)`). The Rust type parameter `T` must unify at the call site,
    /// so mismatched element types are a compile error here; `npipe_config::GraphBuilder`
    /// still records the `TypeKey` for the defensive runtime check.
    pub fn connect<T: 'static>(
        &mut self,
        from: Output<T>,
        to: Input<T>,
    ) -> Result<(), ConfigError> {
        self.graph
            .connect(from.node, from.port, to.node, to.port, TypeKey::of::<T>())
    }

    /// Finalizes the graph, freezing it into a [`PipelineDefinition`] and the accompanying
    /// node-behavior table the runner needs (spec §4.9 "On success, build() freezes the
    /// graph").
    pub fn build(
        self,
    ) -> Result<(PipelineDefinition, HashMap<NodeId, crate::node::NodeBehavior>), Vec<ConfigError>>
    {
        let definition = self.graph.build()?;
        Ok((definition, self.behaviors))
    }
}
