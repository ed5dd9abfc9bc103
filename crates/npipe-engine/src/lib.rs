// SPDX-License-Identifier: Apache-2.0

//! The NPipeline runtime: node behavior traits, the type-erased adapters that drive them, and
//! the pipeline runner that instantiates a frozen graph and runs it to completion (spec §4.6
//! through §4.12).
//!
//! `npipe-config` owns the *shape* of a pipeline; this crate owns everything about running one
//! — node behavior, retries, circuit breakers, windowed aggregation, joins, lineage and
//! observability.

pub mod aggregate;
pub mod builder;
pub mod circuit_breaker;
pub mod control;
pub mod effect_handler;
pub mod error;
pub mod error_policy;
pub mod item;
pub mod join;
pub mod lineage;
pub mod node;
pub mod observability;
pub mod pipeline;
pub mod retry;
pub mod runner;
pub mod watermark;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregate::{AggregateMetrics, AggregateOutcome, WindowAssigner};
pub use builder::{
    AggregateHandle, Builder, Input, JoinHandle, NodeOptions, Output, SinkHandle, SourceHandle,
    TransformHandle,
};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState, Outcome};
pub use control::{ControlSurface, NodeControlMsg};
pub use effect_handler::{EffectHandler, TimeoutOrCancel};
pub use error::{Error, IsTransient, UserError};
pub use error_policy::{
    DeadLetterEverything, DeadLetterRecord, DeadLetterSink, FailPipelineOnAnyFault,
    NodeErrorDecision, NodeErrorHandler, PipelineErrorDecision, PipelineErrorHandler,
};
pub use item::{Item, Timestamp};
pub use join::{JoinMode, Side};
pub use lineage::{
    Hop, HopCardinality, HopOutcome, LineageMapper, LineageRecord, LineageSink, LineageTracker,
};
pub use node::{
    Accumulator, Decision, ItemSender, JoinLogic, NodeBehavior, Sink, Source, Transform,
};
pub use observability::{
    NodeMetrics, ObservabilitySink, PipelineEvent, PipelineEventKind, PipelineMetrics,
    RecordingObservabilitySink, TracingObservabilitySink,
};
pub use pipeline::{PipelineLineageReport, PipelineRunOutcome, PipelineRunner, PipelineRuntime};
pub use retry::{RestartBudget, RetryOutcome};
pub use runner::{NodeInputs, NodeRunner, NodeRunnerConfig};
pub use watermark::{BoundedOutOfOrderness, LateDataFilter, Periodic, WatermarkGenerator};
