// SPDX-License-Identifier: Apache-2.0

//! NPipeline: an embeddable streaming pipeline engine.
//!
//! This crate is a thin facade over the workspace's member crates, so an embedding application
//! depends on one crate instead of wiring up `npipe-config`/`npipe-engine`/`npipe-channel`/
//! `npipe-spi` individually. It re-exports the pieces most callers need to declare and run a
//! pipeline; anything not re-exported here is still reachable through the member crates
//! directly.
//!
//! ```ignore
//! use npipeline::{Builder, PipelineRunner, PipelineRuntime, PipelineSettings};
//!
//! let mut builder = Builder::default();
//! // builder.add_source(...); builder.add_transform(...); builder.connect(...);
//! let (definition, behaviors) = builder.build().expect("valid graph");
//! let runner = PipelineRunner::new(definition, behaviors, PipelineRuntime::new(PipelineSettings::default()));
//! // let outcome = runner.run().await;
//! ```

pub use npipe_channel::{DataPipe, PipeError, PipeIter, PipeSender, SendError};
pub use npipe_config::{
    Cardinality, CircuitBreakerMemoryOptions, CircuitBreakerOptions, EdgeSpec, Error as ConfigError,
    ExecutionStrategy, GraphBuilder, LineageOptions, MergeStrategy, NodeDef, NodeId, NodeKind,
    NodeSpec, OverflowPolicy, PipelineDefinition, PipelineSettings, PortName, RetryOptions,
    SettingsError, TypeKey, ValidationMode, WindowSpec,
};
pub use npipe_engine::{
    AggregateHandle, Builder, Decision, EffectHandler, Error, Input, Item, JoinHandle, JoinLogic,
    JoinMode, NodeBehavior, NodeOptions, Output, PipelineLineageReport, PipelineRunOutcome,
    PipelineRunner, PipelineRuntime, Side, Sink, SinkHandle, Source, SourceHandle, Transform,
    TransformHandle, UserError,
};
pub use npipe_spi::{
    CheckpointStore, Connection, ConnectorError, DbConnector, InMemoryCheckpoint, ListedItem,
    NoCheckpoint, ObjectMetadata, ReadStream, Reader, Row, StorageError, StorageProvider,
    WriteStrategy, WriteStream, Writer,
};
