// SPDX-License-Identifier: Apache-2.0

//! Typed graph model, fluent builder and build-time validation for NPipeline pipelines.
//!
//! This crate owns the *shape* of a pipeline — nodes, edges, declared types, windows,
//! execution strategy and retry/circuit-breaker/lineage options (spec §4.9 "Graph & builder")
//! — but never the node *behavior* (user source/transform/join/aggregate/sink logic), which
//! lives in `npipe-engine` alongside the runtime that drives it.

pub mod circuit_breaker;
pub mod error;
pub mod graph;
pub mod lineage;
pub mod node;
pub mod retry;
pub mod settings;
pub mod window;

pub use circuit_breaker::{CircuitBreakerMemoryOptions, CircuitBreakerOptions};
pub use error::Error;
pub use graph::{EdgeSpec, GraphBuilder, NodeDef, NodeSpec, PipelineDefinition, TypeKey};
pub use lineage::{LineageOptions, ValidationMode};
pub use node::{Cardinality, ExecutionStrategy, MergeStrategy, NodeId, NodeKind, PortName};
pub use retry::{OverflowPolicy, RetryOptions};
pub use settings::{PipelineSettings, SettingsError};
pub use window::WindowSpec;
