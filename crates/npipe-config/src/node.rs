// SPDX-License-Identifier: Apache-2.0

//! Node identity and declarative node-level settings.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Unique identifier of a node within a graph, assigned in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// The raw integer index backing this id.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Name of an output or input port on a node. Most nodes expose a single, unnamed default
/// port (`PortName::default()`); multi-input nodes (joins, merge-strategy transforms) use
/// named ports to disambiguate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortName(pub Cow<'static, str>);

impl Default for PortName {
    fn default() -> Self {
        PortName(Cow::Borrowed("default"))
    }
}

impl fmt::Display for PortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&'static str> for PortName {
    fn from(value: &'static str) -> Self {
        PortName(Cow::Borrowed(value))
    }
}

impl From<String> for PortName {
    fn from(value: String) -> Self {
        PortName(Cow::Owned(value))
    }
}

/// The five node kinds named by the data model (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Produces items; no inputs.
    Source,
    /// Maps/filters/expands one input stream into one output stream.
    Transform,
    /// Correlates two input streams into one output stream.
    Join,
    /// Folds a keyed, windowed input stream into an output stream.
    Aggregate,
    /// Consumes items; no outputs.
    Sink,
}

/// Declared input-to-output multiplicity of a transform node, used by the lineage engine
/// to validate `itemsProcessed`/`itemsEmitted` relationships (spec testable property 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// Exactly one output per input.
    OneToOne,
    /// Zero or more outputs per input.
    OneToMany,
    /// One output per N inputs.
    ManyToOne,
    /// An unconstrained input-to-output relationship.
    ManyToMany,
}

/// Policy for combining multiple input streams into one consumable sequence at a
/// multi-input node (spec §4.6.1, glossary "Merge strategy").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Items are consumed in whatever order they arrive across inputs.
    Interleave,
    /// Inputs are polled round-robin, each contributing one item per round.
    Ordered,
    /// A user-named custom merger; resolved by the node factory at pipeline start.
    Custom(String),
}

/// Per-node execution strategy (spec §5, §6 "executionStrategy").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Cooperative, single-threaded: items are processed one at a time in arrival order.
    Sequential,
    /// `workers` independent concurrent workers; per-key order only with a keyed partitioner.
    Parallel {
        /// Number of concurrent workers.
        workers: std::num::NonZeroUsize,
    },
    /// Items are buffered into groups of `size` before the user callback runs.
    Batching {
        /// Target batch size.
        size: std::num::NonZeroUsize,
    },
    /// Composes retry + circuit-breaker around the inner strategy (spec §5).
    Resilient,
}

impl Default for ExecutionStrategy {
    fn default() -> Self {
        ExecutionStrategy::Sequential
    }
}
