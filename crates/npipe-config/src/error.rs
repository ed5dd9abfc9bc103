// SPDX-License-Identifier: Apache-2.0

//! Build-time error taxonomy for the graph & builder (spec §7 "ValidationFault, WiringFault, GraphFault").

use crate::node::NodeId;
use thiserror::Error;

/// Errors surfaced synchronously from [`crate::graph::GraphBuilder::build`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Two nodes were declared with the same name.
    #[error("duplicate node name `{name}`")]
    DuplicateNodeName {
        /// The name that collided.
        name: String,
    },

    /// An edge referenced a node id that is not part of this graph.
    #[error("edge references unknown node {node}")]
    DanglingEdge {
        /// The unknown node.
        node: NodeId,
    },

    /// `source.outputType != target.inputType` for some edge (WiringFault, spec §3 invariant
    /// "Port typing"). In this workspace the typed builder makes this a compile error for the
    /// fluent API; it remains reachable when a graph is assembled from a declarative,
    /// string-typed description (spec §4.9 ambient supplement).
    #[error(
        "type mismatch on edge {source} -> {target}: output type `{output_type}` does not match input type `{input_type}`"
    )]
    TypeMismatch {
        /// Edge source node.
        source: NodeId,
        /// Edge target node.
        target: NodeId,
        /// The source's declared output type name.
        output_type: String,
        /// The target's declared input type name.
        input_type: String,
    },

    /// The edge set contains a cycle (GraphFault, spec invariant "Graph acyclicity").
    #[error("graph contains a cycle through node {node}")]
    Cycle {
        /// A node that participates in the detected cycle.
        node: NodeId,
    },

    /// An output port has more than one consuming edge (invariant "Pipe ownership").
    #[error("output port {node}:{port} has more than one consumer")]
    MultipleConsumers {
        /// The node whose output port is over-subscribed.
        node: NodeId,
        /// The offending port.
        port: String,
    },

    /// A join's composite key selector arity/type does not match the declared key type.
    #[error("join key selector arity mismatch on node {node}: expected {expected}, got {actual}")]
    KeySelectorArityMismatch {
        /// The join node.
        node: NodeId,
        /// Arity declared by the key type.
        expected: usize,
        /// Arity produced by the compiled selector.
        actual: usize,
    },

    /// More than `u16::MAX` nodes were added to one graph.
    #[error("too many nodes in graph (limit is {limit})")]
    TooManyNodes {
        /// The node-count limit.
        limit: usize,
    },

    /// `connect()` was called with a source or target port that was never declared.
    #[error("node {node} has no declared port named `{port}`")]
    UnknownPort {
        /// The node being connected.
        node: NodeId,
        /// The requested port.
        port: String,
    },
}
