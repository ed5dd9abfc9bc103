// SPDX-License-Identifier: Apache-2.0

//! Shared test-harness helpers, mirroring the teacher's `otap-df-engine::testing` module: a
//! throwaway [`NodeId`] and a fully-wired [`EffectHandler`] so node-behavior unit tests don't
//! each re-derive pipeline plumbing they don't care about.

use crate::effect_handler::EffectHandler;
use crate::observability::{ObservabilitySink, TracingObservabilitySink};
use npipe_config::graph::{GraphBuilder, NodeSpec, TypeKey};
use npipe_config::node::{ExecutionStrategy, NodeId, NodeKind};
use std::sync::Arc;
use uuid::Uuid;

/// A [`NodeId`] minted through a throwaway single-node graph, since `NodeId`'s constructor is
/// private to `npipe-config`.
#[must_use]
pub fn test_node_id() -> NodeId {
    let mut builder = GraphBuilder::default();
    builder
        .add_node(NodeSpec {
            name: "test-node".to_string(),
            kind: NodeKind::Source,
            input_ports: Vec::new(),
            output_type: Some(TypeKey::of::<i32>()),
            declared_cardinality: None,
            merge_strategy: None,
            execution_strategy: ExecutionStrategy::Sequential,
            retry_options: None,
        })
        .expect("empty graph builder never rejects its first node")
}

/// An [`EffectHandler`] wired to a fresh run id, an uncanceled cancellation token and a
/// [`TracingObservabilitySink`], suitable for node-behavior unit tests that don't assert on
/// observability output.
#[must_use]
pub fn test_effect_handler(node_id: NodeId) -> EffectHandler {
    test_effect_handler_with_sink(node_id, Arc::new(TracingObservabilitySink))
}

/// Like [`test_effect_handler`], but with a caller-supplied sink (e.g.
/// [`crate::observability::RecordingObservabilitySink`]) so a test can assert on emitted events.
#[must_use]
pub fn test_effect_handler_with_sink(
    node_id: NodeId,
    observability: Arc<dyn ObservabilitySink>,
) -> EffectHandler {
    EffectHandler::new(
        Uuid::new_v4(),
        node_id,
        NodeKind::Source,
        Arc::from("test-node"),
        tokio_util::sync::CancellationToken::new(),
        observability,
    )
}
