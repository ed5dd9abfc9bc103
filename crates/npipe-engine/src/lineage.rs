// SPDX-License-Identifier: Apache-2.0

//! Per-item lineage tracking (spec §4.3).
//!
//! Grounded on the teacher's admin/controller "batched writes are the default" framing for
//! observability sinks (SPEC_FULL.md §3.3): delivery to the configured [`LineageSink`] never
//! blocks the item's own node runner; `finalize` hands the record to the sink's own async
//! boundary.

use async_trait::async_trait;
use npipe_config::node::NodeId;
use npipe_config::retry::OverflowPolicy;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// What a node's handling of an item contributed to its lineage (spec §3 "Lineage hop").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopOutcome {
    /// The item (or a derived item) was emitted downstream.
    Emitted,
    /// The item was filtered out (`Decision::Reject`).
    FilteredOut,
    /// The item participated in a join match.
    Joined,
    /// The item was folded into a window accumulator.
    Aggregated,
    /// The item was retried at least once before this hop's outcome.
    Retried,
    /// The node's callback failed for this item.
    Error,
    /// The item was routed to the dead-letter sink.
    DeadLettered,
    /// The item's window was evicted before triggering (`maxConcurrentWindows` overflow).
    Evicted,
}

/// Declared input-to-output multiplicity observed for one hop, independent of the node's
/// static declared cardinality (a `OneToMany` node may still emit `One` for a given input).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopCardinality {
    /// Zero outputs produced.
    Zero,
    /// Exactly one output produced.
    One,
    /// More than one output produced.
    Many,
    /// Not tracked for this hop.
    Unknown,
}

/// One node's contribution to an item's lineage record.
#[derive(Debug, Clone)]
pub struct Hop {
    /// The node that produced this hop.
    pub node_id: NodeId,
    /// What happened to the item at this node.
    pub outcomes: Vec<HopOutcome>,
    /// Observed input-to-output multiplicity.
    pub cardinality: HopCardinality,
    /// For fan-in nodes (joins, merges), the lineage ids this hop's output derives from.
    pub input_contributors: Vec<Uuid>,
    /// For fan-out nodes, indices into the node's emitted batch this hop is responsible for.
    pub output_emissions: Vec<usize>,
}

impl Hop {
    /// Builds a hop recording a single outcome with no fan-in/fan-out detail.
    #[must_use]
    pub fn simple(node_id: NodeId, outcome: HopOutcome, cardinality: HopCardinality) -> Self {
        Self {
            node_id,
            outcomes: vec![outcome],
            cardinality,
            input_contributors: Vec::new(),
            output_emissions: Vec::new(),
        }
    }
}

/// Per-item lineage state (spec §3 "Item" envelope, minus the payload itself which lives on
/// [`crate::item::Item`]).
#[derive(Debug, Clone)]
pub struct LineageEnvelope {
    lineage_id: Uuid,
    traversal_path: Vec<NodeId>,
    hops: Vec<Hop>,
    collect: bool,
    truncated: bool,
}

impl LineageEnvelope {
    /// The stable id assigned at the producing source; preserved across every hop (spec
    /// invariant "Lineage id immutability").
    #[must_use]
    pub fn lineage_id(&self) -> Uuid {
        self.lineage_id
    }

    /// The ordered list of node ids this item has visited.
    #[must_use]
    pub fn traversal_path(&self) -> &[NodeId] {
        &self.traversal_path
    }

    /// Recorded hops, in visitation order.
    #[must_use]
    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    /// Whether this envelope was selected for collection by deterministic sampling.
    #[must_use]
    pub fn collect(&self) -> bool {
        self.collect
    }

    /// Whether the hop list was truncated due to `maxHopsPerItem`.
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

/// Finalized lineage record delivered to a [`LineageSink`] (spec §4.3 `finalize`).
#[derive(Debug, Clone)]
pub struct LineageRecord {
    /// The item's stable lineage id.
    pub lineage_id: Uuid,
    /// Ordered node-id path the item traversed.
    pub traversal_path: Vec<NodeId>,
    /// Recorded hops.
    pub hops: Vec<Hop>,
    /// `true` if the hop list was truncated before finalization.
    pub truncated: bool,
}

/// Assigns and mutates lineage envelopes for one pipeline run (spec §4.3).
///
/// Holds no interior mutability of its own — the envelope itself is the unit of state, carried
/// on the [`crate::item::Item`] as it moves through the graph — so this is a stateless
/// read-only policy object safely shared across node runners via `Arc`.
pub struct LineageTracker {
    sample_every: u32,
    max_hops_per_item: usize,
    mapper_overflow_policy: OverflowPolicy,
}

impl LineageTracker {
    /// Builds a tracker from lineage options (spec §6 "lineageOptions").
    #[must_use]
    pub fn new(sample_every: u32, max_hops_per_item: usize, mapper_overflow_policy: OverflowPolicy) -> Self {
        Self {
            sample_every: sample_every.max(1),
            max_hops_per_item,
            mapper_overflow_policy,
        }
    }

    /// The overflow policy applied by lineage mappers seeding fan-out/fan-in hops.
    #[must_use]
    pub fn mapper_overflow_policy(&self) -> OverflowPolicy {
        self.mapper_overflow_policy
    }

    /// Creates a fresh envelope for an item newly produced by `source_node_id`.
    #[must_use]
    pub fn create_envelope(&self, source_node_id: NodeId) -> LineageEnvelope {
        let lineage_id = Uuid::new_v4();
        let collect = Self::sample(lineage_id, self.sample_every);
        LineageEnvelope {
            lineage_id,
            traversal_path: vec![source_node_id],
            hops: Vec::new(),
            collect,
            truncated: false,
        }
    }

    fn sample(lineage_id: Uuid, sample_every: u32) -> bool {
        let mut hasher = DefaultHasher::new();
        lineage_id.hash(&mut hasher);
        (hasher.finish() % u64::from(sample_every)) == 0
    }

    /// Appends `node_id` to the traversal path and, if `collect` and under the hop cap,
    /// records `hop`; otherwise marks the envelope truncated.
    pub fn record_hop(&self, envelope: &mut LineageEnvelope, node_id: NodeId, hop: Hop) {
        envelope.traversal_path.push(node_id);
        if !envelope.collect {
            return;
        }
        if envelope.hops.len() < self.max_hops_per_item {
            envelope.hops.push(hop);
        } else {
            envelope.truncated = true;
        }
    }

    /// Converts an envelope into its terminal [`LineageRecord`] form for delivery to a sink.
    #[must_use]
    pub fn finalize(&self, envelope: LineageEnvelope) -> LineageRecord {
        LineageRecord {
            lineage_id: envelope.lineage_id,
            traversal_path: envelope.traversal_path,
            hops: envelope.hops,
            truncated: envelope.truncated,
        }
    }
}

/// Maps a fan-out/fan-in node's inputs to outputs so the runner can seed lineage correctly
/// for non-1:1 transforms (spec §4.3 "lineage mapper").
///
/// `map` returns, for each output index, the input indices that contributed to it.
pub trait LineageMapper<In, Out>: Send + Sync {
    /// Computes the output-to-input contributor mapping for one batch.
    fn map(&self, inputs: &[In], outputs: &[Out]) -> Vec<(usize, Vec<usize>)>;
}

/// Destination for finalized lineage records. Implementations are expected to batch writes
/// (spec §5 "batched writes are the default to avoid back-pressuring pipelines").
#[async_trait]
pub trait LineageSink: Send + Sync {
    /// Delivers one finalized record. Errors are logged by the caller, not propagated to the
    /// item's own node runner.
    async fn emit(&self, record: LineageRecord);
}

/// In-memory [`LineageSink`] test double, grounded on the teacher's in-memory exporter test
/// fixtures (SPEC_FULL.md "test tooling").
#[derive(Default)]
pub struct VecLineageSink {
    records: parking_lot::Mutex<Vec<LineageRecord>>,
}

impl VecLineageSink {
    /// Builds an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots the records collected so far.
    #[must_use]
    pub fn records(&self) -> Vec<LineageRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl LineageSink for VecLineageSink {
    async fn emit(&self, record: LineageRecord) {
        self.records.lock().push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use npipe_config::graph::{GraphBuilder, NodeSpec, TypeKey};
    use npipe_config::node::{ExecutionStrategy, NodeKind};

    fn test_node_id() -> NodeId {
        let mut builder = GraphBuilder::default();
        builder
            .add_node(NodeSpec {
                name: "n".to_string(),
                kind: NodeKind::Source,
                input_ports: Vec::new(),
                output_type: Some(TypeKey::of::<i32>()),
                declared_cardinality: None,
                merge_strategy: None,
                execution_strategy: ExecutionStrategy::Sequential,
                retry_options: None,
            })
            .unwrap()
    }

    #[test]
    fn sampling_is_deterministic_for_fixed_rate() {
        let tracker = LineageTracker::new(3, 64, OverflowPolicy::WarnContinue);
        let envelope = tracker.create_envelope(test_node_id());
        let again = LineageTracker::sample(envelope.lineage_id, 3);
        assert_eq!(envelope.collect, again);
    }

    #[test]
    fn hops_truncate_past_cap() {
        let tracker = LineageTracker::new(1, 1, OverflowPolicy::WarnContinue);
        let node = test_node_id();
        let mut envelope = tracker.create_envelope(node);
        tracker.record_hop(
            &mut envelope,
            node,
            Hop::simple(node, HopOutcome::Emitted, HopCardinality::One),
        );
        tracker.record_hop(
            &mut envelope,
            node,
            Hop::simple(node, HopOutcome::Emitted, HopCardinality::One),
        );
        assert_eq!(envelope.hops.len(), 1);
        assert!(envelope.truncated);
    }
}
