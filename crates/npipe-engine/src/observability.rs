// SPDX-License-Identifier: Apache-2.0

//! Observability event/metric schema (spec §4.12), grounded on the teacher's
//! observed-state/telemetry reporting shape, generalized from OTel-internal metrics into the
//! spec's `PipelineEvent`/`NodeMetrics` schema.

use npipe_config::node::NodeId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::SystemTime;
use uuid::Uuid;

/// One emitted observability event (spec §4.12, §6 "Event & metric schema").
#[derive(Debug, Clone)]
pub struct PipelineEvent {
    /// The run this event belongs to.
    pub run_id: Uuid,
    /// Wall-clock time the event was raised.
    pub wall_time: SystemTime,
    /// The node this event concerns, if any (pipeline-level events have none).
    pub node_id: Option<NodeId>,
    /// The event's kind.
    pub kind: PipelineEventKind,
    /// Free-form string tags for the event.
    pub tags: HashMap<String, String>,
}

/// The kinds of event the observability surface emits (spec §4.12).
#[derive(Debug, Clone)]
pub enum PipelineEventKind {
    /// The pipeline run started.
    PipelineStarted,
    /// The pipeline run completed successfully.
    PipelineCompleted,
    /// The pipeline run failed.
    PipelineFailed {
        /// Human-readable cause.
        cause: String,
    },
    /// A node run started.
    NodeExecutionStarted,
    /// A node run completed.
    NodeExecutionCompleted {
        /// Whether the node completed without a fatal fault.
        success: bool,
    },
    /// A node retried an item.
    NodeRetry {
        /// The retry attempt number.
        attempt: u32,
    },
    /// An item was dropped before reaching a node's user callback (e.g. late data).
    QueueDrop {
        /// Why the item was dropped.
        reason: String,
    },
    /// Periodic queue depth/throughput sample.
    QueueMetrics {
        /// Items currently buffered.
        depth: usize,
    },
    /// A circuit breaker changed state.
    CircuitBreakerTransition {
        /// The resource key.
        resource: String,
        /// The new state, as a label.
        new_state: String,
    },
    /// An aggregate window closed and emitted its result.
    WindowClosed {
        /// The window's start timestamp.
        window_start: i64,
    },
}

/// Per-node run metrics (spec §4.12).
#[derive(Debug, Clone, Default)]
pub struct NodeMetrics {
    /// Items the node's callback was invoked on (or accepted, for sources).
    pub items_processed: u64,
    /// Items the node emitted downstream.
    pub items_emitted: u64,
    /// Wall-clock duration of the node's run.
    pub duration_ms: u64,
    /// Number of per-item retries performed across the run.
    pub retry_count: u64,
    /// Peak memory usage, if measured.
    pub peak_memory_mb: Option<f64>,
    /// Observed throughput, if computed.
    pub throughput_items_per_sec: Option<f64>,
    /// Whether the node completed without a fatal fault.
    pub success: bool,
}

/// Aggregate metrics for one pipeline run (spec §4.10 "emit PipelineMetrics").
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    /// Total items processed across all nodes (spec testable property, seed test 1).
    pub total_items_processed: u64,
    /// Per-node metrics, keyed by node id.
    pub per_node: HashMap<NodeId, NodeMetrics>,
}

/// Receives observability events and metrics. Implementations are expected to be cheap and
/// non-blocking; expensive delivery (network, disk) should buffer internally.
pub trait ObservabilitySink: Send + Sync {
    /// Reports one event.
    fn on_event(&self, event: PipelineEvent);

    /// Reports one node's final metrics.
    fn on_node_metrics(&self, node_id: NodeId, metrics: NodeMetrics);
}

/// Default [`ObservabilitySink`] that forwards everything to `tracing` (spec §1 "the core
/// emits structured events; downstream sinks are pluggable").
#[derive(Default)]
pub struct TracingObservabilitySink;

impl ObservabilitySink for TracingObservabilitySink {
    fn on_event(&self, event: PipelineEvent) {
        tracing::info!(
            run_id = %event.run_id,
            node_id = ?event.node_id,
            kind = ?event.kind,
            "pipeline event"
        );
    }

    fn on_node_metrics(&self, node_id: NodeId, metrics: NodeMetrics) {
        tracing::info!(
            node_id = %node_id,
            items_processed = metrics.items_processed,
            items_emitted = metrics.items_emitted,
            duration_ms = metrics.duration_ms,
            retry_count = metrics.retry_count,
            success = metrics.success,
            "node execution completed"
        );
    }
}

/// In-memory [`ObservabilitySink`] test double that records everything for assertion.
#[derive(Default)]
pub struct RecordingObservabilitySink {
    events: Mutex<Vec<PipelineEvent>>,
    metrics: Mutex<HashMap<NodeId, NodeMetrics>>,
}

impl RecordingObservabilitySink {
    /// Builds an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().clone()
    }

    /// Snapshots recorded per-node metrics.
    #[must_use]
    pub fn metrics(&self) -> HashMap<NodeId, NodeMetrics> {
        self.metrics.lock().clone()
    }
}

impl ObservabilitySink for RecordingObservabilitySink {
    fn on_event(&self, event: PipelineEvent) {
        self.events.lock().push(event);
    }

    fn on_node_metrics(&self, node_id: NodeId, metrics: NodeMetrics) {
        self.metrics.lock().insert(node_id, metrics);
    }
}
