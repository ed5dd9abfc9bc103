// SPDX-License-Identifier: Apache-2.0

//! Error-handler chain and dead-letter routing (spec §4.11).

use crate::error::Error;
use async_trait::async_trait;
use npipe_config::node::NodeId;
use std::time::SystemTime;

/// Per-item decision returned by a node's error handler (spec §4.11 "Node error handler").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeErrorDecision {
    /// Retry the item (only reachable if retries remain; otherwise treated as `Skip`).
    Retry,
    /// Drop the item silently.
    Skip,
    /// Route the item to the configured dead-letter sink.
    DeadLetter,
    /// Stop this node but let the rest of the pipeline continue.
    StopNode,
    /// Fail the whole pipeline.
    FailPipeline,
}

/// Per-node decision returned by the pipeline error handler on a fatal node failure (spec
/// §4.11 "Pipeline error handler", §4.10 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorDecision {
    /// Ignore the failure and keep the rest of the pipeline running.
    Continue,
    /// Restart the failed node, if its restart budget allows.
    RestartNode,
    /// Let in-flight items complete, then stop accepting new work.
    DrainAndStop,
    /// Cancel the whole pipeline.
    FailPipeline,
}

/// Decides how to handle one item-level failure. The default implementation dead-letters
/// everything it's given, since the engine has already exhausted retries/non-transient
/// detection by the time this is consulted (spec §4.6 step 2d).
#[async_trait]
pub trait NodeErrorHandler: Send + Sync {
    /// Decides what to do with one failed item.
    async fn decide(&self, node_id: NodeId, error: &Error) -> NodeErrorDecision;
}

/// Always dead-letters, matching the spec's seed test 2 ("handler=Skip" is the opt-in
/// alternative users wire explicitly; this is the conservative default).
pub struct DeadLetterEverything;

#[async_trait]
impl NodeErrorHandler for DeadLetterEverything {
    async fn decide(&self, _node_id: NodeId, _error: &Error) -> NodeErrorDecision {
        NodeErrorDecision::DeadLetter
    }
}

/// Decides how to handle one node-level fatal failure.
#[async_trait]
pub trait PipelineErrorHandler: Send + Sync {
    /// Decides what to do about a node that failed fatally.
    async fn decide(&self, node_id: NodeId, error: &Error) -> PipelineErrorDecision;
}

/// Always fails the pipeline on any fatal node failure — the conservative default; resilience
/// must be opted into via `ExecutionStrategy::Resilient` plus an explicit handler.
pub struct FailPipelineOnAnyFault;

#[async_trait]
impl PipelineErrorHandler for FailPipelineOnAnyFault {
    async fn decide(&self, _node_id: NodeId, _error: &Error) -> PipelineErrorDecision {
        PipelineErrorDecision::FailPipeline
    }
}

/// A failed item's record, delivered to the configured dead-letter sink (spec §4.11).
#[derive(Debug, Clone)]
pub struct DeadLetterRecord {
    /// The node that produced this failure.
    pub node_id: NodeId,
    /// Classification of the failure.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// The chain of causes, innermost first.
    pub cause_chain: Vec<String>,
    /// The item's traversal path so far, if lineage tracking is enabled.
    pub traversal_path: Vec<NodeId>,
    /// When the failure occurred.
    pub occurred_at: SystemTime,
}

impl DeadLetterRecord {
    /// Builds a record from an [`Error`] with no traversal path (lineage disabled).
    #[must_use]
    pub fn from_error(node_id: NodeId, error: &Error) -> Self {
        Self {
            node_id,
            kind: error_kind(error),
            message: error.to_string(),
            cause_chain: cause_chain(error),
            traversal_path: Vec::new(),
            occurred_at: SystemTime::now(),
        }
    }
}

fn error_kind(error: &Error) -> String {
    match error {
        Error::InputFault { .. } => "InputFault",
        Error::UserFault { .. } => "UserFault",
        Error::TimeoutFault { .. } => "TimeoutFault",
        Error::CancellationFault { .. } => "CancellationFault",
        Error::CircuitOpenFault { .. } => "CircuitOpenFault",
        Error::RetryExhaustedFault { .. } => "RetryExhaustedFault",
        Error::RestartBudgetExhaustedFault { .. } => "RestartBudgetExhaustedFault",
        Error::MaterializationCapFault { .. } => "MaterializationCapFault",
        Error::DeadLetterSinkFailed { .. } => "DeadLetterSinkFailed",
        Error::Canceled => "Canceled",
    }
    .to_string()
}

fn cause_chain(error: &Error) -> Vec<String> {
    let mut chain = Vec::new();
    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(error);
    while let Some(err) = source {
        chain.push(err.to_string());
        source = err.source();
    }
    chain
}

/// Destination for [`DeadLetterRecord`]s (spec §4.11). Failures of the sink itself escalate
/// to `FailPipeline` unless the caller has configured otherwise (spec §4.11 last sentence).
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Delivers one dead-letter record.
    async fn deliver(&self, record: DeadLetterRecord) -> Result<(), String>;
}

/// In-memory [`DeadLetterSink`] test double.
#[derive(Default)]
pub struct VecDeadLetterSink {
    records: parking_lot::Mutex<Vec<DeadLetterRecord>>,
}

impl VecDeadLetterSink {
    /// Builds an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots delivered records.
    #[must_use]
    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl DeadLetterSink for VecDeadLetterSink {
    async fn deliver(&self, record: DeadLetterRecord) -> Result<(), String> {
        self.records.lock().push(record);
        Ok(())
    }
}
