// SPDX-License-Identifier: Apache-2.0

//! The context handed to every user callback (spec §4.6 "hierarchical activity" tags plus
//! the per-operation timeout wrapper).

use crate::observability::ObservabilitySink;
use npipe_config::node::{NodeId, NodeKind};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Read-only handle passed to source/transform/join/aggregate/sink callbacks, carrying the
/// identity tags the observability surface needs (spec §4.6.4) and helpers for timeouts and
/// cancellation.
#[derive(Clone)]
pub struct EffectHandler {
    run_id: Uuid,
    node_id: NodeId,
    node_kind: NodeKind,
    node_name: Arc<str>,
    cancellation: tokio_util::sync::CancellationToken,
    observability: Arc<dyn ObservabilitySink>,
}

impl EffectHandler {
    /// Builds a handler for one node run.
    #[must_use]
    pub fn new(
        run_id: Uuid,
        node_id: NodeId,
        node_kind: NodeKind,
        node_name: Arc<str>,
        cancellation: tokio_util::sync::CancellationToken,
        observability: Arc<dyn ObservabilitySink>,
    ) -> Self {
        Self {
            run_id,
            node_id,
            node_kind,
            node_name,
            cancellation,
            observability,
        }
    }

    /// The current pipeline run's id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The node this callback is running for.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The node's declared kind.
    #[must_use]
    pub fn node_kind(&self) -> NodeKind {
        self.node_kind
    }

    /// The node's user-declared name, for log/event tags.
    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// The fanned-out root cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &tokio_util::sync::CancellationToken {
        &self.cancellation
    }

    /// The observability sink events should be reported to.
    #[must_use]
    pub fn observability(&self) -> &Arc<dyn ObservabilitySink> {
        &self.observability
    }

    /// Runs `fut` with a per-operation timeout; cancellation is also honored as a suspension
    /// point (spec §5 "Per-operation timeouts wrap user code").
    ///
    /// # Errors
    ///
    /// Returns `Err(())` on timeout or cancellation; the caller maps this to
    /// [`crate::error::Error::TimeoutFault`] or [`crate::error::Error::CancellationFault`].
    pub async fn with_timeout<T>(
        &self,
        timeout: Option<Duration>,
        fut: impl std::future::Future<Output = T>,
    ) -> Result<T, TimeoutOrCancel> {
        tokio::select! {
            biased;
            () = self.cancellation.cancelled() => Err(TimeoutOrCancel::Canceled),
            result = async {
                match timeout {
                    Some(d) => tokio::time::timeout(d, fut).await.map_err(|_| TimeoutOrCancel::TimedOut),
                    None => Ok(fut.await),
                }
            } => result,
        }
    }
}

/// Distinguishes why [`EffectHandler::with_timeout`] did not complete normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOrCancel {
    /// The configured per-operation timeout expired.
    TimedOut,
    /// The root cancellation token fired first.
    Canceled,
}
