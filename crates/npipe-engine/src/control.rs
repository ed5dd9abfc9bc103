// SPDX-License-Identifier: Apache-2.0

//! Control-plane messages fanned out to node runners alongside the root cancellation token
//! (spec §5 "a single root cancellation token fans out to every node runner").

use npipe_config::node::NodeId;

/// Out-of-band instruction delivered to a running node, distinct from normal data flow.
#[derive(Debug, Clone)]
pub enum NodeControlMsg {
    /// Stop accepting new input and drain in-flight items, then terminate (spec §4.10
    /// `DrainAndStop`).
    Drain,
    /// Restart the node from scratch, replaying materialized upstream input if available
    /// (spec §4.5 "per-node restart").
    Restart {
        /// Attempt number this restart represents, for logging.
        attempt: u32,
    },
}

/// The pipeline-wide signal the node runner reacts to in its per-item loop, combining the
/// root cancellation token with a per-node control channel.
pub struct ControlSurface {
    node_id: NodeId,
    cancellation: tokio_util::sync::CancellationToken,
    control_rx: tokio::sync::mpsc::Receiver<NodeControlMsg>,
}

impl ControlSurface {
    /// Builds a control surface for one node.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        cancellation: tokio_util::sync::CancellationToken,
        control_rx: tokio::sync::mpsc::Receiver<NodeControlMsg>,
    ) -> Self {
        Self {
            node_id,
            cancellation,
            control_rx,
        }
    }

    /// The node this surface belongs to.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The fanned-out root cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &tokio_util::sync::CancellationToken {
        &self.cancellation
    }

    /// Polls for the next control message without blocking indefinitely; returns `None` once
    /// the sender side has been dropped (normal teardown).
    pub async fn next_control(&mut self) -> Option<NodeControlMsg> {
        self.control_rx.recv().await
    }
}
