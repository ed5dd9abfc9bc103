// SPDX-License-Identifier: Apache-2.0

//! Runtime error taxonomy for the pipeline engine (spec §4.5, §7).
//!
//! Build-time faults (`ValidationFault`/`WiringFault`/`GraphFault`) live in
//! [`npipe_config::Error`]; this module covers everything that can go wrong once a pipeline is
//! running.

use std::fmt;
use thiserror::Error;

/// Errors raised by the pipeline engine at runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// The upstream data-pipe surfaced an error mid-iteration (spec "InputFault").
    #[error("input fault on node `{node}`: {source}")]
    InputFault {
        /// The consuming node.
        node: String,
        /// The underlying data-pipe error.
        #[source]
        source: npipe_channel::PipeError,
    },

    /// The node's user callback returned an error (spec "UserFault").
    #[error("user callback fault on node `{node}`: {message}")]
    UserFault {
        /// The node whose callback failed.
        node: String,
        /// The error message from the callback.
        message: String,
    },

    /// A per-operation timeout expired (spec "TimeoutFault").
    #[error("operation on node `{node}` timed out after {elapsed_ms}ms")]
    TimeoutFault {
        /// The node whose operation timed out.
        node: String,
        /// Elapsed time before the timeout fired.
        elapsed_ms: u64,
    },

    /// The root cancellation token fired (spec "CancellationFault").
    #[error("operation on node `{node}` was canceled")]
    CancellationFault {
        /// The node that observed cancellation.
        node: String,
    },

    /// The circuit breaker for this node/resource is open (spec "CircuitOpenFault").
    #[error("circuit breaker for `{resource}` is open")]
    CircuitOpenFault {
        /// The resource key the breaker is tracking.
        resource: String,
    },

    /// Per-item retries were exhausted (spec "RetryExhaustedFault").
    #[error("retries exhausted on node `{node}` after {attempts} attempts: {last_error}")]
    RetryExhaustedFault {
        /// The node that exhausted retries.
        node: String,
        /// Total attempts made, including the first.
        attempts: u32,
        /// The last error observed.
        last_error: String,
    },

    /// The per-node restart budget was exhausted (spec "RestartBudgetExhaustedFault").
    #[error("restart budget exhausted for node `{node}` after {attempts} attempts")]
    RestartBudgetExhaustedFault {
        /// The node whose restart budget ran out.
        node: String,
        /// Restart attempts made.
        attempts: u32,
    },

    /// Materializing upstream input for restart exceeded its configured cap (spec
    /// "MaterializationCapFault").
    #[error("materialization cap of {cap} exceeded while restarting node `{node}`")]
    MaterializationCapFault {
        /// The node being restarted.
        node: String,
        /// The configured cap that was exceeded.
        cap: usize,
    },

    /// Delivery to the configured dead-letter sink itself failed.
    #[error("dead-letter sink failed for node `{node}`: {message}")]
    DeadLetterSinkFailed {
        /// The node whose failed item could not be dead-lettered.
        node: String,
        /// The underlying sink error.
        message: String,
    },

    /// The pipeline was explicitly canceled (a non-error terminal state at the top level, but
    /// still surfaced as an `Error` to callers awaiting an individual node).
    #[error("pipeline canceled")]
    Canceled,
}

impl Error {
    /// The node this error is attributed to, if any (the top-level `Canceled` variant has none).
    #[must_use]
    pub fn node(&self) -> Option<&str> {
        match self {
            Error::InputFault { node, .. }
            | Error::UserFault { node, .. }
            | Error::TimeoutFault { node, .. }
            | Error::CancellationFault { node }
            | Error::RetryExhaustedFault { node, .. }
            | Error::RestartBudgetExhaustedFault { node, .. }
            | Error::MaterializationCapFault { node, .. }
            | Error::DeadLetterSinkFailed { node, .. } => Some(node),
            Error::CircuitOpenFault { .. } | Error::Canceled => None,
        }
    }
}

/// Classifies whether an error is worth retrying (spec §4.5 "transient-error detector").
///
/// Node/user error types implement this so the retry engine can decide, without engine code
/// needing to know anything about a specific connector's error enum.
pub trait IsTransient {
    /// `true` if retrying the same operation again might succeed.
    fn is_transient(&self) -> bool;
}

impl IsTransient for Error {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TimeoutFault { .. } | Error::InputFault { .. } | Error::CircuitOpenFault { .. }
        )
    }
}

/// A boxed, type-erased user callback error, carried so `npipe-engine` never needs to be
/// generic over every possible node error type.
pub struct UserError {
    message: String,
    transient: bool,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl UserError {
    /// Builds a permanent (non-retryable) user error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
            source: None,
        }
    }

    /// Builds a transient (retryable) user error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
            source: None,
        }
    }

    /// Attaches a source error for display/debugging.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IsTransient for UserError {
    fn is_transient(&self) -> bool {
        self.transient
    }
}

impl fmt::Debug for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserError")
            .field("message", &self.message)
            .field("transient", &self.transient)
            .finish()
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for UserError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}
