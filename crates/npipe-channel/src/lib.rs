// SPDX-License-Identifier: Apache-2.0

//! The data-pipe abstraction used to carry items between NPipeline nodes.
//!
//! A [`pipe::DataPipe`] is a lazy, single-consumer sequence: streaming pipes propagate
//! backpressure through a bounded channel, materialized pipes replay a finite in-memory
//! sequence for resilient-restart scenarios.

pub mod error;
pub mod pipe;

pub use error::{PipeError, SendError};
pub use pipe::{DataPipe, PipeIter, PipeSender};
