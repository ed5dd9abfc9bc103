// SPDX-License-Identifier: Apache-2.0

//! Errors for the data-pipe abstraction.

/// Errors that can occur while sending an item into a [`crate::pipe::PipeSender`].
#[derive(thiserror::Error, Debug)]
pub enum SendError<T> {
    /// The pipe's consumer has been dropped or `release()` has been called.
    #[error("pipe is closed, item could not be delivered")]
    Closed(T),
}

impl<T> SendError<T> {
    /// Returns the item that failed to send.
    pub fn into_inner(self) -> T {
        match self {
            Self::Closed(t) => t,
        }
    }
}

/// Errors surfaced while iterating a [`crate::pipe::DataPipe`].
#[derive(thiserror::Error, Debug)]
pub enum PipeError {
    /// The upstream producer surfaced an error mid-iteration.
    #[error("upstream iteration fault: {0}")]
    IterationFault(String),

    /// The pipe was iterated a second time; a data-pipe has exactly one consumer.
    #[error("data-pipe has already been consumed")]
    AlreadyConsumed,

    /// The root cancellation token fired while the pipe was being read.
    #[error("pipe read canceled")]
    Canceled,
}
