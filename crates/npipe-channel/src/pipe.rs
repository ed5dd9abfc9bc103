// SPDX-License-Identifier: Apache-2.0

//! The data-pipe: a lazy, single-consumer typed sequence of items flowing between two nodes.
//!
//! A data-pipe comes in two variants (spec L1): a *streaming* pipe, backed by a bounded
//! `tokio::mpsc` channel so a slow consumer applies backpressure to its producer, and a
//! *materialized* pipe, a finite in-memory sequence kept around for resilient-restart replay
//! (spec §4.5 "restart requires materialized upstream input").
//!
//! Ownership is single-consumer: calling [`DataPipe::iterate`] twice returns
//! [`PipeError::AlreadyConsumed`] on the second call.

use crate::error::{PipeError, SendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The producer-side handle of a streaming pipe.
pub struct PipeSender<T> {
    inner: tokio::sync::mpsc::Sender<T>,
    released: Arc<AtomicBool>,
}

impl<T> Clone for PipeSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            released: self.released.clone(),
        }
    }
}

impl<T> PipeSender<T> {
    /// Sends an item, suspending the caller while the consumer is not draining
    /// (backpressure propagation, spec §4.1).
    pub async fn send(&self, item: T) -> Result<(), SendError<T>> {
        self.inner
            .send(item)
            .await
            .map_err(|e| SendError::Closed(e.0))
    }

    /// True once [`DataPipe::release`] has been called by the consumer.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// A single-consumer lazy sequence of items, streaming or materialized.
///
/// The producing node owns a pipe and is responsible for creating it; the one permitted
/// consumer calls [`DataPipe::iterate`] exactly once. The `streamName` carried alongside for
/// diagnostics is the pipe's [`DataPipe::name`].
pub enum DataPipe<T> {
    /// Pull-based, backpressure-propagating sequence.
    Streaming {
        name: String,
        receiver: Option<tokio::sync::mpsc::Receiver<T>>,
        released: Arc<AtomicBool>,
    },
    /// Finite in-memory sequence, replayable for resilient-restart.
    Materialized {
        name: String,
        items: Option<Vec<T>>,
        released: Arc<AtomicBool>,
    },
}

impl<T> DataPipe<T> {
    /// Creates a bounded streaming pipe and its producer-side sender.
    #[must_use]
    pub fn streaming(name: impl Into<String>, capacity: usize) -> (PipeSender<T>, Self) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity.max(1));
        let released = Arc::new(AtomicBool::new(false));
        (
            PipeSender {
                inner: tx,
                released: released.clone(),
            },
            DataPipe::Streaming {
                name: name.into(),
                receiver: Some(rx),
                released,
            },
        )
    }

    /// Creates a pipe over an already-materialized, finite sequence.
    #[must_use]
    pub fn materialized(name: impl Into<String>, items: Vec<T>) -> Self {
        DataPipe::Materialized {
            name: name.into(),
            items: Some(items),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The pipe's diagnostic stream name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            DataPipe::Streaming { name, .. } | DataPipe::Materialized { name, .. } => name,
        }
    }

    /// Consumes the pipe, returning the lazy sequence of items it carries.
    ///
    /// `cancellation` is polled between items; when it fires, iteration stops and any
    /// in-flight read resolves to [`PipeError::Canceled`]. Calling this a second time on the
    /// same pipe is a build/runtime bug and returns [`PipeError::AlreadyConsumed`].
    pub fn iterate(&mut self, cancellation: CancellationToken) -> Result<PipeIter<T>, PipeError> {
        match self {
            DataPipe::Streaming {
                receiver, released, ..
            } => {
                let receiver = receiver.take().ok_or(PipeError::AlreadyConsumed)?;
                Ok(PipeIter::Streaming {
                    receiver,
                    released: released.clone(),
                    cancellation,
                })
            }
            DataPipe::Materialized {
                items, released, ..
            } => {
                let items = items.take().ok_or(PipeError::AlreadyConsumed)?;
                Ok(PipeIter::Materialized {
                    items: items.into_iter(),
                    released: released.clone(),
                    cancellation,
                })
            }
        }
    }

    /// Idempotently releases resources backing the pipe (closes the channel / drops the
    /// buffered sequence) without consuming it for iteration.
    pub fn release(&mut self) {
        match self {
            DataPipe::Streaming {
                receiver, released, ..
            } => {
                released.store(true, Ordering::Release);
                *receiver = None;
            }
            DataPipe::Materialized {
                items, released, ..
            } => {
                released.store(true, Ordering::Release);
                *items = None;
            }
        }
    }
}

/// The lazy sequence produced by [`DataPipe::iterate`].
pub enum PipeIter<T> {
    /// Backed by the streaming channel receiver.
    Streaming {
        receiver: tokio::sync::mpsc::Receiver<T>,
        released: Arc<AtomicBool>,
        cancellation: CancellationToken,
    },
    /// Backed by an owned `Vec<T>` iterator.
    Materialized {
        items: std::vec::IntoIter<T>,
        released: Arc<AtomicBool>,
        cancellation: CancellationToken,
    },
}

impl<T> PipeIter<T> {
    /// Pulls the next item, or `None` at end of input.
    pub async fn next(&mut self) -> Result<Option<T>, PipeError> {
        match self {
            PipeIter::Streaming {
                receiver,
                cancellation,
                ..
            } => {
                tokio::select! {
                    biased;
                    () = cancellation.cancelled() => Err(PipeError::Canceled),
                    item = receiver.recv() => Ok(item),
                }
            }
            PipeIter::Materialized {
                items,
                cancellation,
                ..
            } => {
                if cancellation.is_cancelled() {
                    return Err(PipeError::Canceled);
                }
                Ok(items.next())
            }
        }
    }
}

impl<T> Drop for PipeIter<T> {
    fn drop(&mut self) {
        let released = match self {
            PipeIter::Streaming { released, .. } | PipeIter::Materialized { released, .. } => {
                released
            }
        };
        released.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn streaming_pipe_round_trips_items() {
        let (tx, mut pipe) = DataPipe::streaming("edge:a->b", 4);
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        drop(tx);

        let mut iter = pipe.iterate(CancellationToken::new()).unwrap();
        assert_eq!(iter.next().await.unwrap(), Some(1));
        assert_eq!(iter.next().await.unwrap(), Some(2));
        assert_eq!(iter.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn materialized_pipe_replays_finite_sequence() {
        let mut pipe = DataPipe::materialized("edge:a->b", vec![10, 20, 30]);
        let mut iter = pipe.iterate(CancellationToken::new()).unwrap();
        let mut collected = Vec::new();
        while let Some(item) = iter.next().await.unwrap() {
            collected.push(item);
        }
        assert_eq!(collected, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn double_iteration_is_an_error() {
        let mut pipe = DataPipe::<i32>::materialized("edge:a->b", vec![1]);
        let _first = pipe.iterate(CancellationToken::new()).unwrap();
        let second = pipe.iterate(CancellationToken::new());
        assert!(matches!(second, Err(PipeError::AlreadyConsumed)));
    }

    #[tokio::test]
    async fn cancellation_stops_iteration() {
        let (_tx, mut pipe) = DataPipe::<i32>::streaming("edge:a->b", 1);
        let token = CancellationToken::new();
        let mut iter = pipe.iterate(token.clone()).unwrap();
        token.cancel();
        let result = iter.next().await;
        assert!(matches!(result, Err(PipeError::Canceled)));
    }
}
