// SPDX-License-Identifier: Apache-2.0

//! Database/queue connector SPI (spec §4.14, external contract).

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

// Re-exported so downstream connector crates don't need a direct `tokio-util` dependency
// just to build a `CancellationToken`.
pub use tokio_util::sync::CancellationToken as Cancellation;

/// Errors surfaced by connectors.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// A read or write against an established connection failed.
    #[error("connector I/O error: {0}")]
    Io(String),

    /// The connector's checkpoint store failed to persist or restore state.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

/// An established connection handed to a reader or writer.
pub trait Connection: Send {}

/// Tabular row access for database sources, with both name- and ordinal-based retrieval and
/// nullability checks (spec §4.14 "Readers expose tabular row access").
pub trait Row: Send {
    /// Number of columns in this row.
    fn column_count(&self) -> usize;

    /// The column name at `ordinal`, if the source reports one.
    fn column_name(&self, ordinal: usize) -> Option<&str>;

    /// Whether the value at `ordinal` is SQL NULL.
    fn is_null(&self, ordinal: usize) -> bool;

    /// Reads the value at `ordinal` as a UTF-8 string.
    fn get_string(&self, ordinal: usize) -> Result<String, ConnectorError>;

    /// Reads the value at `ordinal` as a 64-bit integer.
    fn get_i64(&self, ordinal: usize) -> Result<i64, ConnectorError>;

    /// Reads the value at `ordinal` as a 64-bit float.
    fn get_f64(&self, ordinal: usize) -> Result<f64, ConnectorError>;

    /// Resolves `name` to its ordinal.
    fn ordinal_of(&self, name: &str) -> Option<usize>;
}

/// A source-side reader over an established [`Connection`].
#[async_trait]
pub trait Reader: Send {
    /// Fetches the next row, or `None` at end of result set.
    async fn next_row(&mut self) -> Result<Option<Box<dyn Row>>, ConnectorError>;
}

/// A sink-side writer over an established [`Connection`].
#[async_trait]
pub trait Writer: Send {
    /// Appends `rows` to the writer's pending batch.
    async fn write_batch(&mut self, rows: Vec<Box<dyn Row>>) -> Result<(), ConnectorError>;

    /// Flushes any buffered rows to the underlying store.
    async fn flush(&mut self) -> Result<(), ConnectorError>;
}

/// How a sink writer batches outgoing rows (spec §4.14 "Write strategies").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    /// Issue one statement per record.
    PerRow,
    /// Buffer `size` records per bulk statement.
    Batch(usize),
}

/// Opaque, connector-owned checkpoint persistence (spec §4.14 "Checkpoint strategies").
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persists an opaque checkpoint blob for `node_id`.
    async fn save(&self, node_id: &str, blob: Vec<u8>) -> Result<(), ConnectorError>;

    /// Restores the most recently saved checkpoint blob for `node_id`, if any.
    async fn load(&self, node_id: &str) -> Result<Option<Vec<u8>>, ConnectorError>;
}

/// No persistence; every run starts from scratch.
pub struct NoCheckpoint;

#[async_trait]
impl CheckpointStore for NoCheckpoint {
    async fn save(&self, _node_id: &str, _blob: Vec<u8>) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn load(&self, _node_id: &str) -> Result<Option<Vec<u8>>, ConnectorError> {
        Ok(None)
    }
}

/// In-process checkpoint storage, lost on restart; useful for tests and single-run pipelines.
#[derive(Default)]
pub struct InMemoryCheckpoint {
    blobs: parking_lot::Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpoint {
    async fn save(&self, node_id: &str, blob: Vec<u8>) -> Result<(), ConnectorError> {
        let _ = self.blobs.lock().insert(node_id.to_string(), blob);
        Ok(())
    }

    async fn load(&self, node_id: &str) -> Result<Option<Vec<u8>>, ConnectorError> {
        Ok(self.blobs.lock().get(node_id).cloned())
    }
}

/// A database/queue connector: establishes connections and hands out readers or writers.
#[async_trait]
pub trait DbConnector: Send + Sync {
    /// The concrete connection type this connector establishes.
    type Conn: Connection;

    /// Opens a connection, honoring `cancellation`.
    async fn open_connection(
        &self,
        cancellation: CancellationToken,
    ) -> Result<Self::Conn, ConnectorError>;

    /// Creates a source-side reader over `connection`.
    async fn execute_reader(
        &self,
        connection: Self::Conn,
        query: &str,
    ) -> Result<Box<dyn Reader>, ConnectorError>;

    /// Creates a sink-side writer over `connection` targeting `table`.
    async fn create_writer(
        &self,
        connection: Self::Conn,
        table: &str,
        strategy: WriteStrategy,
    ) -> Result<Box<dyn Writer>, ConnectorError>;
}
