// SPDX-License-Identifier: Apache-2.0

//! External-collaborator interfaces: the storage-provider SPI (L13) and the database/queue
//! connector SPI (L14). NPipeline's core depends only on these traits; concrete connectors
//! (CSV, Excel, PostgreSQL, SQL Server, S3, SQS, ...) are out of scope for this crate (spec §1).

pub mod connector;
pub mod storage;
pub mod uri;

pub use connector::{
    CheckpointStore, Connection, ConnectorError, DbConnector, InMemoryCheckpoint, NoCheckpoint,
    Reader, Row, WriteStrategy, Writer,
};
pub use storage::{ListedItem, ObjectMetadata, ReadStream, StorageError, StorageProvider, WriteStream};
