// SPDX-License-Identifier: Apache-2.0

//! Storage-provider SPI (spec §4.13, external contract).
//!
//! NPipeline's core never reads or writes storage directly; concrete connectors (CSV, Excel,
//! PostgreSQL, SQL Server, S3, SQS, ...) implement [`StorageProvider`] and are selected by
//! [`StorageProvider::can_handle`] against a parsed [`url::Url`].

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use url::Url;

/// Errors a storage provider may surface.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No registered provider claims this URI's scheme.
    #[error("no storage provider registered for scheme `{scheme}`")]
    UnsupportedScheme {
        /// The offending scheme.
        scheme: String,
    },

    /// The provider-specific I/O operation failed.
    #[error("storage I/O error: {0}")]
    Io(String),

    /// The URI or its scheme-specific parameters were invalid.
    #[error("invalid storage URI: {0}")]
    InvalidUri(String),
}

/// Metadata about a stored object, when a provider can report it.
#[derive(Debug, Clone, Default)]
pub struct ObjectMetadata {
    /// Size in bytes, if known.
    pub size: Option<u64>,
    /// Last-modified timestamp, as an RFC 3339 string (providers own their own clock/format).
    pub last_modified: Option<String>,
    /// Entity tag, if the backing store exposes one.
    pub etag: Option<String>,
    /// MIME content type, if known.
    pub content_type: Option<String>,
    /// Provider-specific extra metadata.
    pub custom: HashMap<String, String>,
}

/// A byte-oriented read stream returned by [`StorageProvider::open_read`].
#[async_trait]
pub trait ReadStream: Send {
    /// Reads up to `buf.len()` bytes, returning the number of bytes read (`0` at EOF).
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError>;
}

/// A byte-oriented write stream returned by [`StorageProvider::open_write`].
#[async_trait]
pub trait WriteStream: Send {
    /// Writes `buf` in full.
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), StorageError>;

    /// Flushes and finalizes the write (e.g. completes a multipart upload).
    async fn finish(&mut self) -> Result<(), StorageError>;
}

/// One entry returned while listing a URI prefix.
#[derive(Debug, Clone)]
pub struct ListedItem {
    /// The item's full URI.
    pub uri: Url,
    /// Metadata, when cheaply available during listing.
    pub metadata: Option<ObjectMetadata>,
}

/// The interface a concrete storage connector implements (spec §4.13).
///
/// Scheme-specific parameters are passed through verbatim from the URI's query string to the
/// provider; NPipeline's core does not interpret them (spec §6 "URI format").
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Whether this provider handles `uri`'s scheme (and, if relevant, host).
    fn can_handle(&self, uri: &Url) -> bool;

    /// Opens `uri` for reading.
    async fn open_read(&self, uri: &Url) -> Result<Box<dyn ReadStream>, StorageError>;

    /// Opens `uri` for writing.
    async fn open_write(&self, uri: &Url) -> Result<Box<dyn WriteStream>, StorageError>;

    /// Whether `uri` currently exists.
    async fn exists(&self, uri: &Url) -> Result<bool, StorageError>;

    /// Lists items under `uri_prefix`, recursing into "directories" when `recursive` is set.
    async fn list(
        &self,
        uri_prefix: &Url,
        recursive: bool,
    ) -> Result<Vec<ListedItem>, StorageError>;

    /// Returns metadata for `uri`, when the backing store can report it cheaply.
    async fn metadata(&self, _uri: &Url) -> Result<Option<ObjectMetadata>, StorageError> {
        Ok(None)
    }
}

/// Dispatches to the first registered [`StorageProvider`] that claims a URI.
#[derive(Default)]
pub struct StorageProviderRegistry {
    providers: Vec<Box<dyn StorageProvider>>,
}

impl StorageProviderRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Registers a provider; later registrations are preferred on scheme overlap.
    pub fn register(&mut self, provider: Box<dyn StorageProvider>) {
        self.providers.push(provider);
    }

    /// Finds the provider that claims `uri`.
    pub fn resolve(&self, uri: &Url) -> Result<&dyn StorageProvider, StorageError> {
        self.providers
            .iter()
            .rev()
            .find(|p| p.can_handle(uri))
            .map(AsRef::as_ref)
            .ok_or_else(|| StorageError::UnsupportedScheme {
                scheme: uri.scheme().to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopProvider {
        scheme: &'static str,
    }

    #[async_trait]
    impl StorageProvider for NoopProvider {
        fn can_handle(&self, uri: &Url) -> bool {
            uri.scheme() == self.scheme
        }

        async fn open_read(&self, _uri: &Url) -> Result<Box<dyn ReadStream>, StorageError> {
            Err(StorageError::Io("not implemented".into()))
        }

        async fn open_write(&self, _uri: &Url) -> Result<Box<dyn WriteStream>, StorageError> {
            Err(StorageError::Io("not implemented".into()))
        }

        async fn exists(&self, _uri: &Url) -> Result<bool, StorageError> {
            Ok(false)
        }

        async fn list(
            &self,
            _uri_prefix: &Url,
            _recursive: bool,
        ) -> Result<Vec<ListedItem>, StorageError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn registry_resolves_by_scheme() {
        let mut registry = StorageProviderRegistry::new();
        registry.register(Box::new(NoopProvider { scheme: "s3" }));
        let uri = Url::parse("s3://bucket/key?region=us-west-2").unwrap();
        assert!(registry.resolve(&uri).is_ok());

        let other = Url::parse("sqs://queue/name").unwrap();
        assert!(matches!(
            registry.resolve(&other),
            Err(StorageError::UnsupportedScheme { .. })
        ));
    }
}
