//! Object store abstraction consumed by every other component.
//!
//! A store holds three kinds of objects: encrypted backup artifacts, catalog records
//! under `catalog/`, and small lease objects under `locks/`. The catalog and the
//! leases depend on [`ObjectStore::put_conditional`] being a real compare-and-swap.

mod local;
mod memory;
#[cfg(feature = "aws")]
mod s3;

pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;
#[cfg(feature = "aws")]
pub use s3::{S3ObjectStore, S3StoreConfig};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Owned, sendable byte stream used for uploads and downloads
pub type ByteReader = Pin<Box<dyn AsyncRead + Send>>;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by object store backends
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Network failure or throttling; retrying may succeed
    #[error("transient store failure: {0}")]
    Transient(String),

    /// Invalid key, auth failure or other non-retryable condition
    #[error("permanent store failure: {0}")]
    Permanent(String),

    /// Key does not exist
    #[error("object not found: {0}")]
    NotFound(String),

    /// Conditional write lost the race
    #[error("precondition failed for {0}")]
    PreconditionFailed(String),
}

impl StoreError {
    /// Whether the failure is worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(e.to_string()),
            std::io::ErrorKind::PermissionDenied => StoreError::Permanent(e.to_string()),
            _ => StoreError::Transient(e.to_string()),
        }
    }
}

/// Cost/latency class of stored objects, hottest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageClass {
    /// Immediate access
    Standard,
    /// Cheaper storage, per-retrieval charge
    #[serde(rename = "STANDARD_IA", alias = "INFREQUENT_ACCESS")]
    InfrequentAccess,
    /// Archive; retrieval takes minutes to hours
    Glacier,
    /// Coldest archive
    DeepArchive,
}

impl StorageClass {
    /// Canonical S3-style name
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageClass::Standard => "STANDARD",
            StorageClass::InfrequentAccess => "STANDARD_IA",
            StorageClass::Glacier => "GLACIER",
            StorageClass::DeepArchive => "DEEP_ARCHIVE",
        }
    }

    /// Archived objects cannot be read or copied until restored, so a copy-based
    /// re-class out of them fails with InvalidObjectState.
    pub fn is_archived(&self) -> bool {
        matches!(self, StorageClass::Glacier | StorageClass::DeepArchive)
    }
}

impl Default for StorageClass {
    fn default() -> Self {
        StorageClass::Standard
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageClass {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STANDARD" => Ok(StorageClass::Standard),
            "STANDARD_IA" | "INFREQUENT_ACCESS" => Ok(StorageClass::InfrequentAccess),
            "GLACIER" => Ok(StorageClass::Glacier),
            "DEEP_ARCHIVE" => Ok(StorageClass::DeepArchive),
            other => Err(StoreError::Permanent(format!("unknown storage class {}", other))),
        }
    }
}

/// Metadata attached to an object at upload time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// MIME type of the payload
    pub content_type: Option<String>,
    /// Current storage class
    #[serde(default)]
    pub storage_class: StorageClass,
    /// Ask the backend to encrypt at rest
    #[serde(default)]
    pub server_side_encryption: bool,
    /// Free-form user metadata
    #[serde(default)]
    pub user: BTreeMap<String, String>,
}

impl ObjectMetadata {
    /// JSON document metadata with server-side encryption requested
    pub fn json() -> Self {
        Self {
            content_type: Some("application/json".to_string()),
            server_side_encryption: true,
            ..Default::default()
        }
    }

    /// Opaque binary payload with server-side encryption requested
    pub fn binary() -> Self {
        Self {
            content_type: Some("application/octet-stream".to_string()),
            server_side_encryption: true,
            ..Default::default()
        }
    }

    /// Add a user metadata entry
    pub fn with_user(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user.insert(key.into(), value.into());
        self
    }
}

/// What `head` reports about an existing object
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    /// Object key
    pub key: String,
    /// Stored size in bytes
    pub size_bytes: u64,
    /// Opaque version token usable with [`Precondition::IfMatch`]
    pub version: String,
    /// Last write time
    pub last_modified: DateTime<Utc>,
    /// Upload metadata
    pub metadata: ObjectMetadata,
}

/// Receipt for a completed write
#[derive(Debug, Clone)]
pub struct PutReceipt {
    /// Bytes stored
    pub size_bytes: u64,
    /// Version token of the new object
    pub version: String,
}

/// Condition for a compare-and-swap write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Only create; fail if the key exists
    IfAbsent,
    /// Only overwrite the given version
    IfMatch(String),
}

/// Durable, versioned blob store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload the whole stream; the key becomes visible only once the upload completed.
    async fn put(&self, key: &str, body: ByteReader, metadata: ObjectMetadata) -> StoreResult<PutReceipt>;

    /// Small compare-and-swap write used for catalog records and leases.
    async fn put_conditional(
        &self,
        key: &str,
        body: Bytes,
        metadata: ObjectMetadata,
        precondition: Precondition,
    ) -> StoreResult<PutReceipt>;

    /// Open an object for reading; `NotFound` if absent.
    async fn get(&self, key: &str) -> StoreResult<(ByteReader, ObjectMetadata)>;

    /// Describe an object without reading it.
    async fn head(&self, key: &str) -> StoreResult<Option<ObjectInfo>>;

    /// Keys under `prefix` in lexicographic order.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Remove an object; deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Server-side copy.
    async fn copy(&self, source: &str, destination: &str) -> StoreResult<()>;

    /// Request a storage-class change; may complete asynchronously.
    async fn transition(&self, key: &str, class: StorageClass) -> StoreResult<()>;

    /// Read a small object fully into memory.
    async fn get_bytes(&self, key: &str) -> StoreResult<(Bytes, ObjectMetadata)> {
        let (mut reader, metadata) = self.get(key).await?;
        let mut buffer = Vec::new();
        reader
            .read_to_end(&mut buffer)
            .await
            .map_err(|e| StoreError::Transient(format!("Failed to read {}: {}", key, e)))?;
        Ok((Bytes::from(buffer), metadata))
    }
}

/// Reject keys no backend can store safely.
pub fn validate_key(key: &str) -> StoreResult<()> {
    let invalid = key.is_empty()
        || key.len() > 1024
        || key.starts_with('/')
        || key.ends_with('/')
        || key.contains('\\')
        || key.contains("//")
        || key.split('/').any(|segment| segment == "." || segment == "..")
        || key.chars().any(|c| c.is_control());

    if invalid {
        Err(StoreError::Permanent(format!("invalid object key {:?}", key)))
    } else {
        Ok(())
    }
}

/// Inclusive byte ranges covering `size` bytes in `part_size` steps, for server-side
/// multipart copies.
#[cfg_attr(not(feature = "aws"), allow(dead_code))]
pub(crate) fn copy_part_ranges(size: u64, part_size: u64) -> Vec<(u64, u64)> {
    let part_size = part_size.max(1);
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < size {
        let end = (start + part_size).min(size) - 1;
        ranges.push((start, end));
        start = end + 1;
    }
    ranges
}

/// Wrap an in-memory buffer as a [`ByteReader`].
pub fn reader_from_bytes(data: impl Into<Bytes>) -> ByteReader {
    Box::pin(std::io::Cursor::new(data.into()))
}
