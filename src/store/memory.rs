use super::{
    reader_from_bytes, validate_key, ByteReader, ObjectInfo, ObjectMetadata, ObjectStore, Precondition,
    PutReceipt, StorageClass, StoreError, StoreResult,
};
use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    metadata: ObjectMetadata,
    version: u64,
    last_modified: DateTime<Utc>,
}

/// In-memory object store
///
/// Conditional writes go through the map's entry API, so they are atomic with respect
/// to every other operation on the same key.
#[derive(Clone)]
pub struct MemoryObjectStore {
    objects: Arc<DashMap<String, StoredObject>>,
    next_version: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
}

impl MemoryObjectStore {
    /// Create an empty store on system time
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store stamping objects with the given clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            objects: Arc::new(DashMap::new()),
            next_version: Arc::new(AtomicU64::new(1)),
            clock,
        }
    }

    /// Number of stored objects (test helper)
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Overwrite stored bytes in place, keeping metadata (corruption tests)
    pub fn tamper(&self, key: &str, data: impl Into<Bytes>) -> bool {
        match self.objects.get_mut(key) {
            Some(mut object) => {
                object.data = data.into();
                true
            }
            None => false,
        }
    }

    fn stamp(&self, data: Bytes, metadata: ObjectMetadata) -> StoredObject {
        StoredObject {
            data,
            metadata,
            version: self.next_version.fetch_add(1, Ordering::SeqCst),
            last_modified: self.clock.now(),
        }
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, mut body: ByteReader, metadata: ObjectMetadata) -> StoreResult<PutReceipt> {
        validate_key(key)?;

        // Buffer first; the key only appears once the whole body was read
        let mut buffer = Vec::new();
        body.read_to_end(&mut buffer)
            .await
            .map_err(|e| StoreError::Transient(format!("Failed to read upload body for {}: {}", key, e)))?;

        let object = self.stamp(Bytes::from(buffer), metadata);
        let receipt = PutReceipt {
            size_bytes: object.data.len() as u64,
            version: object.version.to_string(),
        };
        self.objects.insert(key.to_string(), object);
        Ok(receipt)
    }

    async fn put_conditional(
        &self,
        key: &str,
        body: Bytes,
        metadata: ObjectMetadata,
        precondition: Precondition,
    ) -> StoreResult<PutReceipt> {
        validate_key(key)?;

        match self.objects.entry(key.to_string()) {
            Entry::Occupied(mut existing) => match precondition {
                Precondition::IfMatch(ref version) if existing.get().version.to_string() == *version => {
                    let object = self.stamp(body, metadata);
                    let receipt = PutReceipt {
                        size_bytes: object.data.len() as u64,
                        version: object.version.to_string(),
                    };
                    existing.insert(object);
                    Ok(receipt)
                }
                _ => Err(StoreError::PreconditionFailed(key.to_string())),
            },
            Entry::Vacant(slot) => match precondition {
                Precondition::IfAbsent => {
                    let object = self.stamp(body, metadata);
                    let receipt = PutReceipt {
                        size_bytes: object.data.len() as u64,
                        version: object.version.to_string(),
                    };
                    slot.insert(object);
                    Ok(receipt)
                }
                Precondition::IfMatch(_) => Err(StoreError::PreconditionFailed(key.to_string())),
            },
        }
    }

    async fn get(&self, key: &str) -> StoreResult<(ByteReader, ObjectMetadata)> {
        let object = self
            .objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Ok((reader_from_bytes(object.data), object.metadata))
    }

    async fn head(&self, key: &str) -> StoreResult<Option<ObjectInfo>> {
        Ok(self.objects.get(key).map(|entry| ObjectInfo {
            key: key.to_string(),
            size_bytes: entry.data.len() as u64,
            version: entry.version.to_string(),
            last_modified: entry.last_modified,
            metadata: entry.metadata.clone(),
        }))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.objects.remove(key);
        Ok(())
    }

    async fn copy(&self, source: &str, destination: &str) -> StoreResult<()> {
        validate_key(destination)?;
        let object = self
            .objects
            .get(source)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(source.to_string()))?;
        if object.metadata.storage_class.is_archived() {
            return Err(archived(source, object.metadata.storage_class));
        }
        let copied = self.stamp(object.data, object.metadata);
        self.objects.insert(destination.to_string(), copied);
        Ok(())
    }

    async fn transition(&self, key: &str, class: StorageClass) -> StoreResult<()> {
        match self.objects.get_mut(key) {
            Some(object) if object.metadata.storage_class.is_archived() && object.metadata.storage_class != class => {
                Err(archived(key, object.metadata.storage_class))
            }
            Some(mut object) => {
                object.metadata.storage_class = class;
                Ok(())
            }
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }
}

/// Same refusal S3 gives for a copy out of an archive class
fn archived(key: &str, class: StorageClass) -> StoreError {
    StoreError::Permanent(format!("InvalidObjectState: {} is archived in {}", key, class))
}
