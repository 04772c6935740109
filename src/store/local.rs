// Local filesystem object store - single-host deployments and integration tests

use super::{
    validate_key, ByteReader, ObjectInfo, ObjectMetadata, ObjectStore, Precondition, PutReceipt, StorageClass,
    StoreError, StoreResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sidecar {
    version: String,
    metadata: ObjectMetadata,
}

/// Upload file under `.incoming/`, removed when dropped unless it was moved into place
struct Staged(PathBuf);

impl Staged {
    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for Staged {
    fn drop(&mut self) {
        // NotFound once promoted
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Object store rooted at a local directory
///
/// Layout: `objects/<key>` holds payloads, `meta/<key>.json` holds metadata and the
/// version token, and `.incoming/` holds uploads until they are renamed into place.
/// `IfAbsent` writes are atomic across processes (hard link onto the final path);
/// `IfMatch` writes are serialized within this process only.
pub struct LocalObjectStore {
    root: PathBuf,
    cas_lock: Mutex<()>,
}

impl LocalObjectStore {
    /// Create a store rooted at `directory`
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            root: directory.into(),
            cas_lock: Mutex::new(()),
        }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join("objects").join(key)
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        self.root.join("meta").join(format!("{}.json", key))
    }

    fn incoming_path(&self) -> PathBuf {
        self.root.join(".incoming").join(Uuid::new_v4().to_string())
    }

    async fn ensure_parent(path: &Path) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Transient(format!("Failed to create directory {:?}: {}", parent, e)))?;
        }
        Ok(())
    }

    async fn stage_stream(&self, body: &mut ByteReader) -> StoreResult<(Staged, u64)> {
        let staging = Staged(self.incoming_path());
        Self::ensure_parent(staging.path()).await?;

        let mut file = fs::File::create(staging.path())
            .await
            .map_err(|e| StoreError::Transient(format!("Failed to create staging file: {}", e)))?;
        let written = tokio::io::copy(body, &mut file)
            .await
            .map_err(|e| StoreError::Transient(format!("Failed to write upload: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::Transient(format!("Failed to sync upload: {}", e)))?;
        Ok((staging, written))
    }

    async fn stage_bytes(&self, body: &[u8]) -> StoreResult<Staged> {
        let staging = Staged(self.incoming_path());
        Self::ensure_parent(staging.path()).await?;
        let mut file = fs::File::create(staging.path())
            .await
            .map_err(|e| StoreError::Transient(format!("Failed to create staging file: {}", e)))?;
        file.write_all(body)
            .await
            .map_err(|e| StoreError::Transient(format!("Failed to write staging file: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::Transient(format!("Failed to sync staging file: {}", e)))?;
        Ok(staging)
    }

    async fn write_sidecar(&self, key: &str, metadata: &ObjectMetadata, version: &str) -> StoreResult<()> {
        let path = self.sidecar_path(key);
        Self::ensure_parent(&path).await?;
        let sidecar = Sidecar {
            version: version.to_string(),
            metadata: metadata.clone(),
        };
        let json = serde_json::to_vec_pretty(&sidecar)
            .map_err(|e| StoreError::Permanent(format!("Failed to serialize metadata: {}", e)))?;
        fs::write(&path, json)
            .await
            .map_err(|e| StoreError::Transient(format!("Failed to write metadata for {}: {}", key, e)))
    }

    async fn read_sidecar(&self, key: &str) -> Option<Sidecar> {
        let raw = fs::read(self.sidecar_path(key)).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }

    async fn promote(&self, staging: &Staged, key: &str) -> StoreResult<()> {
        let target = self.object_path(key);
        Self::ensure_parent(&target).await?;
        fs::rename(staging.path(), &target)
            .await
            .map_err(|e| StoreError::Transient(format!("Failed to move upload into {}: {}", key, e)))
    }

    async fn walk(&self, dir: PathBuf, keys: &mut Vec<String>) -> StoreResult<()> {
        let objects_root = self.root.join("objects");
        let mut pending = vec![dir];

        while let Some(current) = pending.pop() {
            let mut entries = match fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::Transient(format!("Failed to read directory: {}", e))),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::Transient(format!("Failed to read directory entry: {}", e)))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StoreError::Transient(format!("Failed to stat {:?}: {}", path, e)))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&objects_root) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, mut body: ByteReader, metadata: ObjectMetadata) -> StoreResult<PutReceipt> {
        validate_key(key)?;
        let (staging, size_bytes) = self.stage_stream(&mut body).await?;
        let version = Uuid::new_v4().to_string();

        self.write_sidecar(key, &metadata, &version).await?;
        self.promote(&staging, key).await?;

        debug!(key = %key, size_bytes, "stored object");
        Ok(PutReceipt { size_bytes, version })
    }

    async fn put_conditional(
        &self,
        key: &str,
        body: Bytes,
        metadata: ObjectMetadata,
        precondition: Precondition,
    ) -> StoreResult<PutReceipt> {
        validate_key(key)?;
        let _guard = self.cas_lock.lock().await;
        let staging = self.stage_bytes(&body).await?;
        let version = Uuid::new_v4().to_string();
        let target = self.object_path(key);

        match precondition {
            Precondition::IfAbsent => {
                Self::ensure_parent(&target).await?;
                let linked = fs::hard_link(staging.path(), &target).await;
                drop(staging);
                match linked {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                        return Err(StoreError::PreconditionFailed(key.to_string()));
                    }
                    Err(e) => return Err(StoreError::Transient(format!("Failed to create {}: {}", key, e))),
                }
                self.write_sidecar(key, &metadata, &version).await?;
            }
            Precondition::IfMatch(expected) => {
                let current = self.read_sidecar(key).await.map(|s| s.version);
                if current.as_deref() != Some(expected.as_str()) || !target.exists() {
                    return Err(StoreError::PreconditionFailed(key.to_string()));
                }
                self.write_sidecar(key, &metadata, &version).await?;
                self.promote(&staging, key).await?;
            }
        }

        Ok(PutReceipt {
            size_bytes: body.len() as u64,
            version,
        })
    }

    async fn get(&self, key: &str) -> StoreResult<(ByteReader, ObjectMetadata)> {
        validate_key(key)?;
        let file = match fs::File::open(self.object_path(key)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(StoreError::NotFound(key.to_string())),
            Err(e) => return Err(StoreError::Transient(format!("Failed to open {}: {}", key, e))),
        };
        let metadata = self.read_sidecar(key).await.map(|s| s.metadata).unwrap_or_default();
        Ok((Box::pin(file), metadata))
    }

    async fn head(&self, key: &str) -> StoreResult<Option<ObjectInfo>> {
        validate_key(key)?;
        let stat = match fs::metadata(self.object_path(key)).await {
            Ok(stat) => stat,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Transient(format!("Failed to stat {}: {}", key, e))),
        };
        let sidecar = self.read_sidecar(key).await;
        let last_modified: DateTime<Utc> = stat.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());

        Ok(Some(ObjectInfo {
            key: key.to_string(),
            size_bytes: stat.len(),
            version: sidecar.as_ref().map(|s| s.version.clone()).unwrap_or_default(),
            last_modified,
            metadata: sidecar.map(|s| s.metadata).unwrap_or_default(),
        }))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        self.walk(self.root.join("objects"), &mut keys).await?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        for path in [self.object_path(key), self.sidecar_path(key)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::Transient(format!("Failed to delete {}: {}", key, e))),
            }
        }
        Ok(())
    }

    async fn copy(&self, source: &str, destination: &str) -> StoreResult<()> {
        validate_key(source)?;
        validate_key(destination)?;
        let staging = Staged(self.incoming_path());
        Self::ensure_parent(staging.path()).await?;

        match fs::copy(self.object_path(source), staging.path()).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(StoreError::NotFound(source.to_string())),
            Err(e) => return Err(StoreError::Transient(format!("Failed to copy {}: {}", source, e))),
        }

        let metadata = self.read_sidecar(source).await.map(|s| s.metadata).unwrap_or_default();
        self.write_sidecar(destination, &metadata, &Uuid::new_v4().to_string()).await?;
        self.promote(&staging, destination).await
    }

    async fn transition(&self, key: &str, class: StorageClass) -> StoreResult<()> {
        validate_key(key)?;
        let _guard = self.cas_lock.lock().await;
        let mut sidecar = match self.read_sidecar(key).await {
            Some(sidecar) => sidecar,
            None if self.object_path(key).exists() => Sidecar {
                version: Uuid::new_v4().to_string(),
                metadata: ObjectMetadata::default(),
            },
            None => return Err(StoreError::NotFound(key.to_string())),
        };
        sidecar.metadata.storage_class = class;
        self.write_sidecar(key, &sidecar.metadata, &sidecar.version).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::reader_from_bytes;

    #[tokio::test]
    async fn test_local_store_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());

        store
            .put("daily/2025-01-15T07-00-00Z.archive", reader_from_bytes("payload"), ObjectMetadata::binary())
            .await
            .expect("put");
        store
            .put("daily/2025-01-14T07-00-00Z.archive", reader_from_bytes("older"), ObjectMetadata::binary())
            .await
            .expect("put");

        let keys = store.list("daily/").await.unwrap();
        assert_eq!(
            keys,
            vec!["daily/2025-01-14T07-00-00Z.archive", "daily/2025-01-15T07-00-00Z.archive"]
        );

        let (data, metadata) = store.get_bytes("daily/2025-01-15T07-00-00Z.archive").await.unwrap();
        assert_eq!(&data[..], b"payload");
        assert!(metadata.server_side_encryption);
    }

    #[tokio::test]
    async fn test_local_store_if_absent_is_exclusive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());

        let first = store
            .put_conditional("locks/daily.lock", Bytes::from("a"), ObjectMetadata::json(), Precondition::IfAbsent)
            .await
            .expect("first create");
        let second = store
            .put_conditional("locks/daily.lock", Bytes::from("b"), ObjectMetadata::json(), Precondition::IfAbsent)
            .await;
        assert!(matches!(second, Err(StoreError::PreconditionFailed(_))));

        store
            .put_conditional(
                "locks/daily.lock",
                Bytes::from("c"),
                ObjectMetadata::json(),
                Precondition::IfMatch(first.version),
            )
            .await
            .expect("swap");
        let (data, _) = store.get_bytes("locks/daily.lock").await.unwrap();
        assert_eq!(&data[..], b"c");
    }

    #[tokio::test]
    async fn test_local_store_delete_missing_is_ok() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());
        store.delete("daily/never-existed.archive").await.expect("idempotent delete");
        assert!(store.head("daily/never-existed.archive").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_abandoned_upload_leaves_no_staging_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());

        // Writer stays open, so the upload never finishes
        let (mut writer, reader) = tokio::io::duplex(64);
        writer.write_all(b"partial").await.unwrap();
        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            store.put("daily/2025-01-15T07-00-00Z.archive", Box::pin(reader), ObjectMetadata::binary()),
        )
        .await;
        assert!(abandoned.is_err());

        let mut staged = std::fs::read_dir(dir.path().join(".incoming")).expect("staging dir").count();
        assert_eq!(staged, 0);
        assert!(store.head("daily/2025-01-15T07-00-00Z.archive").await.unwrap().is_none());

        // Losing a conditional race cleans up as well
        store
            .put_conditional("locks/daily.lock", Bytes::from("a"), ObjectMetadata::json(), Precondition::IfAbsent)
            .await
            .unwrap();
        let _ = store
            .put_conditional("locks/daily.lock", Bytes::from("b"), ObjectMetadata::json(), Precondition::IfAbsent)
            .await;
        staged = std::fs::read_dir(dir.path().join(".incoming")).expect("staging dir").count();
        assert_eq!(staged, 0);
        drop(writer);
    }
}
