//! Append-only catalog of committed backups
//!
//! A backup exists exactly when its record exists under `catalog/{tier}/`. Records are
//! written with a create-only conditional put, so a record is never overwritten and
//! two runs can never both commit the same key.

use super::types::{catalog_key, data_key_from_catalog, BackupRecord, Tier};
use crate::store::{ObjectMetadata, ObjectStore, Precondition, StoreError};
use crate::{OrchestratorError, Result};
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// Catalog view over the object store
#[derive(Clone)]
pub struct Catalog {
    store: Arc<dyn ObjectStore>,
}

impl Catalog {
    /// Catalog backed by `store`
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Commit point of a backup
    pub async fn commit(&self, record: &BackupRecord) -> Result<()> {
        let key = record.catalog_key();
        let body = serde_json::to_vec_pretty(record)?;

        match self
            .store
            .put_conditional(&key, Bytes::from(body), ObjectMetadata::json(), Precondition::IfAbsent)
            .await
        {
            Ok(_) => {
                debug!(catalog_key = %key, "Committed catalog record");
                Ok(())
            }
            Err(StoreError::PreconditionFailed(_)) => Err(OrchestratorError::Invalid(format!(
                "catalog record {} already exists",
                key
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Data keys committed for `tier`, oldest first
    pub async fn list_keys(&self, tier: Tier) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .store
            .list(&tier.catalog_prefix())
            .await?
            .iter()
            .filter_map(|k| data_key_from_catalog(k))
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Records committed for `tier`, oldest first
    pub async fn list(&self, tier: Tier) -> Result<Vec<BackupRecord>> {
        let mut records = Vec::new();
        for key in self.list_keys(tier).await? {
            if let Some(record) = self.get(&key).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Record for a data key, if committed
    pub async fn get(&self, data_key: &str) -> Result<Option<BackupRecord>> {
        match self.store.get_bytes(&catalog_key(data_key)).await {
            Ok((body, _)) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a data key is committed
    pub async fn exists(&self, data_key: &str) -> Result<bool> {
        Ok(self.store.head(&catalog_key(data_key)).await?.is_some())
    }

    /// Most recent record of `tier`
    pub async fn latest(&self, tier: Tier) -> Result<Option<BackupRecord>> {
        match self.list_keys(tier).await?.last() {
            Some(key) => self.get(key).await,
            None => Ok(None),
        }
    }

    /// Remove a record. Only the retention sweep calls this.
    pub async fn remove(&self, data_key: &str) -> Result<()> {
        self.store.delete(&catalog_key(data_key)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::types::FORMAT_VERSION;
    use crate::store::MemoryObjectStore;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn record(key: &str) -> BackupRecord {
        BackupRecord {
            tier: Tier::Daily,
            key: key.to_string(),
            size_bytes: 3,
            stored_bytes: 60,
            checksum: "00".repeat(32),
            created_at: Utc.with_ymd_and_hms(2025, 1, 15, 7, 0, 0).unwrap(),
            encryption_key_ref: "test-key".to_string(),
            compression: Some("gzip".to_string()),
            format_version: FORMAT_VERSION,
            source: "primary".to_string(),
        }
    }

    #[tokio::test]
    async fn test_commit_is_create_only() {
        let catalog = Catalog::new(Arc::new(MemoryObjectStore::new()));
        let first = record("daily/2025-01-15T07-00-00Z.archive");

        catalog.commit(&first).await.expect("first commit");
        assert!(catalog.commit(&first).await.is_err());

        let loaded = catalog.get(&first.key).await.unwrap().expect("committed");
        assert_eq!(loaded, first);
    }

    #[tokio::test]
    async fn test_latest_and_listing() {
        let catalog = Catalog::new(Arc::new(MemoryObjectStore::new()));
        assert!(catalog.latest(Tier::Daily).await.unwrap().is_none());

        for key in [
            "daily/2025-01-14T07-00-00Z.archive",
            "daily/2025-01-15T07-00-00Z_001.archive",
            "daily/2025-01-15T07-00-00Z.archive",
        ] {
            catalog.commit(&record(key)).await.unwrap();
        }

        assert_eq!(
            catalog.list_keys(Tier::Daily).await.unwrap(),
            vec![
                "daily/2025-01-14T07-00-00Z.archive",
                "daily/2025-01-15T07-00-00Z.archive",
                "daily/2025-01-15T07-00-00Z_001.archive",
            ]
        );
        let latest = catalog.latest(Tier::Daily).await.unwrap().unwrap();
        assert_eq!(latest.key, "daily/2025-01-15T07-00-00Z_001.archive");
        assert!(catalog.list_keys(Tier::Weekly).await.unwrap().is_empty());

        catalog.remove("daily/2025-01-14T07-00-00Z.archive").await.unwrap();
        assert!(!catalog.exists("daily/2025-01-14T07-00-00Z.archive").await.unwrap());
    }
}
