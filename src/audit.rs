//! Audit log for verification results and restore operations
//!
//! Every entry is emitted as a structured `tracing` event on the `audit` target and
//! the most recent ones are kept in memory. When a store is attached the entry is also written to
//! `audit/{kind}/{timestamp}-{id}.json`; a failed write is logged and never fails the
//! run that produced the entry.

use crate::store::{ObjectMetadata, ObjectStore, Precondition};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Audit entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Unique entry id
    pub id: Uuid,

    /// Entry kind (`verification`, `restore`)
    pub kind: String,

    /// When the entry was recorded
    pub recorded_at: DateTime<Utc>,

    /// The recorded document
    pub payload: serde_json::Value,
}

/// Entries kept in memory by default; older ones live only in the store and logs
pub const DEFAULT_RETAINED_ENTRIES: usize = 1024;

/// Append-only audit log
#[derive(Clone)]
pub struct AuditLog {
    entries: Arc<RwLock<VecDeque<AuditEntry>>>,
    retained: usize,
    store: Option<Arc<dyn ObjectStore>>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self {
            entries: Arc::default(),
            retained: DEFAULT_RETAINED_ENTRIES,
            store: None,
        }
    }
}

impl AuditLog {
    /// In-memory only
    pub fn new() -> Self {
        Self::default()
    }

    /// Also persist entries to the object store
    pub fn with_store(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::default()
        }
    }

    /// Keep at most `retained` entries in memory
    pub fn with_retention(mut self, retained: usize) -> Self {
        self.retained = retained.max(1);
        self
    }

    /// Append an entry
    pub async fn record<T: Serialize>(&self, kind: &str, recorded_at: DateTime<Utc>, payload: &T) {
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(kind, error = %e, "Failed to serialize audit payload");
                return;
            }
        };

        let entry = AuditEntry {
            id: Uuid::new_v4(),
            kind: kind.to_string(),
            recorded_at,
            payload,
        };

        info!(target: "audit", kind = %entry.kind, id = %entry.id, payload = %entry.payload, "Audit entry");

        if let Some(store) = &self.store {
            let key = format!(
                "audit/{}/{}-{}.json",
                entry.kind,
                entry.recorded_at.format("%Y-%m-%dT%H-%M-%SZ"),
                entry.id
            );
            match serde_json::to_vec(&entry) {
                Ok(body) => {
                    if let Err(e) = store
                        .put_conditional(&key, Bytes::from(body), ObjectMetadata::json(), Precondition::IfAbsent)
                        .await
                    {
                        warn!(key = %key, error = %e, "Failed to persist audit entry");
                    }
                }
                Err(e) => warn!(key = %key, error = %e, "Failed to encode audit entry"),
            }
        }

        let mut entries = self.entries.write().await;
        if entries.len() >= self.retained {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Most recent entries recorded by this process, oldest first
    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.iter().cloned().collect()
    }

    /// Entries of one kind
    pub async fn entries_of(&self, kind: &str) -> Vec<AuditEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryObjectStore;

    #[tokio::test]
    async fn test_entries_are_kept_and_persisted() {
        let store = Arc::new(MemoryObjectStore::new());
        let log = AuditLog::with_store(store.clone());

        log.record("verification", Utc::now(), &serde_json::json!({"outcome": "Pass"}))
            .await;
        log.record("restore", Utc::now(), &serde_json::json!({"status": "Complete"}))
            .await;

        assert_eq!(log.entries().await.len(), 2);
        assert_eq!(log.entries_of("restore").await.len(), 1);
        assert_eq!(store.list("audit/verification/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_keeps_only_recent_entries() {
        let store = Arc::new(MemoryObjectStore::new());
        let log = AuditLog::with_store(store.clone()).with_retention(2);

        for attempt in 0..5 {
            log.record("verification", Utc::now(), &serde_json::json!({ "attempt": attempt }))
                .await;
        }

        let kept = log.entries().await;
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].payload["attempt"], 3);
        assert_eq!(kept[1].payload["attempt"], 4);
        // The store still has every entry
        assert_eq!(store.list("audit/verification/").await.unwrap().len(), 5);
    }
}
