// Shared fixtures for orchestrator integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use backup_orchestrator::audit::AuditLog;
use backup_orchestrator::clock::ManualClock;
use backup_orchestrator::crypto::StaticKeyProvider;
use backup_orchestrator::notify::MemoryTopic;
use backup_orchestrator::source::{MemoryDatabase, MemoryScratchProvisioner};
use backup_orchestrator::store::{
    ByteReader, MemoryObjectStore, ObjectInfo, ObjectMetadata, ObjectStore, Precondition, PutReceipt,
    StorageClass, StoreError, StoreResult,
};
use backup_orchestrator::{Orchestrator, OrchestratorConfig};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 2025-01-15T07:00:00Z
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 7, 0, 0).unwrap()
}

/// Store wrapper that can fail catalog commits, simulating a crash between the
/// upload and the commit point
pub struct FaultyStore {
    inner: MemoryObjectStore,
    fail_catalog_writes: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: MemoryObjectStore) -> Self {
        Self {
            inner,
            fail_catalog_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_catalog_writes(&self, fail: bool) {
        self.fail_catalog_writes.store(fail, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &MemoryObjectStore {
        &self.inner
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn put(&self, key: &str, body: ByteReader, metadata: ObjectMetadata) -> StoreResult<PutReceipt> {
        self.inner.put(key, body, metadata).await
    }

    async fn put_conditional(
        &self,
        key: &str,
        body: Bytes,
        metadata: ObjectMetadata,
        precondition: Precondition,
    ) -> StoreResult<PutReceipt> {
        if key.starts_with("catalog/") && self.fail_catalog_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("connection reset during commit".to_string()));
        }
        self.inner.put_conditional(key, body, metadata, precondition).await
    }

    async fn get(&self, key: &str) -> StoreResult<(ByteReader, ObjectMetadata)> {
        self.inner.get(key).await
    }

    async fn head(&self, key: &str) -> StoreResult<Option<ObjectInfo>> {
        self.inner.head(key).await
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key).await
    }

    async fn copy(&self, source: &str, destination: &str) -> StoreResult<()> {
        self.inner.copy(source, destination).await
    }

    async fn transition(&self, key: &str, class: StorageClass) -> StoreResult<()> {
        self.inner.transition(key, class).await
    }
}

/// A fully wired orchestrator over in-memory collaborators
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<FaultyStore>,
    pub topic: Arc<MemoryTopic>,
    pub scratch: Arc<MemoryScratchProvisioner>,
    pub production: Arc<MemoryDatabase>,
    pub audit: AuditLog,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn memory(&self) -> &MemoryObjectStore {
        self.store.inner()
    }
}

pub fn harness() -> Harness {
    harness_with(OrchestratorConfig::for_testing())
}

pub fn harness_with(mut config: OrchestratorConfig) -> Harness {
    config.verification.expected_collections = vec!["users".to_string()];

    let clock = Arc::new(ManualClock::new(t0()));
    let store = Arc::new(FaultyStore::new(MemoryObjectStore::with_clock(clock.clone())));
    let topic = Arc::new(MemoryTopic::new());
    let scratch = Arc::new(MemoryScratchProvisioner::new());
    let audit = AuditLog::new();

    let production = Arc::new(MemoryDatabase::production("primary"));
    production.insert("users", json!({"_id": 1, "name": "ada"}));
    production.insert("users", json!({"_id": 2, "name": "grace"}));
    production.insert("orders", json!({"_id": 10, "user": 1, "total": 42}));

    let orchestrator = Orchestrator::builder(config)
        .store(store.clone())
        .keys(Arc::new(StaticKeyProvider::generated("test-key")))
        .sink(topic.clone())
        .production(production.clone())
        .scratch(scratch.clone())
        .clock(clock.clone())
        .audit(audit.clone())
        .build()
        .expect("orchestrator");

    Harness {
        clock,
        store,
        topic,
        scratch,
        production,
        audit,
        orchestrator,
    }
}
