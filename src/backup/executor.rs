//! Produces one encrypted, checksummed backup per run.
//!
//! A run streams the dump through the sealing pipeline into a staging object under
//! `_tmp/{run}/`, copies it to its final key and then commits the catalog record.
//! The catalog write is the commit point: until it succeeds the backup does not
//! exist, whatever objects the run left behind. Staging and orphaned final objects are
//! removed best-effort on failure; the retention sweep collects anything that a crash
//! left behind.

use super::catalog::Catalog;
use super::types::{backup_key, temp_key, BackupRecord, Tier, FORMAT_VERSION};
use crate::clock::Clock;
use crate::crypto::{EncryptionKey, KeyProvider};
use crate::lease::LeaseManager;
use crate::metrics::OrchestratorMetrics;
use crate::notify::{EventType, NotificationDispatcher, NotificationEvent};
use crate::pipeline::{self, SealOptions, StreamSummary};
use crate::source::DumpSource;
use crate::store::{ObjectMetadata, ObjectStore, PutReceipt};
use crate::{OrchestratorError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Largest collision suffix tried before giving up
const MAX_KEY_SEQUENCE: u32 = 999;

/// Per-run settings
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Reference of the key backups are sealed with
    pub encryption_key_ref: String,
    /// Chunking and compression
    pub seal: SealOptions,
    /// Wall-clock budget for a whole run
    pub run_budget: Duration,
    /// Budget for a single store call outside the streaming upload
    pub store_op_timeout: Duration,
}

/// Runs backups
#[derive(Clone)]
pub struct BackupExecutor {
    store: Arc<dyn ObjectStore>,
    catalog: Catalog,
    keys: Arc<dyn KeyProvider>,
    leases: LeaseManager,
    notifier: NotificationDispatcher,
    clock: Arc<dyn Clock>,
    settings: ExecutorSettings,
}

/// Bound a store call by `limit`
pub(crate) async fn bounded<T, F>(limit: Duration, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, operation)
        .await
        .map_err(|_| OrchestratorError::Timeout(limit))?
}

impl BackupExecutor {
    /// Create an executor
    pub fn new(
        store: Arc<dyn ObjectStore>,
        keys: Arc<dyn KeyProvider>,
        leases: LeaseManager,
        notifier: NotificationDispatcher,
        clock: Arc<dyn Clock>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            catalog: Catalog::new(store.clone()),
            store,
            keys,
            leases,
            notifier,
            clock,
            settings,
        }
    }

    /// The catalog this executor commits to
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Back up `source` into `tier`.
    ///
    /// Fails with `Busy` if another run of the same tier holds the tier lease. Every
    /// outcome is published; nothing is retried here.
    #[instrument(skip(self, tier, source, cancel), fields(tier = %tier, source = %source.identifier()))]
    pub async fn run<S>(&self, tier: Tier, source: &S, cancel: &CancellationToken) -> Result<BackupRecord>
    where
        S: DumpSource + ?Sized,
    {
        let started = Instant::now();
        let result = self.run_leased(tier, source, cancel).await;
        let finished_at = self.clock.now();

        match &result {
            Ok(record) => {
                info!(
                    key = %record.key,
                    size_bytes = record.size_bytes,
                    stored_bytes = record.stored_bytes,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Backup committed"
                );
                OrchestratorMetrics::record_run("backup", tier.as_str(), true, started.elapsed());
                OrchestratorMetrics::record_bytes(tier.as_str(), record.size_bytes);
                let event = NotificationEvent::new(
                    EventType::BackupSucceeded,
                    Some(tier),
                    Some(record.key.clone()),
                    finished_at,
                    format!("backup of {} committed", source.identifier()),
                )
                .with_size(record.size_bytes);
                self.notifier.publish_best_effort(event).await;
            }
            Err(e) => {
                if matches!(e, OrchestratorError::Busy(_)) {
                    warn!(error = %e, "Backup rejected");
                    OrchestratorMetrics::record_busy("backup", tier.as_str());
                } else {
                    error!(error = %e, kind = ?e.kind(), "Backup failed");
                    OrchestratorMetrics::record_run("backup", tier.as_str(), false, started.elapsed());
                }
                let event = NotificationEvent::new(EventType::BackupFailed, Some(tier), None, finished_at, e.to_string());
                self.notifier.publish_best_effort(event).await;
            }
        }

        result
    }

    async fn run_leased<S>(&self, tier: Tier, source: &S, cancel: &CancellationToken) -> Result<BackupRecord>
    where
        S: DumpSource + ?Sized,
    {
        let lease = self.leases.acquire(&format!("tier-{}", tier)).await?;
        let outcome = self.run_locked(tier, source, cancel).await;
        lease.release().await;
        outcome
    }

    async fn run_locked<S>(&self, tier: Tier, source: &S, cancel: &CancellationToken) -> Result<BackupRecord>
    where
        S: DumpSource + ?Sized,
    {
        let limit = self.settings.store_op_timeout;
        let created_at = self.clock.now();
        let key = self.reserve_key(tier, created_at).await?;
        let temp = temp_key(&Uuid::new_v4().to_string(), &key);
        let encryption_key = self.keys.resolve(&self.settings.encryption_key_ref).await?;

        info!(key = %key, temp_key = %temp, "Starting backup");

        let staged = self
            .stage_within_budget(tier, &key, &temp, source, &encryption_key, cancel)
            .await;
        let (summary, receipt) = match staged {
            Ok(staged) => staged,
            Err(e) => {
                self.cleanup(&temp, "temp_object").await;
                return Err(e);
            }
        };

        if cancel.is_cancelled() {
            self.cleanup(&temp, "temp_object").await;
            return Err(OrchestratorError::Cancelled);
        }

        let copied = bounded(limit, async {
            self.store.copy(&temp, &key).await.map_err(OrchestratorError::from)
        })
        .await;
        if let Err(e) = copied {
            self.cleanup(&temp, "temp_object").await;
            self.cleanup(&key, "uncommitted_object").await;
            return Err(e);
        }

        let record = BackupRecord {
            tier,
            key: key.clone(),
            size_bytes: summary.plaintext_bytes,
            stored_bytes: receipt.size_bytes,
            checksum: summary.checksum,
            created_at,
            encryption_key_ref: self.settings.encryption_key_ref.clone(),
            compression: self.settings.seal.compress.then(|| "gzip".to_string()),
            format_version: FORMAT_VERSION,
            source: source.identifier().to_string(),
        };

        let committed = bounded(limit, self.catalog.commit(&record)).await;
        self.cleanup(&temp, "temp_object").await;

        if let Err(e) = committed {
            // A commit that timed out may still have landed
            match self.catalog.get(&key).await {
                Ok(Some(existing)) if existing == record => {
                    warn!(key = %key, error = %e, "Catalog commit reported failure but the record is present");
                    return Ok(record);
                }
                _ => {
                    self.cleanup(&key, "uncommitted_object").await;
                    return Err(e);
                }
            }
        }

        Ok(record)
    }

    /// First key for `at` that neither the catalog nor the store knows. The tier
    /// lease makes check-then-use safe.
    async fn reserve_key(&self, tier: Tier, at: chrono::DateTime<chrono::Utc>) -> Result<String> {
        for sequence in 0..=MAX_KEY_SEQUENCE {
            let key = backup_key(tier, at, sequence);
            if self.catalog.exists(&key).await? || self.store.head(&key).await?.is_some() {
                continue;
            }
            return Ok(key);
        }
        Err(OrchestratorError::Invalid(format!(
            "no free key for {} at {}",
            tier, at
        )))
    }

    async fn stage_within_budget<S>(
        &self,
        tier: Tier,
        key: &str,
        temp: &str,
        source: &S,
        encryption_key: &EncryptionKey,
        cancel: &CancellationToken,
    ) -> Result<(StreamSummary, PutReceipt)>
    where
        S: DumpSource + ?Sized,
    {
        let budget = self.settings.run_budget;
        let run_cancel = cancel.child_token();

        let stage = self.stage(tier, key, temp, source, encryption_key, &run_cancel);
        tokio::pin!(stage);

        tokio::select! {
            staged = &mut stage => staged,
            _ = tokio::time::sleep(budget) => {
                run_cancel.cancel();
                self.unwind(stage.as_mut()).await;
                Err(OrchestratorError::Timeout(budget))
            }
            _ = cancel.cancelled() => {
                self.unwind(stage.as_mut()).await;
                Err(OrchestratorError::Cancelled)
            }
        }
    }

    /// Give a cancelled stream copy a chance to abort its upload before dropping it
    async fn unwind<F>(&self, stage: std::pin::Pin<&mut F>)
    where
        F: Future<Output = Result<(StreamSummary, PutReceipt)>>,
    {
        if tokio::time::timeout(self.settings.store_op_timeout, stage).await.is_err() {
            warn!("Cancelled upload did not stop in time; dropping it");
        }
    }

    async fn stage<S>(
        &self,
        tier: Tier,
        key: &str,
        temp: &str,
        source: &S,
        encryption_key: &EncryptionKey,
        cancel: &CancellationToken,
    ) -> Result<(StreamSummary, PutReceipt)>
    where
        S: DumpSource + ?Sized,
    {
        let dump = source.open_dump_stream().await.map_err(|e| match e {
            OrchestratorError::SourceUnavailable(_) => e,
            other => OrchestratorError::SourceUnavailable(other.to_string()),
        })?;

        let metadata = ObjectMetadata::binary()
            .with_user("tier", tier.as_str())
            .with_user("backup-key", key)
            .with_user("encryption-key-ref", self.settings.encryption_key_ref.clone());

        let (tx, sealed) = pipeline::channel();
        let (sealed_result, upload_result) = tokio::join!(
            pipeline::seal_stream(dump, tx, encryption_key, self.settings.seal, cancel),
            self.store.put(temp, sealed, metadata)
        );

        match (sealed_result, upload_result) {
            (Err(seal_err), Err(upload_err)) if pipeline::is_closed_pipe(&seal_err) => Err(upload_err.into()),
            (Err(seal_err), _) => Err(seal_err),
            (Ok(_), Err(upload_err)) => Err(upload_err.into()),
            (Ok(summary), Ok(receipt)) => Ok((summary, receipt)),
        }
    }

    async fn cleanup(&self, key: &str, step: &str) {
        let deleted = bounded(self.settings.store_op_timeout, async {
            self.store.delete(key).await.map_err(OrchestratorError::from)
        })
        .await;
        if let Err(e) = deleted {
            warn!(key = %key, error = %e, "Best-effort cleanup failed");
            OrchestratorMetrics::record_cleanup_failure(step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::StaticKeyProvider;
    use crate::notify::MemoryTopic;
    use crate::resilience::RetryConfig;
    use crate::source::MemoryDatabase;
    use crate::store::MemoryObjectStore;
    use chrono::TimeZone;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryObjectStore>,
        topic: Arc<MemoryTopic>,
        executor: BackupExecutor,
        database: MemoryDatabase,
    }

    fn fixture() -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(chrono::Utc.with_ymd_and_hms(2025, 1, 15, 7, 0, 0).unwrap()));
        let store = Arc::new(MemoryObjectStore::with_clock(clock.clone()));
        let topic = Arc::new(MemoryTopic::new());
        let executor = BackupExecutor::new(
            store.clone(),
            Arc::new(StaticKeyProvider::generated("test-key")),
            LeaseManager::new(store.clone(), clock.clone(), Duration::from_secs(3900)),
            NotificationDispatcher::new(topic.clone(), RetryConfig::none()),
            clock,
            ExecutorSettings {
                encryption_key_ref: "test-key".to_string(),
                seal: SealOptions {
                    chunk_size: 64,
                    compress: true,
                },
                run_budget: Duration::from_secs(30),
                store_op_timeout: Duration::from_secs(5),
            },
        );
        let database = MemoryDatabase::production("primary");
        database.insert("users", json!({"name": "ada"}));
        Fixture {
            store,
            topic,
            executor,
            database,
        }
    }

    #[tokio::test]
    async fn test_backup_commits_record_and_cleans_staging() {
        let f = fixture();
        let record = f
            .executor
            .run(Tier::Daily, &f.database, &CancellationToken::new())
            .await
            .expect("backup");

        assert_eq!(record.key, "daily/2025-01-15T07-00-00Z.archive");
        assert_eq!(record.checksum, pipeline::sha256_hex(&f.database.export().unwrap()));
        assert_eq!(record.compression.as_deref(), Some("gzip"));
        assert_eq!(f.executor.catalog().list_keys(Tier::Daily).await.unwrap(), vec![record.key.clone()]);
        assert!(f.store.list("_tmp/").await.unwrap().is_empty());
        assert!(f.store.list("locks/").await.unwrap().is_empty());
        assert_eq!(f.topic.events_of(EventType::BackupSucceeded).len(), 1);
    }

    #[tokio::test]
    async fn test_same_second_runs_get_distinct_keys() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let first = f.executor.run(Tier::Daily, &f.database, &cancel).await.unwrap();
        let second = f.executor.run(Tier::Daily, &f.database, &cancel).await.unwrap();

        assert_eq!(first.key, "daily/2025-01-15T07-00-00Z.archive");
        assert_eq!(second.key, "daily/2025-01-15T07-00-00Z_001.archive");
    }

    #[tokio::test]
    async fn test_source_failure_leaves_nothing_behind() {
        let f = fixture();
        f.database.fail_next_dump();

        let err = f
            .executor
            .run(Tier::Weekly, &f.database, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::SourceUnavailable(_)));
        assert!(f.store.is_empty());

        let failed = f.topic.events_of(EventType::BackupFailed);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].tier, Some(Tier::Weekly));
    }

    #[tokio::test]
    async fn test_cancelled_run_commits_nothing() {
        let f = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f.executor.run(Tier::Daily, &f.database, &cancel).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
        assert!(f.executor.catalog().list_keys(Tier::Daily).await.unwrap().is_empty());
        assert!(f.store.list("_tmp/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_key_ref_fails_before_upload() {
        let mut f = fixture();
        f.executor.settings.encryption_key_ref = "missing".to_string();

        let err = f
            .executor
            .run(Tier::Daily, &f.database, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Crypto(_)));
        assert!(f.store.list("daily/").await.unwrap().is_empty());
    }
}
