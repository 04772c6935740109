//! Manual disaster recovery.
//!
//! A restore is never scheduled. The caller must pass [`RESTORE_CONFIRMATION_TOKEN`]
//! verbatim; anything else is rejected before any side effect. An accepted restore
//! first takes a safety backup of the target into the `safety` tier, then
//! destructively loads the selected backup. If the load fails the safety backup key is
//! reported so an operator can roll back by restoring it.

use crate::audit::AuditLog;
use crate::backup::{BackupExecutor, BackupRecord, Catalog, Tier};
use crate::clock::Clock;
use crate::crypto::KeyProvider;
use crate::lease::LeaseManager;
use crate::metrics::OrchestratorMetrics;
use crate::notify::{EventType, NotificationDispatcher, NotificationEvent};
use crate::pipeline;
use crate::source::DatabaseTarget;
use crate::store::ObjectStore;
use crate::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Literal a caller must supply to run a restore
pub const RESTORE_CONFIRMATION_TOKEN: &str = "I-UNDERSTAND-THIS-OVERWRITES-THE-TARGET";

/// Audit kind of restore entries
pub const AUDIT_KIND: &str = "restore";

/// Restore progress. Only moves forward; `Complete` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreStatus {
    /// Accepted, nothing done yet
    Pending,
    /// Safety backup of the target committed
    SafetyBackupComplete,
    /// Destructive load in progress
    Restoring,
    /// Target holds the restored data
    Complete,
    /// Stopped; see `failure`
    Failed,
}

impl RestoreStatus {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, RestoreStatus::Complete | RestoreStatus::Failed)
    }

    /// Whether `next` is a legal successor
    pub fn can_advance_to(&self, next: RestoreStatus) -> bool {
        use RestoreStatus::*;
        match (self, next) {
            (Pending, SafetyBackupComplete) | (SafetyBackupComplete, Restoring) | (Restoring, Complete) => true,
            (current, Failed) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RestoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Operator request
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    /// Must equal [`RESTORE_CONFIRMATION_TOKEN`]
    pub confirmation_token: String,
    /// Backup to restore
    pub source_backup_key: String,
    /// Registered target to overwrite
    pub target_identifier: String,
    /// Who asked
    pub requested_by: String,
}

/// One restore, as recorded in the audit log. The confirmation token is not kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOperation {
    /// Operation id
    pub id: Uuid,
    /// Who asked
    pub requested_by: String,
    /// Backup being restored
    pub source_backup_key: String,
    /// Target being overwritten
    pub target_identifier: String,
    /// Safety backup taken before the load
    pub safety_backup_key: Option<String>,
    /// Current status
    pub status: RestoreStatus,
    /// When the operation was accepted
    pub started_at: DateTime<Utc>,
    /// When it reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure reason
    pub failure: Option<String>,
}

impl RestoreOperation {
    fn new(request: &RestoreRequest, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            requested_by: request.requested_by.clone(),
            source_backup_key: request.source_backup_key.clone(),
            target_identifier: request.target_identifier.clone(),
            safety_backup_key: None,
            status: RestoreStatus::Pending,
            started_at,
            finished_at: None,
            failure: None,
        }
    }

    /// Move to `next`, rejecting backward or post-terminal transitions
    pub fn advance(&mut self, next: RestoreStatus) -> Result<()> {
        if !self.status.can_advance_to(next) {
            return Err(OrchestratorError::Invalid(format!(
                "restore {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}

/// Runs confirmed restores
pub struct Restorer {
    store: Arc<dyn ObjectStore>,
    catalog: Catalog,
    keys: Arc<dyn KeyProvider>,
    executor: BackupExecutor,
    targets: HashMap<String, Arc<dyn DatabaseTarget>>,
    leases: LeaseManager,
    notifier: NotificationDispatcher,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    run_budget: Duration,
}

impl Restorer {
    /// Create a restorer over the registered `targets`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        keys: Arc<dyn KeyProvider>,
        executor: BackupExecutor,
        targets: Vec<Arc<dyn DatabaseTarget>>,
        leases: LeaseManager,
        notifier: NotificationDispatcher,
        audit: AuditLog,
        clock: Arc<dyn Clock>,
        run_budget: Duration,
    ) -> Self {
        let targets = targets
            .into_iter()
            .map(|t| (t.identifier().to_string(), t))
            .collect();
        Self {
            catalog: Catalog::new(store.clone()),
            store,
            keys,
            executor,
            targets,
            leases,
            notifier,
            audit,
            clock,
            run_budget,
        }
    }

    /// Identifiers of registered targets
    pub fn target_identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.targets.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run a restore.
    ///
    /// An unconfirmed request fails with `NotConfirmed` and does nothing else. Any
    /// later failure is published and returned as `RestoreFailed`, carrying the
    /// safety backup key when one was taken.
    #[instrument(skip(self, request, cancel), fields(key = %request.source_backup_key, target = %request.target_identifier))]
    pub async fn restore(&self, request: RestoreRequest, cancel: &CancellationToken) -> Result<RestoreOperation> {
        if request.confirmation_token != RESTORE_CONFIRMATION_TOKEN {
            warn!(requested_by = %request.requested_by, "Restore rejected: confirmation token mismatch");
            return Err(OrchestratorError::NotConfirmed);
        }

        let started = Instant::now();
        let mut operation = RestoreOperation::new(&request, self.clock.now());
        info!(id = %operation.id, requested_by = %operation.requested_by, "Restore accepted");

        let outcome = self.execute(&mut operation, cancel).await;
        operation.finished_at = Some(self.clock.now());

        match outcome {
            Ok(()) => {
                operation.advance(RestoreStatus::Complete)?;
                info!(
                    id = %operation.id,
                    safety_backup_key = operation.safety_backup_key.as_deref().unwrap_or(""),
                    "Restore complete"
                );
                OrchestratorMetrics::record_run("restore", Tier::Safety.as_str(), true, started.elapsed());
                self.audit.record(AUDIT_KIND, operation.started_at, &operation).await;

                let event = NotificationEvent::new(
                    EventType::RestoreCompleted,
                    None,
                    Some(operation.source_backup_key.clone()),
                    self.clock.now(),
                    format!(
                        "restored into {}; safety backup {}",
                        operation.target_identifier,
                        operation.safety_backup_key.as_deref().unwrap_or("none")
                    ),
                );
                self.notifier.publish_best_effort(event).await;
                Ok(operation)
            }
            Err(e) => {
                operation.status = RestoreStatus::Failed;
                operation.failure = Some(e.to_string());
                error!(
                    id = %operation.id,
                    error = %e,
                    safety_backup_key = operation.safety_backup_key.as_deref().unwrap_or(""),
                    "Restore failed"
                );
                OrchestratorMetrics::record_run("restore", Tier::Safety.as_str(), false, started.elapsed());
                self.audit.record(AUDIT_KIND, operation.started_at, &operation).await;

                let detail = match &operation.safety_backup_key {
                    Some(safety) => format!("{}; target can be rolled back from {}", e, safety),
                    None => format!("{}; target was not modified", e),
                };
                let event = NotificationEvent::new(
                    EventType::RestoreFailed,
                    None,
                    Some(operation.source_backup_key.clone()),
                    self.clock.now(),
                    detail,
                );
                self.notifier.publish_best_effort(event).await;

                Err(OrchestratorError::RestoreFailed {
                    safety_backup_key: operation.safety_backup_key.clone(),
                    reason: Box::new(e),
                })
            }
        }
    }

    async fn execute(&self, operation: &mut RestoreOperation, cancel: &CancellationToken) -> Result<()> {
        let record = self
            .catalog
            .get(&operation.source_backup_key)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("no catalog record for {}", operation.source_backup_key)))?;
        let target = self
            .targets
            .get(&operation.target_identifier)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("unknown restore target {}", operation.target_identifier)))?;

        let lease = self.leases.acquire(&format!("target-{}", operation.target_identifier)).await?;
        let outcome = self.execute_leased(operation, &record, target.as_ref(), cancel).await;
        lease.release().await;
        outcome
    }

    async fn execute_leased(
        &self,
        operation: &mut RestoreOperation,
        record: &BackupRecord,
        target: &dyn DatabaseTarget,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let safety = self.executor.run(Tier::Safety, target, cancel).await?;
        operation.safety_backup_key = Some(safety.key.clone());
        operation.advance(RestoreStatus::SafetyBackupComplete)?;
        info!(id = %operation.id, safety_backup_key = %safety.key, "Safety backup committed");

        let key = self.keys.resolve(&record.encryption_key_ref).await?;
        operation.advance(RestoreStatus::Restoring)?;

        let run_cancel = cancel.child_token();
        let summary = tokio::select! {
            loaded = pipeline::restore_into(self.store.as_ref(), record, &key, target, &run_cancel) => loaded?,
            _ = tokio::time::sleep(self.run_budget) => {
                run_cancel.cancel();
                return Err(OrchestratorError::Timeout(self.run_budget));
            }
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
        };

        info!(id = %operation.id, bytes = summary.plaintext_bytes, "Backup loaded into target");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::ExecutorSettings;
    use crate::clock::ManualClock;
    use crate::crypto::StaticKeyProvider;
    use crate::notify::MemoryTopic;
    use crate::pipeline::SealOptions;
    use crate::resilience::RetryConfig;
    use crate::source::MemoryDatabase;
    use crate::store::MemoryObjectStore;
    use chrono::TimeZone;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryObjectStore>,
        topic: Arc<MemoryTopic>,
        clock: Arc<ManualClock>,
        executor: BackupExecutor,
        restorer: Restorer,
        production: Arc<MemoryDatabase>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 15, 7, 0, 0).unwrap()));
        let store = Arc::new(MemoryObjectStore::with_clock(clock.clone()));
        let topic = Arc::new(MemoryTopic::new());
        let keys: Arc<dyn KeyProvider> = Arc::new(StaticKeyProvider::generated("test-key"));
        let leases = LeaseManager::new(store.clone(), clock.clone(), Duration::from_secs(600));
        let notifier = NotificationDispatcher::new(topic.clone(), RetryConfig::none());
        let executor = BackupExecutor::new(
            store.clone(),
            keys.clone(),
            leases.clone(),
            notifier.clone(),
            clock.clone(),
            ExecutorSettings {
                encryption_key_ref: "test-key".to_string(),
                seal: SealOptions::default(),
                run_budget: Duration::from_secs(30),
                store_op_timeout: Duration::from_secs(5),
            },
        );

        let production = Arc::new(MemoryDatabase::production("primary"));
        production.insert("users", json!({"name": "ada"}));

        let restorer = Restorer::new(
            store.clone(),
            keys,
            executor.clone(),
            vec![production.clone() as Arc<dyn DatabaseTarget>],
            leases,
            notifier,
            AuditLog::new(),
            clock.clone(),
            Duration::from_secs(30),
        );

        Fixture {
            store,
            topic,
            clock,
            executor,
            restorer,
            production,
        }
    }

    fn request(token: &str, key: &str) -> RestoreRequest {
        RestoreRequest {
            confirmation_token: token.to_string(),
            source_backup_key: key.to_string(),
            target_identifier: "primary".to_string(),
            requested_by: "oncall".to_string(),
        }
    }

    #[tokio::test]
    async fn test_restore_takes_safety_backup_then_loads() {
        let f = fixture();
        let backup = f
            .executor
            .run(Tier::Daily, &*f.production, &CancellationToken::new())
            .await
            .unwrap();

        f.production.insert("users", json!({"name": "mallory"}));
        let damaged = f.production.export().unwrap();
        f.clock.advance(chrono::Duration::minutes(5));

        let operation = f
            .restorer
            .restore(request(RESTORE_CONFIRMATION_TOKEN, &backup.key), &CancellationToken::new())
            .await
            .expect("restore");

        assert_eq!(operation.status, RestoreStatus::Complete);
        let safety_key = operation.safety_backup_key.clone().expect("safety backup");
        assert!(safety_key.starts_with("safety/"));

        let safety = Catalog::new(f.store.clone()).get(&safety_key).await.unwrap().unwrap();
        assert_eq!(safety.checksum, pipeline::sha256_hex(&damaged));
        assert_eq!(pipeline::sha256_hex(&f.production.export().unwrap()), backup.checksum);
        assert_eq!(f.topic.events_of(EventType::RestoreCompleted).len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_token_has_no_side_effects() {
        let f = fixture();
        let backup = f
            .executor
            .run(Tier::Daily, &*f.production, &CancellationToken::new())
            .await
            .unwrap();
        let objects = f.store.len();
        let events = f.topic.events().len();

        let err = f
            .restorer
            .restore(request("yes", &backup.key), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::NotConfirmed));
        assert_eq!(f.store.len(), objects);
        assert_eq!(f.topic.events().len(), events);
        assert_eq!(f.production.restore_count(), 0);
        assert_eq!(f.production.dump_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_load_surfaces_safety_key() {
        let f = fixture();
        let backup = f
            .executor
            .run(Tier::Daily, &*f.production, &CancellationToken::new())
            .await
            .unwrap();
        f.clock.advance(chrono::Duration::minutes(1));
        f.production.fail_next_restore();

        let err = f
            .restorer
            .restore(request(RESTORE_CONFIRMATION_TOKEN, &backup.key), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            OrchestratorError::RestoreFailed { safety_backup_key, .. } => {
                assert!(safety_backup_key.expect("safety key").starts_with("safety/"))
            }
            other => panic!("unexpected error: {:?}", other),
        }
        let failed = f.topic.events_of(EventType::RestoreFailed);
        assert_eq!(failed.len(), 1);
        assert!(failed[0].detail.contains("rolled back from safety/"));
    }

    #[tokio::test]
    async fn test_unknown_backup_fails_before_safety_backup() {
        let f = fixture();
        let err = f
            .restorer
            .restore(
                request(RESTORE_CONFIRMATION_TOKEN, "daily/2020-01-01T00-00-00Z.archive"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::RestoreFailed { safety_backup_key: None, .. }
        ));
        assert!(f.store.list("safety/").await.unwrap().is_empty());
    }

    #[test]
    fn test_status_only_moves_forward() {
        use RestoreStatus::*;
        assert!(Pending.can_advance_to(SafetyBackupComplete));
        assert!(Restoring.can_advance_to(Complete));
        assert!(Pending.can_advance_to(Failed));
        assert!(!Restoring.can_advance_to(Pending));
        assert!(!Pending.can_advance_to(Restoring));
        assert!(!Complete.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Pending));
    }
}
