//! Restore verification.
//!
//! A verification run restores one catalogued backup into a freshly provisioned
//! scratch target through the same [`pipeline::restore_into`] path disaster recovery
//! uses, then checks that the restored dataset exports to the recorded checksum and
//! answers a live query. The scratch target is always torn down. Verification only
//! observes: it never modifies a backup, never touches production, and reports its
//! outcome as a [`VerificationResult`] rather than an error.

use crate::audit::AuditLog;
use crate::backup::{BackupRecord, Catalog, Tier};
use crate::clock::Clock;
use crate::crypto::KeyProvider;
use crate::lease::LeaseManager;
use crate::metrics::OrchestratorMetrics;
use crate::notify::{EventType, NotificationDispatcher, NotificationEvent};
use crate::pipeline;
use crate::source::{DatabaseTarget, ScratchProvisioner};
use crate::store::ObjectStore;
use crate::{ErrorKind, OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Audit kind of verification entries
pub const AUDIT_KIND: &str = "verification";

/// Read size when hashing the scratch export
const EXPORT_CHUNK: usize = 256 * 1024;

/// Which backup to verify
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationSelector {
    /// Most recent backup of a tier
    Latest(Tier),
    /// A specific data key
    Key(String),
}

impl VerificationSelector {
    /// A tier name selects the latest backup of that tier, anything else is a key
    pub fn parse(input: &str) -> Self {
        match input.parse::<Tier>() {
            Ok(tier) => VerificationSelector::Latest(tier),
            Err(_) => VerificationSelector::Key(input.to_string()),
        }
    }
}

impl fmt::Display for VerificationSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationSelector::Latest(tier) => write!(f, "latest {}", tier),
            VerificationSelector::Key(key) => f.write_str(key),
        }
    }
}

/// Verification verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationOutcome {
    /// Restored, checksum matched, live query answered
    Pass,
    /// Anything else
    Fail,
}

/// Outcome of one verification run, appended to the audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    /// Backup that was verified; `None` if selection failed
    pub source_backup_key: Option<String>,
    /// Tier of the verified backup
    pub tier: Option<Tier>,
    /// When the run started
    pub ran_at: DateTime<Utc>,
    /// Verdict
    pub outcome: VerificationOutcome,
    /// Reason for a failure, or a summary of what passed
    pub detail: String,
    /// Scratch target used, if one was provisioned
    pub target: Option<String>,
    /// Classification of the failure; `None` when the run passed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl VerificationResult {
    /// Whether the backup verified
    pub fn passed(&self) -> bool {
        self.outcome == VerificationOutcome::Pass
    }
}

/// Verification settings
#[derive(Debug, Clone)]
pub struct VerifierSettings {
    /// Identifier of the production database; never used as a scratch target
    pub production_identifier: String,
    /// At least one of these must exist after restore; empty means any collection
    pub expected_collections: Vec<String>,
    /// Wall-clock budget for restore and validation
    pub run_budget: Duration,
}

/// Runs verifications
pub struct Verifier {
    store: Arc<dyn ObjectStore>,
    catalog: Catalog,
    keys: Arc<dyn KeyProvider>,
    scratch: Arc<dyn ScratchProvisioner>,
    leases: LeaseManager,
    notifier: NotificationDispatcher,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    settings: VerifierSettings,
}

impl Verifier {
    /// Create a verifier
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        keys: Arc<dyn KeyProvider>,
        scratch: Arc<dyn ScratchProvisioner>,
        leases: LeaseManager,
        notifier: NotificationDispatcher,
        audit: AuditLog,
        clock: Arc<dyn Clock>,
        settings: VerifierSettings,
    ) -> Self {
        Self {
            catalog: Catalog::new(store.clone()),
            store,
            keys,
            scratch,
            leases,
            notifier,
            audit,
            clock,
            settings,
        }
    }

    /// Verify the selected backup. Never fails: every problem is a `Fail` result.
    #[instrument(skip(self, selector, cancel), fields(selector = %selector))]
    pub async fn verify(&self, selector: &VerificationSelector, cancel: &CancellationToken) -> VerificationResult {
        let started = Instant::now();
        let ran_at = self.clock.now();

        let mut result = VerificationResult {
            source_backup_key: None,
            tier: None,
            ran_at,
            outcome: VerificationOutcome::Fail,
            detail: String::new(),
            target: None,
            error_kind: None,
        };

        match self.run(selector, cancel, &mut result).await {
            Ok(detail) => {
                result.outcome = VerificationOutcome::Pass;
                result.detail = detail;
                info!(
                    key = result.source_backup_key.as_deref().unwrap_or(""),
                    target = result.target.as_deref().unwrap_or(""),
                    "Verification passed"
                );
            }
            Err(e) => {
                result.detail = e.to_string();
                result.error_kind = Some(e.kind());
                error!(
                    key = result.source_backup_key.as_deref().unwrap_or(""),
                    error = %e,
                    "Verification failed"
                );
            }
        }

        let tier_label = result.tier.map(|t| t.as_str()).unwrap_or("unknown");
        OrchestratorMetrics::record_run("verification", tier_label, result.passed(), started.elapsed());
        self.audit.record(AUDIT_KIND, ran_at, &result).await;

        let event_type = if result.passed() {
            EventType::VerificationPassed
        } else {
            EventType::VerificationFailed
        };
        let event = NotificationEvent::new(
            event_type,
            result.tier,
            result.source_backup_key.clone(),
            self.clock.now(),
            result.detail.clone(),
        );
        self.notifier.publish_best_effort(event).await;

        result
    }

    async fn run(
        &self,
        selector: &VerificationSelector,
        cancel: &CancellationToken,
        result: &mut VerificationResult,
    ) -> Result<String> {
        let record = match selector {
            VerificationSelector::Latest(tier) => self
                .catalog
                .latest(*tier)
                .await?
                .ok_or_else(|| OrchestratorError::NotFound(format!("no committed {} backup", tier)))?,
            VerificationSelector::Key(key) => self
                .catalog
                .get(key)
                .await?
                .ok_or_else(|| OrchestratorError::NotFound(format!("no catalog record for {}", key)))?,
        };
        result.source_backup_key = Some(record.key.clone());
        result.tier = Some(record.tier);

        let target = self.scratch.provision().await?;
        result.target = Some(target.identifier().to_string());

        if target.is_production() || target.identifier() == self.settings.production_identifier {
            // Not ours to tear down
            return Err(OrchestratorError::Invalid(format!(
                "refusing to verify into production target {}",
                target.identifier()
            )));
        }

        let outcome = match self.leases.acquire(&format!("target-{}", target.identifier())).await {
            Ok(lease) => {
                let outcome = self.check_within_budget(&record, target.as_ref(), cancel).await;
                lease.release().await;
                outcome
            }
            Err(e) => Err(e),
        };

        let name = target.identifier().to_string();
        if let Err(e) = self.scratch.teardown(target).await {
            warn!(target = %name, error = %e, "Scratch teardown failed");
            OrchestratorMetrics::record_cleanup_failure("scratch_teardown");
        }

        outcome
    }

    async fn check_within_budget(
        &self,
        record: &BackupRecord,
        target: &dyn DatabaseTarget,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let budget = self.settings.run_budget;
        let run_cancel = cancel.child_token();

        tokio::select! {
            checked = self.check(record, target, &run_cancel) => checked,
            _ = tokio::time::sleep(budget) => {
                run_cancel.cancel();
                Err(OrchestratorError::Timeout(budget))
            }
            _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
        }
    }

    async fn check(
        &self,
        record: &BackupRecord,
        target: &dyn DatabaseTarget,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let key = self.keys.resolve(&record.encryption_key_ref).await?;
        pipeline::restore_into(self.store.as_ref(), record, &key, target, cancel).await?;

        let mut export = target.open_dump_stream().await?;
        let restored = match pipeline::digest_stream(&mut export, EXPORT_CHUNK, cancel).await {
            Ok(summary) => summary.checksum,
            Err(OrchestratorError::Io(e)) => {
                return Err(OrchestratorError::Target(format!("export after restore failed: {}", e)))
            }
            Err(e) => return Err(e),
        };
        if restored != record.checksum {
            return Err(OrchestratorError::Integrity(format!(
                "restored dataset checksum {} does not match recorded {}",
                restored, record.checksum
            )));
        }

        let collections = target
            .list_collections()
            .await
            .map_err(|e| OrchestratorError::Target(format!("live query failed: {}", e)))?;
        let expected = &self.settings.expected_collections;
        let found = if expected.is_empty() {
            !collections.is_empty()
        } else {
            expected.iter().any(|name| collections.contains(name))
        };
        if !found {
            return Err(OrchestratorError::Target(format!(
                "live query found none of the expected collections (have {:?})",
                collections
            )));
        }

        Ok(format!(
            "restored {} bytes into {}, checksum matched, {} collections",
            record.size_bytes,
            target.identifier(),
            collections.len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupExecutor, ExecutorSettings};
    use crate::clock::ManualClock;
    use crate::crypto::StaticKeyProvider;
    use crate::notify::MemoryTopic;
    use crate::pipeline::SealOptions;
    use crate::resilience::RetryConfig;
    use crate::source::{MemoryDatabase, MemoryScratchProvisioner};
    use crate::store::MemoryObjectStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryObjectStore>,
        topic: Arc<MemoryTopic>,
        scratch: Arc<MemoryScratchProvisioner>,
        executor: BackupExecutor,
        verifier: Verifier,
        production: MemoryDatabase,
        audit: AuditLog,
    }

    fn fixture_with(scratch_provisioner: Option<Arc<dyn ScratchProvisioner>>) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 15, 7, 0, 0).unwrap()));
        let store = Arc::new(MemoryObjectStore::with_clock(clock.clone()));
        let topic = Arc::new(MemoryTopic::new());
        let keys: Arc<dyn KeyProvider> = Arc::new(StaticKeyProvider::generated("test-key"));
        let leases = LeaseManager::new(store.clone(), clock.clone(), Duration::from_secs(600));
        let notifier = NotificationDispatcher::new(topic.clone(), RetryConfig::none());
        let scratch = Arc::new(MemoryScratchProvisioner::new());
        let audit = AuditLog::new();

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
        let verifier = Verifier::new(
            store.clone(),
            keys,
            scratch_provisioner.unwrap_or_else(|| scratch.clone() as Arc<dyn ScratchProvisioner>),
            leases,
            notifier,
            audit.clone(),
            clock,
            VerifierSettings {
                production_identifier: "primary".to_string(),
                expected_collections: vec!["users".to_string()],
                run_budget: Duration::from_secs(30),
            },
        );

        let production = MemoryDatabase::production("primary");
        production.insert("users", json!({"name": "ada"}));
        production.insert("orders", json!({"total": 12}));

        Fixture {
            store,
            topic,
            scratch,
            executor,
            verifier,
            production,
            audit,
        }
    }

    #[tokio::test]
    async fn test_backup_then_verify_passes() {
        let f = fixture_with(None);
        let record = f
            .executor
            .run(Tier::Daily, &f.production, &CancellationToken::new())
            .await
            .unwrap();

        let result = f
            .verifier
            .verify(&VerificationSelector::Latest(Tier::Daily), &CancellationToken::new())
            .await;

        assert!(result.passed(), "{}", result.detail);
        assert_eq!(result.source_backup_key.as_deref(), Some(record.key.as_str()));
        assert_eq!(result.target.as_deref(), Some("verify-scratch-1"));
        assert_eq!(f.scratch.torn_down(), vec!["verify-scratch-1"]);
        assert!(f.scratch.live().is_empty());
        assert_eq!(f.topic.events_of(EventType::VerificationPassed).len(), 1);
        assert_eq!(f.audit.entries_of(AUDIT_KIND).await.len(), 1);
    }

    #[tokio::test]
    async fn test_tampered_backup_fails_and_still_tears_down() {
        let f = fixture_with(None);
        let record = f
            .executor
            .run(Tier::Daily, &f.production, &CancellationToken::new())
            .await
            .unwrap();
        assert!(f.store.tamper(&record.key, vec![0u8; 64]));

        let result = f
            .verifier
            .verify(&VerificationSelector::Key(record.key.clone()), &CancellationToken::new())
            .await;

        assert_eq!(result.outcome, VerificationOutcome::Fail);
        assert_eq!(f.scratch.torn_down(), vec!["verify-scratch-1"]);
        assert_eq!(f.topic.events_of(EventType::VerificationFailed).len(), 1);
    }

    #[tokio::test]
    async fn test_missing_collection_fails_live_query() {
        let f = fixture_with(None);
        let other = MemoryDatabase::production("primary");
        other.insert("orders", json!({"total": 1}));
        f.executor.run(Tier::Weekly, &other, &CancellationToken::new()).await.unwrap();

        let result = f
            .verifier
            .verify(&VerificationSelector::Latest(Tier::Weekly), &CancellationToken::new())
            .await;
        assert!(!result.passed());
        assert!(result.detail.contains("live query"), "{}", result.detail);
    }

    #[tokio::test]
    async fn test_nothing_to_verify() {
        let f = fixture_with(None);
        let result = f
            .verifier
            .verify(&VerificationSelector::Latest(Tier::Monthly), &CancellationToken::new())
            .await;
        assert!(!result.passed());
        assert!(result.source_backup_key.is_none());
        assert!(f.scratch.provisioned().is_empty());
    }

    struct ProductionHandingProvisioner(Arc<MemoryDatabase>);

    #[async_trait]
    impl ScratchProvisioner for ProductionHandingProvisioner {
        async fn provision(&self) -> Result<Arc<dyn DatabaseTarget>> {
            Ok(self.0.clone())
        }

        async fn teardown(&self, _target: Arc<dyn DatabaseTarget>) -> Result<()> {
            panic!("production must never be torn down");
        }
    }

    #[tokio::test]
    async fn test_refuses_production_target() {
        let production = Arc::new(MemoryDatabase::production("primary"));
        production.insert("users", json!({"name": "ada"}));
        let f = fixture_with(Some(Arc::new(ProductionHandingProvisioner(production.clone()))));
        f.executor
            .run(Tier::Daily, &*production, &CancellationToken::new())
            .await
            .unwrap();

        let result = f
            .verifier
            .verify(&VerificationSelector::Latest(Tier::Daily), &CancellationToken::new())
            .await;
        assert!(!result.passed());
        assert_eq!(production.restore_count(), 0);
    }

    #[test]
    fn test_selector_parsing() {
        assert_eq!(VerificationSelector::parse("daily"), VerificationSelector::Latest(Tier::Daily));
        assert_eq!(
            VerificationSelector::parse("daily/2025-01-15T07-00-00Z.archive"),
            VerificationSelector::Key("daily/2025-01-15T07-00-00Z.archive".to_string())
        );
    }
}
