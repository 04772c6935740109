//! Entry points invoked by the scheduler and by operators.
//!
//! Each entry point is independent: it builds nothing that outlives the call apart
//! from what it writes to the object store, and it reports a [`RunResult`] whose
//! [`RunResult::exit_code`] a wrapper script can hand straight back to the scheduler.

use crate::audit::AuditLog;
use crate::backup::{BackupExecutor, BackupRecord, Catalog, ExecutorSettings, Tier};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, OrchestratorConfig, StoreBackend};
use crate::crypto::{EnvKeyProvider, KeyProvider};
use crate::lease::LeaseManager;
use crate::notify::{EventSink, EventType, LogSink, NotificationDispatcher, NotificationEvent};
use crate::pipeline::SealOptions;
use crate::restore::{RestoreRequest, Restorer};
use crate::retention::{RetentionSweeper, SweepReport};
use crate::source::{CommandScratchProvisioner, CommandTarget, DatabaseTarget, ScratchProvisioner};
use crate::store::{LocalObjectStore, MemoryObjectStore, ObjectStore};
use crate::verify::{VerificationSelector, Verifier, VerifierSettings};
use crate::{ErrorKind, OrchestratorError, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Outcome of an entry point
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// Whether the operation succeeded
    pub success: bool,
    /// Summary or failure reason
    pub detail: String,
    /// Backup key produced, verified or restored
    pub record_key: Option<String>,
    /// Failure classification
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl RunResult {
    fn ok(detail: impl Into<String>, record_key: Option<String>) -> Self {
        Self {
            success: true,
            detail: detail.into(),
            record_key,
            error_kind: None,
        }
    }

    fn failed(error: &OrchestratorError, record_key: Option<String>) -> Self {
        Self {
            success: false,
            detail: error.to_string(),
            record_key,
            error_kind: Some(error.kind()),
        }
    }

    /// Process exit status: 0 on success, 2 for an unconfirmed restore, 75
    /// (`EX_TEMPFAIL`) when re-invoking later may succeed, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.success {
            return 0;
        }
        match self.error_kind {
            Some(ErrorKind::NotConfirmed) => 2,
            Some(ErrorKind::Busy) | Some(ErrorKind::Transient) | Some(ErrorKind::Timeout) => 75,
            _ => 1,
        }
    }
}

/// Wires the components together
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    catalog: Catalog,
    production: Arc<dyn DatabaseTarget>,
    notifier: NotificationDispatcher,
    executor: BackupExecutor,
    verifier: Verifier,
    restorer: Restorer,
    sweeper: RetentionSweeper,
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    store: Option<Arc<dyn ObjectStore>>,
    keys: Option<Arc<dyn KeyProvider>>,
    sink: Option<Arc<dyn EventSink>>,
    production: Option<Arc<dyn DatabaseTarget>>,
    scratch: Option<Arc<dyn ScratchProvisioner>>,
    clock: Option<Arc<dyn Clock>>,
    audit: Option<AuditLog>,
    restore_targets: Vec<Arc<dyn DatabaseTarget>>,
}

impl OrchestratorBuilder {
    /// Object store for artifacts, catalog, leases and audit entries
    pub fn store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Resolves `encryption_key_ref`
    pub fn keys(mut self, keys: Arc<dyn KeyProvider>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Notification sink; defaults to logging events
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Database that is backed up and, by default, restored
    pub fn production(mut self, production: Arc<dyn DatabaseTarget>) -> Self {
        self.production = Some(production);
        self
    }

    /// Scratch targets for verification
    pub fn scratch(mut self, scratch: Arc<dyn ScratchProvisioner>) -> Self {
        self.scratch = Some(scratch);
        self
    }

    /// Time source; defaults to the system clock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Audit log; defaults to one persisted in the store
    pub fn audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Register an additional restore target
    pub fn restore_target(mut self, target: Arc<dyn DatabaseTarget>) -> Self {
        self.restore_targets.push(target);
        self
    }

    /// Validate the configuration and assemble the orchestrator
    pub fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        config.validate()?;

        let store = self.store.ok_or(ConfigError::Missing("store"))?;
        let keys = self.keys.ok_or(ConfigError::Missing("keys"))?;
        let production = self.production.ok_or(ConfigError::Missing("restore_target"))?;
        let scratch = self.scratch.ok_or(ConfigError::Missing("verification_target"))?;
        let sink = self.sink.unwrap_or_else(|| Arc::new(LogSink) as Arc<dyn EventSink>);
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let audit = self.audit.unwrap_or_else(|| AuditLog::with_store(store.clone()));

        let leases = LeaseManager::new(store.clone(), clock.clone(), config.lease_ttl())
            .with_renew_interval(config.lease_renew_interval());
        let notifier = NotificationDispatcher::new(sink, config.notification_retry.clone());

        let executor = BackupExecutor::new(
            store.clone(),
            keys.clone(),
            leases.clone(),
            notifier.clone(),
            clock.clone(),
            ExecutorSettings {
                encryption_key_ref: config.encryption_key_ref.clone(),
                seal: SealOptions {
                    chunk_size: config.chunk_size_bytes,
                    compress: config.compression,
                },
                run_budget: config.operation_timeout(),
                store_op_timeout: config.store_op_timeout(),
            },
        );

        let verifier = Verifier::new(
            store.clone(),
            keys.clone(),
            scratch,
            leases.clone(),
            notifier.clone(),
            audit.clone(),
            clock.clone(),
            VerifierSettings {
                production_identifier: production.identifier().to_string(),
                expected_collections: config.verification.expected_collections.clone(),
                run_budget: config.operation_timeout(),
            },
        );

        let mut targets = vec![production.clone()];
        targets.extend(self.restore_targets);
        let restorer = Restorer::new(
            store.clone(),
            keys,
            executor.clone(),
            targets,
            leases,
            notifier.clone(),
            audit,
            clock.clone(),
            config.operation_timeout(),
        );

        let sweeper = RetentionSweeper::new(store.clone(), config.retention.clone(), config.orphan_grace());

        Ok(Orchestrator {
            catalog: Catalog::new(store.clone()),
            config,
            store,
            clock,
            production,
            notifier,
            executor,
            verifier,
            restorer,
            sweeper,
        })
    }
}

impl Orchestrator {
    /// Start building
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            store: None,
            keys: None,
            sink: None,
            production: None,
            scratch: None,
            clock: None,
            audit: None,
            restore_targets: Vec::new(),
        }
    }

    /// Assemble from configuration alone: command-driven targets, keys from the
    /// environment and the configured store backend
    pub async fn from_config(config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn ObjectStore> = match config.store_backend {
            StoreBackend::Memory => Arc::new(MemoryObjectStore::new()),
            StoreBackend::Local => {
                let root = config.local_root.clone().ok_or(ConfigError::Missing("local_root"))?;
                Arc::new(LocalObjectStore::new(root))
            }
            StoreBackend::S3 => s3_store(&config).await?,
        };
        let production = config
            .restore_target
            .clone()
            .ok_or(ConfigError::Missing("restore_target"))?;
        let scratch = config
            .verification_target
            .clone()
            .ok_or(ConfigError::Missing("verification_target"))?;
        let sink = event_sink(&config).await;

        Self::builder(config)
            .store(store)
            .keys(Arc::new(EnvKeyProvider))
            .sink(sink)
            .production(Arc::new(CommandTarget::new(production)))
            .scratch(Arc::new(CommandScratchProvisioner::new(scratch)))
            .build()
    }

    /// Configuration in use
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Catalog of committed backups
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Back up the production database into `tier`
    pub async fn run_backup(&self, tier: &str) -> RunResult {
        self.run_backup_with_cancel(tier, &CancellationToken::new()).await
    }

    /// [`Orchestrator::run_backup`] with caller-controlled cancellation
    #[instrument(skip(self, cancel))]
    pub async fn run_backup_with_cancel(&self, tier: &str, cancel: &CancellationToken) -> RunResult {
        let tier = match schedulable_tier(tier) {
            Ok(tier) => tier,
            Err(e) => {
                warn!(error = %e, "Rejected backup request");
                let event = NotificationEvent::new(EventType::BackupFailed, None, None, self.clock.now(), e.to_string());
                self.notifier.publish_best_effort(event).await;
                return RunResult::failed(&e, None);
            }
        };

        match self.executor.run(tier, self.production.as_ref(), cancel).await {
            Ok(record) => RunResult::ok(
                format!("{} bytes from {} backed up", record.size_bytes, record.source),
                Some(record.key),
            ),
            Err(e) => RunResult::failed(&e, None),
        }
    }

    /// Verify the latest backup of a tier, or a specific backup key
    pub async fn run_verification(&self, selector: &str) -> RunResult {
        self.run_verification_with_cancel(selector, &CancellationToken::new()).await
    }

    /// [`Orchestrator::run_verification`] with caller-controlled cancellation
    #[instrument(skip(self, cancel))]
    pub async fn run_verification_with_cancel(&self, selector: &str, cancel: &CancellationToken) -> RunResult {
        let result = self.verifier.verify(&VerificationSelector::parse(selector), cancel).await;
        let passed = result.passed();
        RunResult {
            success: passed,
            detail: result.detail,
            record_key: result.source_backup_key,
            error_kind: if passed {
                None
            } else {
                Some(result.error_kind.unwrap_or(ErrorKind::Integrity))
            },
        }
    }

    /// Restore `backup_key` into `target`
    pub async fn run_restore(&self, confirmation_token: &str, backup_key: &str, target: &str) -> RunResult {
        self.run_restore_as(RestoreRequest {
            confirmation_token: confirmation_token.to_string(),
            source_backup_key: backup_key.to_string(),
            target_identifier: target.to_string(),
            requested_by: "unknown".to_string(),
        })
        .await
    }

    /// Restore with full request details
    pub async fn run_restore_as(&self, request: RestoreRequest) -> RunResult {
        let key = request.source_backup_key.clone();
        match self.restorer.restore(request, &CancellationToken::new()).await {
            Ok(operation) => RunResult::ok(
                format!(
                    "restored into {}; safety backup {}",
                    operation.target_identifier,
                    operation.safety_backup_key.as_deref().unwrap_or("none")
                ),
                Some(key),
            ),
            Err(e) => RunResult::failed(&e, Some(key)),
        }
    }

    /// Apply retention to every tier
    pub async fn retention_sweep(&self) -> Result<SweepReport> {
        self.sweeper.sweep(self.clock.now()).await
    }

    /// [`Orchestrator::retention_sweep`] as an entry point
    pub async fn run_retention_sweep(&self) -> RunResult {
        match self.retention_sweep().await {
            Ok(report) => {
                let detail = format!(
                    "{} examined, {} expired, {} transitioned, {} orphans deleted, {} errors",
                    report.examined,
                    report.expired.len(),
                    report.transitioned.len(),
                    report.orphans_deleted.len(),
                    report.errors.len()
                );
                info!(detail = %detail, "Retention sweep complete");
                RunResult {
                    success: report.errors.is_empty(),
                    detail,
                    record_key: None,
                    error_kind: (!report.errors.is_empty()).then_some(ErrorKind::Permanent),
                }
            }
            Err(e) => RunResult::failed(&e, None),
        }
    }

    /// Committed backups of a tier, oldest first
    pub async fn list_backups(&self, tier: Tier) -> Result<Vec<BackupRecord>> {
        self.catalog.list(tier).await
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }
}

fn schedulable_tier(input: &str) -> Result<Tier> {
    let tier: Tier = input.parse()?;
    if !tier.is_schedulable() {
        return Err(OrchestratorError::Invalid(format!("tier {} cannot be scheduled", tier)));
    }
    Ok(tier)
}

#[cfg(feature = "aws")]
async fn s3_store(config: &OrchestratorConfig) -> Result<Arc<dyn ObjectStore>> {
    use crate::store::{S3ObjectStore, S3StoreConfig};
    let store = S3ObjectStore::new(S3StoreConfig {
        bucket_name: config.bucket.clone(),
        region: config.region.clone(),
        endpoint_url: config.endpoint_url.clone(),
        force_path_style: config.endpoint_url.is_some(),
        kms_key_id: None,
    })
    .await;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "aws"))]
async fn s3_store(_config: &OrchestratorConfig) -> Result<Arc<dyn ObjectStore>> {
    Err(ConfigError::Invalid {
        field: "store_backend",
        reason: "s3 requires the `aws` feature".to_string(),
    }
    .into())
}

#[cfg(feature = "aws")]
async fn event_sink(config: &OrchestratorConfig) -> Arc<dyn EventSink> {
    if config.notification_topic.starts_with("arn:") {
        Arc::new(crate::notify::SnsTopic::new(config.notification_topic.clone(), config.region.clone()).await)
    } else {
        Arc::new(LogSink)
    }
}

#[cfg(not(feature = "aws"))]
async fn event_sink(_config: &OrchestratorConfig) -> Arc<dyn EventSink> {
    Arc::new(LogSink)
}
