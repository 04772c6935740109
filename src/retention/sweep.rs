use super::RetentionSchedule;
use crate::backup::{Catalog, Tier, TEMP_PREFIX};
use crate::metrics::OrchestratorMetrics;
use crate::store::{ObjectStore, StorageClass};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What a sweep did
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Catalogued backups looked at
    pub examined: usize,
    /// Keys deleted because their tier's expiry elapsed
    pub expired: Vec<String>,
    /// Keys moved to a colder class
    pub transitioned: Vec<(String, StorageClass)>,
    /// Keys due a colder class but already archived; a bucket lifecycle rule moves them
    pub left_archived: Vec<String>,
    /// Staging and uncommitted objects removed
    pub orphans_deleted: Vec<String>,
    /// Per-object failures; the sweep continues past them
    pub errors: Vec<String>,
}

/// Applies retention policies to the catalog and cleans up after crashed runs
pub struct RetentionSweeper {
    store: Arc<dyn ObjectStore>,
    catalog: Catalog,
    schedule: RetentionSchedule,
    orphan_grace: Duration,
}

impl RetentionSweeper {
    /// Create a sweeper. Objects outside the catalog are only removed once they are
    /// older than `orphan_grace`, which must exceed the longest possible run.
    pub fn new(store: Arc<dyn ObjectStore>, schedule: RetentionSchedule, orphan_grace: Duration) -> Self {
        Self {
            catalog: Catalog::new(store.clone()),
            store,
            schedule,
            orphan_grace,
        }
    }

    /// One pass over every tier
    #[instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for tier in Tier::ALL {
            let committed = self.sweep_tier(tier, now, &mut report).await?;
            self.sweep_uncommitted(tier, &committed, now, &mut report).await?;
        }
        self.sweep_staging(now, &mut report).await?;

        info!(
            examined = report.examined,
            expired = report.expired.len(),
            transitioned = report.transitioned.len(),
            left_archived = report.left_archived.len(),
            orphans = report.orphans_deleted.len(),
            errors = report.errors.len(),
            "Retention sweep finished"
        );
        Ok(report)
    }

    /// Expire and transition catalogued backups; returns the keys still committed
    async fn sweep_tier(&self, tier: Tier, now: DateTime<Utc>, report: &mut SweepReport) -> Result<HashSet<String>> {
        let policy = self.schedule.policy(tier);
        let mut committed = HashSet::new();

        for key in self.catalog.list_keys(tier).await? {
            let record = match self.catalog.get(&key).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    // Keep the data; an unreadable record still marks it committed
                    report.errors.push(format!("{}: unreadable record: {}", key, e));
                    committed.insert(key);
                    continue;
                }
            };
            report.examined += 1;

            if policy.should_expire(&record, now) {
                // Record first: a half-finished expiry leaves an orphan, never a
                // record pointing at nothing
                if let Err(e) = self.catalog.remove(&key).await {
                    report.errors.push(format!("{}: {}", key, e));
                    committed.insert(key);
                    continue;
                }
                if let Err(e) = self.store.delete(&key).await {
                    warn!(key = %key, error = %e, "Expired record removed but data delete failed");
                    report.errors.push(format!("{}: {}", key, e));
                }
                debug!(key = %key, "Expired backup");
                OrchestratorMetrics::record_retention(tier.as_str(), "expired");
                report.expired.push(key);
                continue;
            }

            committed.insert(key.clone());
            let target = policy.target_storage_class(&record, now);
            let current = match self.store.head(&key).await {
                Ok(Some(info)) => info.metadata.storage_class,
                Ok(None) => {
                    report.errors.push(format!("{}: catalogued but data object missing", key));
                    continue;
                }
                Err(e) => {
                    report.errors.push(format!("{}: {}", key, e));
                    continue;
                }
            };

            if target > current && current.is_archived() {
                debug!(key = %key, from = %current, to = %target, "Archived backup left to bucket lifecycle");
                report.left_archived.push(key);
            } else if target > current {
                match self.store.transition(&key, target).await {
                    Ok(()) => {
                        debug!(key = %key, from = %current, to = %target, "Transitioned backup");
                        OrchestratorMetrics::record_retention(tier.as_str(), "transitioned");
                        report.transitioned.push((key, target));
                    }
                    Err(e) => report.errors.push(format!("{}: {}", key, e)),
                }
            }
        }

        Ok(committed)
    }

    /// Data objects under a tier prefix that never made it into the catalog
    async fn sweep_uncommitted(
        &self,
        tier: Tier,
        committed: &HashSet<String>,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<()> {
        for key in self.store.list(&tier.data_prefix()).await? {
            if committed.contains(&key) || report.expired.contains(&key) {
                continue;
            }
            self.delete_if_stale(&key, tier.as_str(), now, report).await;
        }
        Ok(())
    }

    async fn sweep_staging(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<()> {
        for key in self.store.list(TEMP_PREFIX).await? {
            self.delete_if_stale(&key, "staging", now, report).await;
        }
        Ok(())
    }

    async fn delete_if_stale(&self, key: &str, label: &str, now: DateTime<Utc>, report: &mut SweepReport) {
        let info = match self.store.head(key).await {
            Ok(Some(info)) => info,
            Ok(None) => return,
            Err(e) => {
                report.errors.push(format!("{}: {}", key, e));
                return;
            }
        };
        if now - info.last_modified <= self.orphan_grace {
            return;
        }
        match self.store.delete(key).await {
            Ok(()) => {
                info!(key = %key, "Deleted orphaned object");
                OrchestratorMetrics::record_retention(label, "orphan_deleted");
                report.orphans_deleted.push(key.to_string());
            }
            Err(e) => report.errors.push(format!("{}: {}", key, e)),
        }
    }
}
