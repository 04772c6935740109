// Integration tests for backup runs, the catalog commit point and tier leases

mod common;

use backup_orchestrator::backup::{parse_backup_key, Tier};
use backup_orchestrator::notify::EventType;
use backup_orchestrator::pipeline::sha256_hex;
use backup_orchestrator::retention::RetentionPolicy;
use backup_orchestrator::store::ObjectStore;
use backup_orchestrator::{ErrorKind, OrchestratorConfig, OrchestratorError};
use common::{harness, harness_with, t0};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_daily_backup_then_verification_scenario() {
    let h = harness();

    let backup = h.orchestrator.run_backup("daily").await;
    assert!(backup.success, "{}", backup.detail);
    assert_eq!(backup.record_key.as_deref(), Some("daily/2025-01-15T07-00-00Z.archive"));

    h.clock.advance(chrono::Duration::minutes(10));
    let verification = h.orchestrator.run_verification("daily").await;
    assert!(verification.success, "{}", verification.detail);
    assert_eq!(verification.exit_code(), 0);
    assert_eq!(verification.record_key, backup.record_key);

    assert_eq!(h.scratch.provisioned(), vec!["verify-scratch-1"]);
    assert_eq!(h.scratch.torn_down(), vec!["verify-scratch-1"]);
    assert!(h.scratch.live().is_empty());

    let passed = h.topic.events_of(EventType::VerificationPassed);
    assert_eq!(passed.len(), 1);
    assert_eq!(passed[0].key.as_deref(), Some("daily/2025-01-15T07-00-00Z.archive"));
    assert_eq!(passed[0].timestamp, t0() + chrono::Duration::minutes(10));
}

#[tokio::test]
async fn test_record_matches_plaintext_dump() {
    let h = harness();
    let result = h.orchestrator.run_backup("weekly").await;
    assert!(result.success);

    let records = h.orchestrator.list_backups(Tier::Weekly).await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.tier, Tier::Weekly);
    assert_eq!(record.created_at, t0());
    assert_eq!(record.checksum, sha256_hex(&h.production.export().unwrap()));
    assert_eq!(record.size_bytes, h.production.export().unwrap().len() as u64);
    assert_eq!(record.encryption_key_ref, "test-key");
    assert_eq!(record.source, "primary");

    let succeeded = h.topic.events_of(EventType::BackupSucceeded);
    assert_eq!(succeeded.len(), 1);
    assert_eq!(succeeded[0].size_bytes, Some(record.size_bytes));

    // The stored artifact is sealed, never the plaintext
    let (stored, _) = h.memory().get_bytes(&record.key).await.unwrap();
    assert!(!stored
        .windows(b"grace".len())
        .any(|window| window == b"grace"));
}

#[tokio::test]
async fn test_keys_are_unique_and_ordered_within_a_tier() {
    let h = harness();
    let mut keys = Vec::new();
    for _ in 0..3 {
        let result = h.orchestrator.run_backup("daily").await;
        keys.push(result.record_key.expect("key"));
    }
    h.clock.advance(chrono::Duration::seconds(1));
    keys.push(h.orchestrator.run_backup("daily").await.record_key.expect("key"));

    assert_eq!(
        keys,
        vec![
            "daily/2025-01-15T07-00-00Z.archive",
            "daily/2025-01-15T07-00-00Z_001.archive",
            "daily/2025-01-15T07-00-00Z_002.archive",
            "daily/2025-01-15T07-00-01Z.archive",
        ]
    );

    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(sorted, keys);
    let parsed: Vec<_> = keys.iter().map(|k| parse_backup_key(k).unwrap().sequence).collect();
    assert_eq!(parsed, vec![0, 1, 2, 0]);
    assert_eq!(h.orchestrator.catalog().list_keys(Tier::Daily).await.unwrap(), keys);
}

#[tokio::test]
async fn test_crash_before_commit_leaves_no_backup() {
    let h = harness();
    h.store.fail_catalog_writes(true);

    let failed = h.orchestrator.run_backup("daily").await;
    assert!(!failed.success);
    assert_eq!(failed.error_kind, Some(ErrorKind::Transient));
    assert_eq!(failed.exit_code(), 75);

    assert!(h.orchestrator.list_backups(Tier::Daily).await.unwrap().is_empty());
    assert!(h.memory().list("daily/").await.unwrap().is_empty());
    assert!(h.memory().list("_tmp/").await.unwrap().is_empty());
    assert!(h.memory().list("locks/").await.unwrap().is_empty());
    assert_eq!(h.topic.events_of(EventType::BackupFailed).len(), 1);
    assert!(h.topic.events_of(EventType::BackupSucceeded).is_empty());

    // Re-invocation after the fault clears is safe and reuses the free key
    h.store.fail_catalog_writes(false);
    let retried = h.orchestrator.run_backup("daily").await;
    assert!(retried.success, "{}", retried.detail);
    assert_eq!(retried.record_key.as_deref(), Some("daily/2025-01-15T07-00-00Z.archive"));
}

#[tokio::test]
async fn test_source_outage_is_permanent_and_published() {
    let h = harness();
    h.production.fail_next_dump();

    let result = h.orchestrator.run_backup("monthly").await;
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::Permanent));
    assert!(result.detail.contains("Source unavailable"), "{}", result.detail);

    let failed = h.topic.events_of(EventType::BackupFailed);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].tier, Some(Tier::Monthly));
    assert!(h.memory().is_empty());
}

#[tokio::test]
async fn test_concurrent_runs_of_one_tier_are_exclusive() {
    let h = Arc::new(harness());
    h.production.pause_dumps();

    let first = {
        let h = h.clone();
        tokio::spawn(async move { h.orchestrator.run_backup("daily").await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.production.dump_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first run reached the dump");

    let second = h.orchestrator.run_backup("daily").await;
    assert!(!second.success);
    assert_eq!(second.error_kind, Some(ErrorKind::Busy));
    assert_eq!(second.exit_code(), 75);

    h.production.resume_dumps();
    let first = first.await.unwrap();
    assert!(first.success, "{}", first.detail);

    assert_eq!(h.orchestrator.list_backups(Tier::Daily).await.unwrap().len(), 1);
    assert_eq!(h.topic.events_of(EventType::BackupSucceeded).len(), 1);
    assert_eq!(h.topic.events_of(EventType::BackupFailed).len(), 1);
}

#[tokio::test]
async fn test_different_tiers_do_not_block_each_other() {
    let h = Arc::new(harness());
    let (daily, weekly) = tokio::join!(
        h.orchestrator.run_backup("daily"),
        h.orchestrator.run_backup("weekly")
    );
    assert!(daily.success, "{}", daily.detail);
    assert!(weekly.success, "{}", weekly.detail);
}

#[test]
fn test_non_monotonic_retention_fails_at_startup() {
    let mut config = OrchestratorConfig::for_testing();
    config.retention.monthly = RetentionPolicy::new(vec![], 30).unwrap();

    let err = backup_orchestrator::Orchestrator::builder(config)
        .build()
        .err()
        .expect("rejected");
    assert!(matches!(err, OrchestratorError::Config(_)));
}

#[tokio::test]
async fn test_uncompressed_backups_verify() {
    let mut config = OrchestratorConfig::for_testing();
    config.compression = false;
    config.chunk_size_bytes = 16;
    let h = harness_with(config);

    let backup = h.orchestrator.run_backup("annual").await;
    assert!(backup.success);
    let record = h
        .orchestrator
        .catalog()
        .get(backup.record_key.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.compression, None);

    let verification = h.orchestrator.run_verification(&record.key).await;
    assert!(verification.success, "{}", verification.detail);
}
