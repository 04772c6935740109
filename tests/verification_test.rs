// Integration tests for restore verification against scratch targets

mod common;

use backup_orchestrator::lease::LeaseManager;
use backup_orchestrator::notify::EventType;
use backup_orchestrator::store::ObjectStore;
use backup_orchestrator::verify::{VerificationOutcome, VerificationResult, AUDIT_KIND};
use backup_orchestrator::ErrorKind;
use common::harness;

#[tokio::test]
async fn test_each_run_gets_a_fresh_scratch_target() {
    let h = harness();
    h.orchestrator.run_backup("daily").await;

    for _ in 0..3 {
        let result = h.orchestrator.run_verification("daily").await;
        assert!(result.success, "{}", result.detail);
    }

    assert_eq!(
        h.scratch.provisioned(),
        vec!["verify-scratch-1", "verify-scratch-2", "verify-scratch-3"]
    );
    assert_eq!(h.scratch.torn_down(), h.scratch.provisioned());
    assert!(h.memory().list("locks/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_latest_backup_is_selected() {
    let h = harness();
    h.orchestrator.run_backup("daily").await;
    h.clock.advance(chrono::Duration::days(1));
    let newest = h.orchestrator.run_backup("daily").await.record_key.unwrap();

    let result = h.orchestrator.run_verification("daily").await;
    assert_eq!(result.record_key.as_deref(), Some(newest.as_str()));
}

#[tokio::test]
async fn test_tampered_artifact_fails_verification_without_touching_it() {
    let h = harness();
    let key = h.orchestrator.run_backup("monthly").await.record_key.unwrap();

    let (sealed, _) = h.memory().get_bytes(&key).await.unwrap();
    let mut corrupted = sealed.to_vec();
    let middle = corrupted.len() / 2;
    corrupted[middle] ^= 0xff;
    assert!(h.memory().tamper(&key, corrupted.clone()));

    let result = h.orchestrator.run_verification(&key).await;
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::Integrity));
    assert_ne!(result.exit_code(), 0);

    // Observational only: the artifact and its record are left as they were
    let (after, _) = h.memory().get_bytes(&key).await.unwrap();
    assert_eq!(after.to_vec(), corrupted);
    assert!(h.orchestrator.catalog().exists(&key).await.unwrap());

    assert_eq!(h.scratch.torn_down(), vec!["verify-scratch-1"]);
    let failed = h.topic.events_of(EventType::VerificationFailed);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].key.as_deref(), Some(key.as_str()));
}

#[tokio::test]
async fn test_teardown_failure_does_not_change_outcome() {
    let h = harness();
    h.orchestrator.run_backup("daily").await;
    h.scratch.fail_next_teardown();

    let result = h.orchestrator.run_verification("daily").await;
    assert!(result.success, "{}", result.detail);
    assert_eq!(h.scratch.live(), vec!["verify-scratch-1"]);
}

#[tokio::test]
async fn test_results_are_audited() {
    let h = harness();
    h.orchestrator.run_verification("weekly").await;
    h.orchestrator.run_backup("weekly").await;
    h.orchestrator.run_verification("weekly").await;

    let entries = h.audit.entries_of(AUDIT_KIND).await;
    assert_eq!(entries.len(), 2);

    let first: VerificationResult = serde_json::from_value(entries[0].payload.clone()).unwrap();
    assert_eq!(first.outcome, VerificationOutcome::Fail);
    assert!(first.source_backup_key.is_none());

    let second: VerificationResult = serde_json::from_value(entries[1].payload.clone()).unwrap();
    assert_eq!(second.outcome, VerificationOutcome::Pass);
    assert_eq!(second.target.as_deref(), Some("verify-scratch-1"));
}

#[tokio::test]
async fn test_unknown_key_fails_cleanly() {
    let h = harness();
    let result = h
        .orchestrator
        .run_verification("daily/2024-01-01T00-00-00Z.archive")
        .await;
    assert!(!result.success);
    assert!(h.scratch.provisioned().is_empty());
    assert_eq!(h.topic.events_of(EventType::VerificationFailed).len(), 1);
}

#[tokio::test]
async fn test_busy_scratch_target_is_retryable() {
    let h = harness();
    h.orchestrator.run_backup("daily").await;

    let leases = LeaseManager::new(h.store.clone(), h.clock.clone(), std::time::Duration::from_secs(600));
    let held = leases.acquire("target-verify-scratch-1").await.unwrap();

    let result = h.orchestrator.run_verification("daily").await;
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::Busy));
    assert_eq!(result.exit_code(), 75);
    // Provisioned, never loaded, still torn down
    assert_eq!(h.scratch.torn_down(), vec!["verify-scratch-1"]);

    held.release().await;
    let retried = h.orchestrator.run_verification("daily").await;
    assert!(retried.success, "{}", retried.detail);
}

#[tokio::test]
async fn test_missing_backup_is_not_an_integrity_failure() {
    let h = harness();
    let result = h.orchestrator.run_verification("monthly").await;
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::Permanent));
    assert_eq!(result.exit_code(), 1);
}
