//! Prometheus metrics for backup, verification, restore and retention runs
//!
//! Everything is registered in the default registry so an embedding process can
//! expose it next to its own metrics.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec, TextEncoder,
};
use std::time::Duration;

lazy_static! {
    /// Runs by operation, tier and outcome
    pub static ref RUNS: IntCounterVec = register_int_counter_vec!(
        "backup_orchestrator_runs_total",
        "Total number of orchestrator runs",
        &["operation", "tier", "outcome"]
    ).unwrap();

    /// Plaintext bytes captured by successful backups
    pub static ref BYTES_BACKED_UP: IntCounterVec = register_int_counter_vec!(
        "backup_orchestrator_bytes_backed_up_total",
        "Plaintext bytes captured by successful backups",
        &["tier"]
    ).unwrap();

    /// Wall-clock duration of runs
    pub static ref RUN_DURATION: HistogramVec = register_histogram_vec!(
        "backup_orchestrator_run_duration_seconds",
        "Run duration in seconds",
        &["operation", "tier"],
        vec![0.1, 1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0]
    ).unwrap();

    /// Events that could not be delivered after retries
    pub static ref NOTIFICATION_FAILURES: IntCounterVec = register_int_counter_vec!(
        "backup_orchestrator_notification_failures_total",
        "Events that could not be delivered to the topic",
        &["event_type"]
    ).unwrap();

    /// Objects touched by the retention sweep
    pub static ref RETENTION_ACTIONS: IntCounterVec = register_int_counter_vec!(
        "backup_orchestrator_retention_actions_total",
        "Retention sweep actions",
        &["tier", "action"]
    ).unwrap();

    /// Best-effort cleanups that failed
    pub static ref CLEANUP_FAILURES: IntCounterVec = register_int_counter_vec!(
        "backup_orchestrator_cleanup_failures_total",
        "Best-effort cleanup steps that failed",
        &["step"]
    ).unwrap();
}

/// Metric recording helpers
pub struct OrchestratorMetrics;

impl OrchestratorMetrics {
    /// Record a finished run
    pub fn record_run(operation: &str, tier: &str, success: bool, elapsed: Duration) {
        let outcome = if success { "success" } else { "failure" };
        RUNS.with_label_values(&[operation, tier, outcome]).inc();
        RUN_DURATION
            .with_label_values(&[operation, tier])
            .observe(elapsed.as_secs_f64());
    }

    /// Record a run rejected because another one holds the lease
    pub fn record_busy(operation: &str, tier: &str) {
        RUNS.with_label_values(&[operation, tier, "busy"]).inc();
    }

    /// Record captured plaintext bytes
    pub fn record_bytes(tier: &str, bytes: u64) {
        BYTES_BACKED_UP.with_label_values(&[tier]).inc_by(bytes);
    }

    /// Record an undeliverable notification
    pub fn record_notification_failure(event_type: &str) {
        NOTIFICATION_FAILURES.with_label_values(&[event_type]).inc();
    }

    /// Record a retention action (`expired`, `transitioned`, `orphan_deleted`)
    pub fn record_retention(tier: &str, action: &str) {
        RETENTION_ACTIONS.with_label_values(&[tier, action]).inc();
    }

    /// Record a failed cleanup step
    pub fn record_cleanup_failure(step: &str) {
        CLEANUP_FAILURES.with_label_values(&[step]).inc();
    }
}

/// All registered metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| format!("Failed to convert metrics to UTF-8: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_recorded_runs() {
        OrchestratorMetrics::record_run("backup", "daily", true, Duration::from_millis(20));
        OrchestratorMetrics::record_bytes("daily", 1024);

        let text = gather_metrics().expect("encode");
        assert!(text.contains("backup_orchestrator_runs_total"));
        assert!(text.contains("backup_orchestrator_bytes_backed_up_total"));
    }
}
