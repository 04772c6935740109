//! Structured run notifications.
//!
//! Delivery is at-least-once with local retry. Every event carries a deterministic
//! `eventId` so subscribers can drop duplicates. A notification that cannot be
//! delivered never changes the outcome of the run that produced it; it is logged
//! locally instead.

#[cfg(feature = "aws")]
mod sns;

#[cfg(feature = "aws")]
pub use sns::SnsTopic;

use crate::backup::Tier;
use crate::metrics::OrchestratorMetrics;
use crate::resilience::{RetryConfig, RetryExecutor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

/// Namespace for deterministic event ids
const EVENT_NAMESPACE: Uuid = Uuid::from_u128(0x6b1f_4e0c_9a3d_4c57_8e2a_51d0_b7c3_f902);

/// Event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A backup was committed
    BackupSucceeded,
    /// A backup run failed
    BackupFailed,
    /// A backup restored and validated
    VerificationPassed,
    /// Verification could not confirm a backup
    VerificationFailed,
    /// A restore completed
    RestoreCompleted,
    /// A restore failed
    RestoreFailed,
}

impl EventType {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::BackupSucceeded => "BackupSucceeded",
            EventType::BackupFailed => "BackupFailed",
            EventType::VerificationPassed => "VerificationPassed",
            EventType::VerificationFailed => "VerificationFailed",
            EventType::RestoreCompleted => "RestoreCompleted",
            EventType::RestoreFailed => "RestoreFailed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    /// Deterministic id for de-duplication
    pub event_id: Uuid,
    /// What happened
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Tier concerned, if any
    pub tier: Option<Tier>,
    /// Backup key concerned, if any
    pub key: Option<String>,
    /// When it happened
    pub timestamp: DateTime<Utc>,
    /// Human-readable detail or failure reason
    pub detail: String,
    /// Plaintext size for successful backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl NotificationEvent {
    /// Build an event; the id is derived from type, tier, key and timestamp
    pub fn new(
        event_type: EventType,
        tier: Option<Tier>,
        key: Option<String>,
        timestamp: DateTime<Utc>,
        detail: impl Into<String>,
    ) -> Self {
        let name = format!(
            "{}|{}|{}|{}",
            event_type,
            tier.map(|t| t.as_str()).unwrap_or(""),
            key.as_deref().unwrap_or(""),
            timestamp.to_rfc3339()
        );
        Self {
            event_id: Uuid::new_v5(&EVENT_NAMESPACE, name.as_bytes()),
            event_type,
            tier,
            key,
            timestamp,
            detail: detail.into(),
            size_bytes: None,
        }
    }

    /// Attach a size
    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }
}

/// Delivery errors
#[derive(Error, Debug, Clone)]
pub enum NotifyError {
    /// Worth retrying
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// Retrying will not help
    #[error("delivery rejected: {0}")]
    Permanent(String),
}

impl NotifyError {
    /// Whether delivery may be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, NotifyError::Transient(_))
    }
}

/// A pub/sub topic
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event
    async fn publish(&self, event: &NotificationEvent) -> Result<(), NotifyError>;
}

/// In-process topic that records events
#[derive(Default)]
pub struct MemoryTopic {
    events: Mutex<Vec<NotificationEvent>>,
    attempts: AtomicUsize,
    fail_next: AtomicUsize,
    reject_all: AtomicBool,
}

impl MemoryTopic {
    /// Empty topic
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivered events in order
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().clone()
    }

    /// Delivered events of one type
    pub fn events_of(&self, event_type: EventType) -> Vec<NotificationEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Delivery attempts, including failed ones
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Fail the next `n` deliveries transiently
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Reject every delivery permanently
    pub fn reject_all(&self, reject: bool) {
        self.reject_all.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventSink for MemoryTopic {
    async fn publish(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject_all.load(Ordering::SeqCst) {
            return Err(NotifyError::Permanent("topic does not exist".to_string()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(NotifyError::Transient("throttled".to_string()));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Writes events to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn publish(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let body = serde_json::to_string(event).map_err(|e| NotifyError::Permanent(e.to_string()))?;
        info!(target: "notifications", event_type = %event.event_type, event = %body, "Notification");
        Ok(())
    }
}

/// Publishes events through a sink with retry
#[derive(Clone)]
pub struct NotificationDispatcher {
    sink: Arc<dyn EventSink>,
    retry: RetryExecutor,
}

impl NotificationDispatcher {
    /// Dispatcher over `sink`
    pub fn new(sink: Arc<dyn EventSink>, retry: RetryConfig) -> Self {
        Self {
            sink,
            retry: RetryExecutor::new(retry),
        }
    }

    /// Deliver with retry, returning the last error
    pub async fn publish(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        self.retry
            .execute(|| self.sink.publish(event), NotifyError::is_transient)
            .await
    }

    /// Deliver with retry; failures are logged and counted, never returned
    pub async fn publish_best_effort(&self, event: NotificationEvent) {
        if let Err(e) = self.publish(&event).await {
            OrchestratorMetrics::record_notification_failure(event.event_type.as_str());
            let body = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));
            error!(
                event_type = %event.event_type,
                event_id = %event.event_id,
                error = %e,
                event = %body,
                "Notification delivery failed; event recorded locally"
            );
        }
    }
}
