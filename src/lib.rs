//! # Backup Orchestrator
//!
//! Tiered backup, restore verification and manual disaster recovery for a primary
//! database, built on top of a durable object store.
//!
//! ## Overview
//!
//! The orchestrator is stateless between invocations. Everything durable lives in the
//! object store: encrypted backup artifacts, the append-only catalog of committed
//! [`BackupRecord`](backup::BackupRecord)s, and the lease objects that keep two runs of the
//! same tier from overlapping.
//!
//! An external scheduler calls the entry points on [`Orchestrator`]:
//!
//! ```rust
//! use backup_orchestrator::{
//!     crypto::StaticKeyProvider,
//!     notify::MemoryTopic,
//!     source::{MemoryDatabase, MemoryScratchProvisioner},
//!     store::MemoryObjectStore,
//!     Orchestrator, OrchestratorConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OrchestratorConfig::for_testing();
//! let production = Arc::new(MemoryDatabase::production("primary"));
//! production.insert("users", serde_json::json!({"name": "ada"}));
//!
//! let orchestrator = Orchestrator::builder(config)
//!     .store(Arc::new(MemoryObjectStore::new()))
//!     .keys(Arc::new(StaticKeyProvider::generated("test-key")))
//!     .sink(Arc::new(MemoryTopic::new()))
//!     .production(production)
//!     .scratch(Arc::new(MemoryScratchProvisioner::new()))
//!     .build()?;
//!
//! let result = orchestrator.run_backup("daily").await;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`store`]: object store abstraction and backends
//! - [`backup`]: backup records, catalog and the executor
//! - [`retention`]: per-tier retention policies and the sweep
//! - [`verify`]: restore verification against scratch targets
//! - [`restore`]: confirmed, safety-first disaster recovery
//! - [`notify`]: event publishing with local retry

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Main error type for orchestrator operations
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Object store failure
    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    /// Encryption or envelope decoding failure
    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Invalid retention policy
    #[error("Retention error: {0}")]
    Retention(#[from] retention::RetentionError),

    /// The dump source could not be opened or read
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// Loading data into a target failed
    #[error("Restore target error: {0}")]
    Target(String),

    /// A run for the same tier (or the same target) is still in flight
    #[error("Busy: {0}")]
    Busy(String),

    /// Restore invoked without the confirmation sentinel
    #[error("Restore not confirmed: confirmation token does not match")]
    NotConfirmed,

    /// Checksum or validation mismatch
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Requested backup or tier does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request that retrying will not fix
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// Run exceeded its wall-clock budget
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Run was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local I/O error while streaming
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Restore failed after the safety backup step was reached
    #[error("Restore failed: {reason} (safety backup: {})", .safety_backup_key.as_deref().unwrap_or("none"))]
    RestoreFailed {
        /// Safety backup taken before the target was touched, if any
        safety_backup_key: Option<String>,
        /// Underlying failure
        reason: Box<OrchestratorError>,
    },
}

/// Coarse classification used by callers to decide whether a run may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Network, throttling: safe to retry externally
    Transient,
    /// Needs operator intervention
    Permanent,
    /// Concurrent run for the same tier or target
    Busy,
    /// Restore guard rejected the request
    NotConfirmed,
    /// Checksum or verification mismatch
    Integrity,
    /// Wall-clock budget exceeded
    Timeout,
    /// Cancelled by the caller
    Cancelled,
}

impl OrchestratorError {
    /// Map this error onto the retry taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Store(e) if e.is_transient() => ErrorKind::Transient,
            OrchestratorError::Io(_) => ErrorKind::Transient,
            OrchestratorError::Busy(_) => ErrorKind::Busy,
            OrchestratorError::NotConfirmed => ErrorKind::NotConfirmed,
            OrchestratorError::Integrity(_) => ErrorKind::Integrity,
            OrchestratorError::Crypto(crypto::CryptoError::Authentication(_))
            | OrchestratorError::Crypto(crypto::CryptoError::Truncated) => ErrorKind::Integrity,
            OrchestratorError::Timeout(_) => ErrorKind::Timeout,
            OrchestratorError::Cancelled => ErrorKind::Cancelled,
            OrchestratorError::RestoreFailed { reason, .. } => reason.kind(),
            _ => ErrorKind::Permanent,
        }
    }

    /// Whether the external scheduler may safely re-invoke the same entry point.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Timeout)
    }
}

/// Object store abstraction and backends
pub mod store;

/// Backup records, catalog and executor
pub mod backup;

/// Retention policies and sweep
pub mod retention;

/// Encryption envelope and key resolution
pub mod crypto;

/// Streaming seal/open pipeline shared by backup, verification and restore
pub mod pipeline;

/// Dump sources and restore targets
pub mod source;

/// Restore verification
pub mod verify;

/// Disaster recovery
pub mod restore;

/// Event notification
pub mod notify;

/// Conditional-write leases
pub mod lease;

/// Configuration
pub mod config;

/// Audit log for verification and restore runs
pub mod audit;

/// Retry with backoff
pub mod resilience;

/// Prometheus metrics
pub mod metrics;

/// Time source
pub mod clock;

/// Entry points invoked by the scheduler and operators
pub mod orchestrator;

pub use config::OrchestratorConfig;
pub use orchestrator::{Orchestrator, OrchestratorBuilder, RunResult};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let busy = OrchestratorError::Busy("daily".to_string());
        assert_eq!(busy.kind(), ErrorKind::Busy);
        assert!(!busy.is_retryable());

        let transient = OrchestratorError::Store(store::StoreError::Transient("throttled".into()));
        assert_eq!(transient.kind(), ErrorKind::Transient);
        assert!(transient.is_retryable());

        assert_eq!(OrchestratorError::NotConfirmed.kind(), ErrorKind::NotConfirmed);
        assert_eq!(
            OrchestratorError::SourceUnavailable("refused".into()).kind(),
            ErrorKind::Permanent
        );
    }
}
