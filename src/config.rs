//! Orchestrator configuration.
//!
//! Loaded from a JSON file or from environment variables and validated once at
//! startup. Nothing here is re-read while a run is in flight.

use crate::resilience::RetryConfig;
use crate::retention::RetentionSchedule;
use crate::source::{CommandScratchConfig, CommandTargetConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Invalid or unreadable configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required value is missing or empty
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    /// A value is present but unusable
    #[error("invalid setting {field}: {reason}")]
    Invalid {
        /// Setting name
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// The config file could not be read or parsed
    #[error("failed to load {path}: {reason}")]
    Load {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        reason: String,
    },
}

/// Where backups are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process memory; tests and embedding
    Memory,
    /// A directory on the local filesystem
    Local,
    /// Amazon S3 or an S3-compatible service
    #[default]
    S3,
}

/// Verification settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// At least one must exist after a restore; empty accepts any collection
    pub expected_collections: Vec<String>,
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Bucket holding artifacts, catalog and leases
    pub bucket: String,
    /// Store region
    pub region: String,
    /// S3-compatible endpoint override
    pub endpoint_url: Option<String>,
    /// Storage backend
    pub store_backend: StoreBackend,
    /// Root directory for the local backend
    pub local_root: Option<PathBuf>,
    /// Notification topic (ARN for SNS)
    pub notification_topic: String,
    /// Reference resolved by the key provider; never the key itself
    pub encryption_key_ref: String,
    /// Production database, used as backup source and default restore target
    pub restore_target: Option<CommandTargetConfig>,
    /// Scratch targets for verification
    pub verification_target: Option<CommandScratchConfig>,
    /// Verification checks
    pub verification: VerificationConfig,
    /// Wall-clock budget of a whole backup, verification or restore
    pub operation_timeout_secs: u64,
    /// Budget of a single store call
    pub store_op_timeout_secs: u64,
    /// Lease lifetime; defaults to the operation timeout plus five minutes
    pub lease_ttl_secs: Option<u64>,
    /// How often a held lease is renewed; defaults to a third of the lease lifetime
    pub lease_renew_interval_ms: Option<u64>,
    /// Gzip the dump before sealing
    pub compression: bool,
    /// Plaintext bytes per encrypted frame
    pub chunk_size_bytes: usize,
    /// Per-tier retention
    pub retention: RetentionSchedule,
    /// Local retry of notification delivery
    pub notification_retry: RetryConfig,
    /// Age after which uncommitted objects are swept
    pub orphan_grace_hours: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: "us-east-2".to_string(),
            endpoint_url: None,
            store_backend: StoreBackend::S3,
            local_root: None,
            notification_topic: String::new(),
            encryption_key_ref: String::new(),
            restore_target: None,
            verification_target: None,
            verification: VerificationConfig::default(),
            operation_timeout_secs: 3600,
            store_op_timeout_secs: 300,
            lease_ttl_secs: None,
            lease_renew_interval_ms: None,
            compression: true,
            chunk_size_bytes: 1024 * 1024,
            retention: RetentionSchedule::default(),
            notification_retry: RetryConfig::default(),
            orphan_grace_hours: 24,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_u64(name: &'static str) -> Result<Option<u64>, ConfigError> {
    env_var(name)
        .map(|v| {
            v.trim().parse().map_err(|e| ConfigError::Invalid {
                field: name,
                reason: format!("{:?}: {}", v, e),
            })
        })
        .transpose()
}

impl OrchestratorConfig {
    /// In-memory store, fast timeouts, key ref `test-key`
    pub fn for_testing() -> Self {
        Self {
            bucket: "test-backups".to_string(),
            store_backend: StoreBackend::Memory,
            notification_topic: "test-topic".to_string(),
            encryption_key_ref: "test-key".to_string(),
            operation_timeout_secs: 60,
            store_op_timeout_secs: 10,
            chunk_size_bytes: 64 * 1024,
            notification_retry: RetryConfig {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter: false,
                ..RetryConfig::default()
            },
            ..Self::default()
        }
    }

    /// Read a JSON file; unset fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let load_error = |reason: String| ConfigError::Load {
            path: path.to_path_buf(),
            reason,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| load_error(e.to_string()))
    }

    /// Build from environment variables on top of the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(bucket) = env_var("BACKUP_BUCKET") {
            config.bucket = bucket;
        }
        if let Some(region) = env_var("AWS_REGION") {
            config.region = region;
        }
        config.endpoint_url = env_var("S3_ENDPOINT_URL");
        if let Some(topic) = env_var("NOTIFICATION_TOPIC") {
            config.notification_topic = topic;
        }
        if let Some(key_ref) = env_var("ENCRYPTION_KEY_REF") {
            config.encryption_key_ref = key_ref;
        }
        if let Some(backend) = env_var("BACKUP_STORE") {
            config.store_backend = match backend.to_ascii_lowercase().as_str() {
                "memory" => StoreBackend::Memory,
                "local" => StoreBackend::Local,
                "s3" => StoreBackend::S3,
                other => {
                    return Err(ConfigError::Invalid {
                        field: "BACKUP_STORE",
                        reason: format!("unknown backend {:?}", other),
                    })
                }
            };
        }
        config.local_root = env_var("BACKUP_LOCAL_ROOT").map(PathBuf::from);
        if let Some(uri) = env_var("RESTORE_TARGET_URI") {
            let identifier = env_var("RESTORE_TARGET_NAME").unwrap_or_else(|| "primary".to_string());
            config.restore_target = Some(CommandTargetConfig::mongodb(identifier, uri, true));
        }
        if let Some(template) = env_var("VERIFICATION_TARGET_URI") {
            config.verification_target = Some(CommandScratchConfig::mongodb(template));
        }
        if let Some(secs) = env_u64("OPERATION_TIMEOUT_SECS")? {
            config.operation_timeout_secs = secs;
        }
        if let Some(secs) = env_u64("STORE_OP_TIMEOUT_SECS")? {
            config.store_op_timeout_secs = secs;
        }
        config.lease_ttl_secs = env_u64("LEASE_TTL_SECS")?.or(config.lease_ttl_secs);
        config.lease_renew_interval_ms = env_u64("LEASE_RENEW_INTERVAL_MS")?.or(config.lease_renew_interval_ms);
        if let Some(collections) = env_var("EXPECTED_COLLECTIONS") {
            config.verification.expected_collections = collections
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect();
        }

        Ok(config)
    }

    /// Check everything that can be checked without touching the network
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket.trim().is_empty() {
            return Err(ConfigError::Missing("bucket"));
        }
        if self.notification_topic.trim().is_empty() {
            return Err(ConfigError::Missing("notification_topic"));
        }
        if self.encryption_key_ref.trim().is_empty() {
            return Err(ConfigError::Missing("encryption_key_ref"));
        }
        if self.store_backend == StoreBackend::Local && self.local_root.is_none() {
            return Err(ConfigError::Missing("local_root"));
        }
        if self.operation_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "operation_timeout_secs",
                reason: "must be positive".to_string(),
            });
        }
        if self.store_op_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "store_op_timeout_secs",
                reason: "must be positive".to_string(),
            });
        }
        if self.lease_ttl_secs.is_some_and(|ttl| ttl <= self.operation_timeout_secs) {
            return Err(ConfigError::Invalid {
                field: "lease_ttl_secs",
                reason: "must exceed operation_timeout_secs".to_string(),
            });
        }
        if let Some(every) = self.lease_renew_interval_ms {
            if every == 0 || Duration::from_millis(every) >= self.lease_ttl() {
                return Err(ConfigError::Invalid {
                    field: "lease_renew_interval_ms",
                    reason: "must be positive and shorter than the lease lifetime".to_string(),
                });
            }
        }
        if self.chunk_size_bytes == 0 || self.chunk_size_bytes > crate::crypto::MAX_FRAME_PLAINTEXT {
            return Err(ConfigError::Invalid {
                field: "chunk_size_bytes",
                reason: format!("must be between 1 and {}", crate::crypto::MAX_FRAME_PLAINTEXT),
            });
        }
        self.retention.validate().map_err(|e| ConfigError::Invalid {
            field: "retention",
            reason: e.to_string(),
        })?;

        if let (Some(restore), Some(verification)) = (&self.restore_target, &self.verification_target) {
            if restore.uri == verification.uri_template {
                return Err(ConfigError::Invalid {
                    field: "verification_target",
                    reason: "must not point at the restore target".to_string(),
                });
            }
        }
        if self.verification_target.as_ref().is_some_and(|v| !v.uri_template.contains("{name}")) {
            return Err(ConfigError::Invalid {
                field: "verification_target",
                reason: "uri_template must contain {name}".to_string(),
            });
        }

        Ok(())
    }

    /// Whole-run budget
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Single store call budget
    pub fn store_op_timeout(&self) -> Duration {
        Duration::from_secs(self.store_op_timeout_secs)
    }

    /// Lease lifetime
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(
            self.lease_ttl_secs
                .unwrap_or(self.operation_timeout_secs + 300),
        )
    }

    /// Lease renewal interval
    pub fn lease_renew_interval(&self) -> Duration {
        self.lease_renew_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.lease_ttl() / 3)
    }

    /// Orphan grace period
    pub fn orphan_grace(&self) -> chrono::Duration {
        chrono::Duration::hours(self.orphan_grace_hours as i64)
    }
}
