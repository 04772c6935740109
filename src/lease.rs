//! Mutual-exclusion leases built on conditional writes
//!
//! A lease is a small JSON document under `locks/`. It is created with a create-only
//! put; an expired lease is taken over with a compare-and-swap on the version that was
//! read, so two contenders can never both win. Leases carry an expiry so a crashed
//! holder (or a platform that kills a run on timeout) cannot block a tier forever.
//! While a [`Lease`] is held, a background task pushes its expiry forward with the
//! same compare-and-swap, so a run may outlive the TTL without losing exclusivity.

use crate::clock::Clock;
use crate::store::{ObjectMetadata, ObjectStore, Precondition, StoreError};
use crate::{OrchestratorError, Result};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Stored lease document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseDocument {
    /// Unique id of the holding run
    pub holder: String,
    /// Protected resource
    pub resource: String,
    /// When the lease was taken
    pub acquired_at: DateTime<Utc>,
    /// When the lease may be taken over
    pub expires_at: DateTime<Utc>,
}

/// Lock key of a resource
pub fn lease_key(resource: &str) -> String {
    format!("locks/{}.lock", resource)
}

/// Hands out leases
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    renew_every: std::time::Duration,
}

impl LeaseManager {
    /// Create a manager whose leases expire after `ttl` unless renewed. Held leases
    /// are renewed every third of the TTL.
    pub fn new(store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>, ttl: std::time::Duration) -> Self {
        let renew_every = (ttl / 3).max(std::time::Duration::from_millis(1));
        let ttl = Duration::from_std(ttl).unwrap_or_else(|_| Duration::hours(2));
        Self {
            store,
            clock,
            ttl,
            renew_every,
        }
    }

    /// Renew held leases at this interval instead
    pub fn with_renew_interval(mut self, every: std::time::Duration) -> Self {
        self.renew_every = every.max(std::time::Duration::from_millis(1));
        self
    }

    /// Take the lease on `resource`, or fail with `Busy` if a live holder exists
    pub async fn acquire(&self, resource: &str) -> Result<Lease> {
        let key = lease_key(resource);
        let now = self.clock.now();
        let document = LeaseDocument {
            holder: Uuid::new_v4().to_string(),
            resource: resource.to_string(),
            acquired_at: now,
            expires_at: now + self.ttl,
        };
        let body = Bytes::from(serde_json::to_vec(&document)?);

        match self
            .store
            .put_conditional(&key, body.clone(), ObjectMetadata::json(), Precondition::IfAbsent)
            .await
        {
            Ok(receipt) => {
                debug!(resource, holder = %document.holder, "Lease acquired");
                return Ok(self.lease(key, document, receipt.version));
            }
            Err(StoreError::PreconditionFailed(_)) => {}
            Err(e) => return Err(e.into()),
        }

        // Somebody holds it; see whether the holder is still alive
        let info = match self.store.head(&key).await? {
            Some(info) => info,
            // Released between our attempts; one more create-only try
            None => {
                return match self
                    .store
                    .put_conditional(&key, body, ObjectMetadata::json(), Precondition::IfAbsent)
                    .await
                {
                    Ok(receipt) => Ok(self.lease(key, document, receipt.version)),
                    Err(StoreError::PreconditionFailed(_)) => Err(busy(resource)),
                    Err(e) => Err(e.into()),
                };
            }
        };

        let current: Option<LeaseDocument> = match self.store.get_bytes(&key).await {
            Ok((raw, _)) => serde_json::from_slice(&raw).ok(),
            Err(StoreError::NotFound(_)) => return Err(busy(resource)),
            Err(e) => return Err(e.into()),
        };

        let expired = current.as_ref().map_or(true, |held| held.expires_at <= now);
        if !expired {
            return Err(busy(resource));
        }

        match self
            .store
            .put_conditional(&key, body, ObjectMetadata::json(), Precondition::IfMatch(info.version))
            .await
        {
            Ok(receipt) => {
                info!(
                    resource,
                    previous_holder = current.as_ref().map(|c| c.holder.as_str()).unwrap_or("<unreadable>"),
                    "Took over expired lease"
                );
                Ok(self.lease(key, document, receipt.version))
            }
            Err(StoreError::PreconditionFailed(_)) => Err(busy(resource)),
            Err(e) => Err(e.into()),
        }
    }

    /// Current holder of `resource`, if any
    pub async fn holder(&self, resource: &str) -> Result<Option<LeaseDocument>> {
        match self.store.get_bytes(&lease_key(resource)).await {
            Ok((raw, _)) => Ok(serde_json::from_slice(&raw).ok()),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn lease(&self, key: String, document: LeaseDocument, version: String) -> Lease {
        let version = Arc::new(Mutex::new(version));
        let heartbeat = CancellationToken::new();
        tokio::spawn(self.clone().renew_until_released(
            key.clone(),
            document.clone(),
            version.clone(),
            heartbeat.clone(),
        ));
        Lease {
            store: self.store.clone(),
            key,
            document,
            version,
            heartbeat,
        }
    }

    async fn renew_until_released(
        self,
        key: String,
        mut document: LeaseDocument,
        version: Arc<Mutex<String>>,
        stop: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.renew_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {}
            }

            document.expires_at = self.clock.now() + self.ttl;
            let body = match serde_json::to_vec(&document) {
                Ok(body) => Bytes::from(body),
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to encode lease renewal");
                    continue;
                }
            };
            let current = version.lock().clone();
            match self
                .store
                .put_conditional(&key, body, ObjectMetadata::json(), Precondition::IfMatch(current))
                .await
            {
                Ok(receipt) => {
                    *version.lock() = receipt.version;
                    debug!(key = %key, expires_at = %document.expires_at, "Lease renewed");
                }
                Err(StoreError::PreconditionFailed(_)) => {
                    if !stop.is_cancelled() {
                        warn!(key = %key, holder = %document.holder, "Lease lost to another holder; renewal stopped");
                    }
                    return;
                }
                Err(e) => warn!(key = %key, error = %e, "Lease renewal failed; retrying on next tick"),
            }
        }
    }
}

fn busy(resource: &str) -> OrchestratorError {
    OrchestratorError::Busy(format!("{} is held by another run", resource))
}

/// A held lease. Call [`Lease::release`] when done; a lease that is dropped without
/// release simply expires.
pub struct Lease {
    store: Arc<dyn ObjectStore>,
    key: String,
    document: LeaseDocument,
    version: Arc<Mutex<String>>,
    heartbeat: CancellationToken,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.heartbeat.cancel();
    }
}

impl Lease {
    /// Lease document as written
    pub fn document(&self) -> &LeaseDocument {
        &self.document
    }

    /// Release the lease if it is still ours. Failures are logged.
    pub async fn release(self) {
        self.heartbeat.cancel();
        let ours = self.version.lock().clone();
        let still_ours = match self.store.head(&self.key).await {
            Ok(Some(info)) => info.version == ours,
            Ok(None) => false,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Could not check lease before release; leaving it to expire");
                return;
            }
        };

        if !still_ours {
            warn!(key = %self.key, "Lease was taken over before release");
            return;
        }

        if let Err(e) = self.store.delete(&self.key).await {
            warn!(key = %self.key, error = %e, "Failed to release lease; it will expire");
        } else {
            debug!(key = %self.key, "Lease released");
        }
    }
}
