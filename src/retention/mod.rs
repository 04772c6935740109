//! Per-tier retention policies.
//!
//! Policies are pure: given a record and the current time they say whether the backup
//! has expired and which storage class it belongs in. [`RetentionSweeper`] applies them.

mod sweep;

pub use sweep::{RetentionSweeper, SweepReport};

use crate::backup::{BackupRecord, Tier};
use crate::store::StorageClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid policy or schedule
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetentionError {
    /// Transition ages must strictly increase
    #[error("transition ages must strictly increase ({0} follows {1})")]
    TransitionOrder(u32, u32),

    /// Expiry must not precede the last transition
    #[error("expiry after {expiry_days} days precedes transition at {last_transition_days} days")]
    ExpiryBeforeTransition {
        /// Configured expiry
        expiry_days: u32,
        /// Age of the last transition
        last_transition_days: u32,
    },

    /// Tiers must keep backups for strictly longer as they get coarser
    #[error("{longer} must retain longer than {shorter} ({longer_days} <= {shorter_days} days)")]
    NotMonotonic {
        /// Finer tier
        shorter: Tier,
        /// Coarser tier
        longer: Tier,
        /// Finer tier's expiry
        shorter_days: u32,
        /// Coarser tier's expiry
        longer_days: u32,
    },

    /// Zero-day expiry
    #[error("expiry must be at least one day")]
    ZeroExpiry,
}

/// Move to `storage_class` once a backup is `age_days` old
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    /// Age threshold in days
    pub age_days: u32,
    /// Class to move to
    pub storage_class: StorageClass,
}

impl Transition {
    /// Shorthand constructor
    pub fn new(age_days: u32, storage_class: StorageClass) -> Self {
        Self {
            age_days,
            storage_class,
        }
    }
}

/// Lifecycle of one tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawPolicy")]
pub struct RetentionPolicy {
    transitions: Vec<Transition>,
    expiry_days: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPolicy {
    #[serde(default)]
    transitions: Vec<Transition>,
    expiry_days: u32,
}

impl TryFrom<RawPolicy> for RetentionPolicy {
    type Error = RetentionError;

    fn try_from(raw: RawPolicy) -> Result<Self, Self::Error> {
        RetentionPolicy::new(raw.transitions, raw.expiry_days)
    }
}

fn age_days(record: &BackupRecord, now: DateTime<Utc>) -> i64 {
    (now - record.created_at).num_days()
}

impl RetentionPolicy {
    /// Validated policy
    pub fn new(transitions: Vec<Transition>, expiry_days: u32) -> Result<Self, RetentionError> {
        if expiry_days == 0 {
            return Err(RetentionError::ZeroExpiry);
        }
        for pair in transitions.windows(2) {
            if pair[1].age_days <= pair[0].age_days {
                return Err(RetentionError::TransitionOrder(pair[1].age_days, pair[0].age_days));
            }
        }
        if let Some(last) = transitions.last() {
            if expiry_days < last.age_days {
                return Err(RetentionError::ExpiryBeforeTransition {
                    expiry_days,
                    last_transition_days: last.age_days,
                });
            }
        }
        Ok(Self {
            transitions,
            expiry_days,
        })
    }

    /// Storage-class schedule
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Hard deletion age
    pub fn expiry_days(&self) -> u32 {
        self.expiry_days
    }

    /// Whether `record` is older than the expiry
    pub fn should_expire(&self, record: &BackupRecord, now: DateTime<Utc>) -> bool {
        now - record.created_at > chrono::Duration::days(i64::from(self.expiry_days))
    }

    /// Class for the greatest transition age not above the record's age, or
    /// `Standard` if none applies yet
    pub fn target_storage_class(&self, record: &BackupRecord, now: DateTime<Utc>) -> StorageClass {
        let age = age_days(record, now);
        self.transitions
            .iter()
            .filter(|t| i64::from(t.age_days) <= age)
            .max_by_key(|t| t.age_days)
            .map(|t| t.storage_class)
            .unwrap_or_default()
    }
}

/// Policies for every tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSchedule {
    /// Daily tier
    pub daily: RetentionPolicy,
    /// Weekly tier
    pub weekly: RetentionPolicy,
    /// Monthly tier
    pub monthly: RetentionPolicy,
    /// Annual tier
    pub annual: RetentionPolicy,
    /// Pre-restore safety backups
    pub safety: RetentionPolicy,
}

impl Default for RetentionSchedule {
    fn default() -> Self {
        use StorageClass::*;
        let policy = |transitions: Vec<Transition>, expiry_days: u32| RetentionPolicy {
            transitions,
            expiry_days,
        };
        Self {
            daily: policy(vec![], 14),
            weekly: policy(vec![Transition::new(30, InfrequentAccess)], 90),
            monthly: policy(
                vec![Transition::new(30, InfrequentAccess), Transition::new(90, Glacier)],
                365,
            ),
            annual: policy(
                vec![
                    Transition::new(30, InfrequentAccess),
                    Transition::new(90, Glacier),
                    Transition::new(365, DeepArchive),
                ],
                2555,
            ),
            safety: policy(vec![], 30),
        }
    }
}

impl RetentionSchedule {
    /// Policy of a tier
    pub fn policy(&self, tier: Tier) -> &RetentionPolicy {
        match tier {
            Tier::Daily => &self.daily,
            Tier::Weekly => &self.weekly,
            Tier::Monthly => &self.monthly,
            Tier::Annual => &self.annual,
            Tier::Safety => &self.safety,
        }
    }

    /// Check that daily < weekly < monthly < annual by expiry. Safety backups are
    /// outside the chain.
    pub fn validate(&self) -> Result<(), RetentionError> {
        for pair in Tier::SCHEDULED.windows(2) {
            let (shorter, longer) = (pair[0], pair[1]);
            let shorter_days = self.policy(shorter).expiry_days;
            let longer_days = self.policy(longer).expiry_days;
            if longer_days <= shorter_days {
                return Err(RetentionError::NotMonotonic {
                    shorter,
                    longer,
                    shorter_days,
                    longer_days,
                });
            }
        }
        Ok(())
    }
}
