//! Backup tiers, catalog records and the object key scheme

use crate::OrchestratorError;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix under which catalog records live
pub const CATALOG_PREFIX: &str = "catalog/";

/// Prefix for in-flight uploads
pub const TEMP_PREFIX: &str = "_tmp/";

/// Suffix of every backup data object
pub const ARCHIVE_SUFFIX: &str = ".archive";

/// Current artifact format
pub const FORMAT_VERSION: u32 = 1;

const KEY_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%SZ";

lazy_static! {
    static ref BACKUP_KEY: Regex = Regex::new(
        r"^(daily|weekly|monthly|annual|safety)/(\d{4}-\d{2}-\d{2}T\d{2}-\d{2}-\d{2}Z)(?:_(\d{3}))?\.archive$"
    )
    .unwrap();
}

/// Retention class of a backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Kept for days
    Daily,
    /// Kept for months
    Weekly,
    /// Kept for a year
    Monthly,
    /// Kept for years
    Annual,
    /// Taken automatically before a restore; never scheduled
    Safety,
}

impl Tier {
    /// Tiers the scheduler may request
    pub const SCHEDULED: [Tier; 4] = [Tier::Daily, Tier::Weekly, Tier::Monthly, Tier::Annual];

    /// Every tier, including the safety namespace
    pub const ALL: [Tier; 5] = [Tier::Daily, Tier::Weekly, Tier::Monthly, Tier::Annual, Tier::Safety];

    /// Lowercase name used in keys and events
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Daily => "daily",
            Tier::Weekly => "weekly",
            Tier::Monthly => "monthly",
            Tier::Annual => "annual",
            Tier::Safety => "safety",
        }
    }

    /// Whether an external scheduler may request this tier
    pub fn is_schedulable(&self) -> bool {
        !matches!(self, Tier::Safety)
    }

    /// Prefix of this tier's data objects
    pub fn data_prefix(&self) -> String {
        format!("{}/", self.as_str())
    }

    /// Prefix of this tier's catalog records
    pub fn catalog_prefix(&self) -> String {
        format!("{}{}/", CATALOG_PREFIX, self.as_str())
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Tier::Daily),
            "weekly" => Ok(Tier::Weekly),
            "monthly" => Ok(Tier::Monthly),
            "annual" => Ok(Tier::Annual),
            "safety" => Ok(Tier::Safety),
            other => Err(OrchestratorError::Invalid(format!("unknown tier {:?}", other))),
        }
    }
}

/// Committed backup, as stored in the catalog.
///
/// Records are append-only; readers ignore fields they do not know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    /// Retention tier
    pub tier: Tier,

    /// Data object key, `{tier}/{timestamp}.archive`
    pub key: String,

    /// Plaintext size of the dump
    pub size_bytes: u64,

    /// Size of the sealed object in the store
    #[serde(default)]
    pub stored_bytes: u64,

    /// Hex SHA-256 of the plaintext dump
    pub checksum: String,

    /// When the run started
    pub created_at: DateTime<Utc>,

    /// Reference of the key the artifact is sealed with
    pub encryption_key_ref: String,

    /// Plaintext compression codec, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,

    /// Artifact format
    #[serde(default = "default_format_version")]
    pub format_version: u32,

    /// Identifier of the database the dump was taken from
    #[serde(default)]
    pub source: String,
}

fn default_format_version() -> u32 {
    FORMAT_VERSION
}

impl BackupRecord {
    /// Catalog key of this record
    pub fn catalog_key(&self) -> String {
        catalog_key(&self.key)
    }
}

/// Data key for a run of `tier` started at `at`. `sequence` disambiguates runs that
/// land in the same second; the suffixed form sorts after the plain one.
pub fn backup_key(tier: Tier, at: DateTime<Utc>, sequence: u32) -> String {
    let stamp = at.format(KEY_TIMESTAMP_FORMAT);
    if sequence == 0 {
        format!("{}/{}{}", tier, stamp, ARCHIVE_SUFFIX)
    } else {
        format!("{}/{}_{:03}{}", tier, stamp, sequence, ARCHIVE_SUFFIX)
    }
}

/// Parsed form of a data key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedKey {
    /// Tier segment
    pub tier: Tier,
    /// Timestamp segment
    pub timestamp: DateTime<Utc>,
    /// Collision suffix, 0 when absent
    pub sequence: u32,
}

/// Parse `{tier}/{timestamp}[_{nnn}].archive`
pub fn parse_backup_key(key: &str) -> Option<ParsedKey> {
    let captures = BACKUP_KEY.captures(key)?;
    let tier = captures.get(1)?.as_str().parse().ok()?;
    let naive = NaiveDateTime::parse_from_str(captures.get(2)?.as_str(), KEY_TIMESTAMP_FORMAT).ok()?;
    let sequence = match captures.get(3) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };
    Some(ParsedKey {
        tier,
        timestamp: Utc.from_utc_datetime(&naive),
        sequence,
    })
}

/// `catalog/{tier}/{timestamp}.json` for a data key
pub fn catalog_key(data_key: &str) -> String {
    let stem = data_key.strip_suffix(ARCHIVE_SUFFIX).unwrap_or(data_key);
    format!("{}{}.json", CATALOG_PREFIX, stem)
}

/// Data key named by a catalog key
pub fn data_key_from_catalog(catalog_key: &str) -> Option<String> {
    let stem = catalog_key.strip_prefix(CATALOG_PREFIX)?.strip_suffix(".json")?;
    Some(format!("{}{}", stem, ARCHIVE_SUFFIX))
}

/// Staging key for the upload of `data_key` by run `run_id`
pub fn temp_key(run_id: &str, data_key: &str) -> String {
    format!("{}{}/{}", TEMP_PREFIX, run_id, data_key)
}
