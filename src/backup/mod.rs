//! Backup records, the catalog and the executor that produces backups

pub mod catalog;
pub mod executor;
pub mod types;

pub use catalog::Catalog;
pub use executor::{BackupExecutor, ExecutorSettings};
pub use types::{
    backup_key, catalog_key, parse_backup_key, temp_key, BackupRecord, ParsedKey, Tier, CATALOG_PREFIX,
    TEMP_PREFIX,
};
