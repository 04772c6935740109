//! Databases as dump sources and restore targets.
//!
//! The dump format is opaque to the orchestrator: a source produces a byte stream, a
//! target consumes one. The only structural requirement is that a target's
//! [`DumpSource::open_dump_stream`] export is canonical, so restoring a dump and
//! exporting it again yields the same bytes. Verification relies on that to compare
//! a restored dataset against the checksum recorded at backup time.

mod command;
mod memory;
mod scratch;

pub use command::{CommandSpec, CommandTarget, CommandTargetConfig};
pub use memory::MemoryDatabase;
pub use scratch::{CommandScratchConfig, CommandScratchProvisioner, MemoryScratchProvisioner, ScratchProvisioner};

use crate::store::ByteReader;
use crate::Result;
use async_trait::async_trait;

/// Something that can produce a full dump
#[async_trait]
pub trait DumpSource: Send + Sync {
    /// Stable identifier (connection name, not credentials)
    fn identifier(&self) -> &str;

    /// Open a streaming export. Failures map to `SourceUnavailable`.
    async fn open_dump_stream(&self) -> Result<ByteReader>;
}

/// A database that can also be overwritten from a dump
#[async_trait]
pub trait DatabaseTarget: DumpSource {
    /// Whether this is the live production database
    fn is_production(&self) -> bool;

    /// Destructively replace the dataset with the dump read from `data`.
    ///
    /// A read error on `data` must abort the load.
    async fn restore(&self, data: ByteReader) -> Result<()>;

    /// Names of the collections (tables) currently present
    async fn list_collections(&self) -> Result<Vec<String>>;
}
