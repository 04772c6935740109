use super::{DatabaseTarget, DumpSource};
use crate::store::{reader_from_bytes, ByteReader};
use crate::{OrchestratorError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

/// One line of the export
#[derive(Debug, Serialize, Deserialize)]
struct ExportLine {
    collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    document: Option<Value>,
}

/// In-memory document database.
///
/// Exports are JSON lines: a `{"collection": name}` line per collection followed by
/// one `{"collection": name, "document": {...}}` line per document, collections in
/// name order and documents in insertion order. Object keys serialize sorted, so the
/// export is canonical. Restores parse the whole stream before swapping the dataset
/// in, so a failed load leaves the previous contents untouched.
pub struct MemoryDatabase {
    identifier: String,
    production: bool,
    collections: RwLock<BTreeMap<String, Vec<Value>>>,
    fail_next_dump: AtomicBool,
    fail_next_restore: AtomicBool,
    dumps: AtomicUsize,
    restores: AtomicUsize,
    paused: watch::Sender<bool>,
}

impl MemoryDatabase {
    fn with_role(identifier: impl Into<String>, production: bool) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            identifier: identifier.into(),
            production,
            collections: RwLock::new(BTreeMap::new()),
            fail_next_dump: AtomicBool::new(false),
            fail_next_restore: AtomicBool::new(false),
            dumps: AtomicUsize::new(0),
            restores: AtomicUsize::new(0),
            paused,
        }
    }

    /// The production database
    pub fn production(identifier: impl Into<String>) -> Self {
        Self::with_role(identifier, true)
    }

    /// A non-production database (scratch or staging)
    pub fn scratch(identifier: impl Into<String>) -> Self {
        Self::with_role(identifier, false)
    }

    /// Append a document, creating the collection if needed
    pub fn insert(&self, collection: &str, document: Value) {
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .push(document);
    }

    /// Create an empty collection
    pub fn create_collection(&self, collection: &str) {
        self.collections.write().entry(collection.to_string()).or_default();
    }

    /// Drop everything
    pub fn clear(&self) {
        self.collections.write().clear();
    }

    /// Documents in a collection
    pub fn documents(&self, collection: &str) -> Vec<Value> {
        self.collections.read().get(collection).cloned().unwrap_or_default()
    }

    /// Collection names
    pub fn collection_names(&self) -> Vec<String> {
        self.collections.read().keys().cloned().collect()
    }

    /// Canonical export of the current contents
    pub fn export(&self) -> Result<Vec<u8>> {
        let collections = self.collections.read();
        let mut out = Vec::new();
        for (name, documents) in collections.iter() {
            let header = ExportLine {
                collection: name.clone(),
                document: None,
            };
            serde_json::to_writer(&mut out, &header)?;
            out.push(b'\n');
            for document in documents {
                let line = ExportLine {
                    collection: name.clone(),
                    document: Some(document.clone()),
                };
                serde_json::to_writer(&mut out, &line)?;
                out.push(b'\n');
            }
        }
        Ok(out)
    }

    /// Make the next dump fail as if the database were unreachable
    pub fn fail_next_dump(&self) {
        self.fail_next_dump.store(true, Ordering::SeqCst);
    }

    /// Make the next restore fail midway
    pub fn fail_next_restore(&self) {
        self.fail_next_restore.store(true, Ordering::SeqCst);
    }

    /// Hold every dump request until [`MemoryDatabase::resume_dumps`]
    pub fn pause_dumps(&self) {
        self.paused.send_replace(true);
    }

    /// Release held dump requests
    pub fn resume_dumps(&self) {
        self.paused.send_replace(false);
    }

    /// Dump requests received so far
    pub fn dump_count(&self) -> usize {
        self.dumps.load(Ordering::SeqCst)
    }

    /// Successful restores so far
    pub fn restore_count(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DumpSource for MemoryDatabase {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn open_dump_stream(&self) -> Result<ByteReader> {
        self.dumps.fetch_add(1, Ordering::SeqCst);

        let mut paused = self.paused.subscribe();
        paused
            .wait_for(|held| !*held)
            .await
            .map_err(|_| OrchestratorError::SourceUnavailable(format!("{} shut down", self.identifier)))?;

        if self.fail_next_dump.swap(false, Ordering::SeqCst) {
            return Err(OrchestratorError::SourceUnavailable(format!(
                "connection to {} refused",
                self.identifier
            )));
        }
        Ok(reader_from_bytes(self.export()?))
    }
}

#[async_trait]
impl DatabaseTarget for MemoryDatabase {
    fn is_production(&self) -> bool {
        self.production
    }

    async fn restore(&self, data: ByteReader) -> Result<()> {
        let mut lines = BufReader::new(data).lines();
        let mut loaded: BTreeMap<String, Vec<Value>> = BTreeMap::new();

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| OrchestratorError::Target(format!("load into {} aborted: {}", self.identifier, e)))?
        {
            if line.is_empty() {
                continue;
            }
            let entry: ExportLine = serde_json::from_str(&line)
                .map_err(|e| OrchestratorError::Target(format!("malformed dump line: {}", e)))?;
            let documents = loaded.entry(entry.collection).or_default();
            if let Some(document) = entry.document {
                documents.push(document);
            }
        }

        if self.fail_next_restore.swap(false, Ordering::SeqCst) {
            return Err(OrchestratorError::Target(format!(
                "restore into {} interrupted",
                self.identifier
            )));
        }

        *self.collections.write() = loaded;
        self.restores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        Ok(self.collection_names())
    }
}
