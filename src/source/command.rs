//! Databases driven through their own dump/restore tools

use super::{DatabaseTarget, DumpSource};
use crate::store::ByteReader;
use crate::{OrchestratorError, Result};
use async_trait::async_trait;
use futures::ready;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::process::{ChildStdout, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Keep at most this much stderr for error messages
const STDERR_TAIL: usize = 4096;

/// A command line; `{uri}` in any argument is replaced by the connection URI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandSpec(pub Vec<String>);

impl CommandSpec {
    /// Build from string slices
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(args.into_iter().map(Into::into).collect())
    }

    fn program(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or("<empty>")
    }

    fn command(&self, uri: &str) -> Result<Command> {
        let (program, args) = self
            .0
            .split_first()
            .ok_or_else(|| OrchestratorError::Invalid("empty command".to_string()))?;
        let mut command = Command::new(program);
        command.args(args.iter().map(|arg| arg.replace("{uri}", uri)));
        command.kill_on_drop(true);
        Ok(command)
    }

    /// Run to completion, failing on a non-zero exit
    pub async fn run(&self, uri: &str) -> Result<()> {
        let output = self
            .command(uri)?
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| OrchestratorError::Target(format!("failed to run {}: {}", self.program(), e)))?;
        if !output.status.success() {
            return Err(OrchestratorError::Target(format!(
                "{} exited with {}: {}",
                self.program(),
                output.status,
                tail(&output.stderr)
            )));
        }
        Ok(())
    }
}

/// Connection and tool configuration for a [`CommandTarget`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandTargetConfig {
    /// Stable name used in logs, events and lease keys
    pub identifier: String,
    /// Connection URI handed to the tools
    pub uri: String,
    /// Marks the live database; verification refuses it
    #[serde(default)]
    pub production: bool,
    /// Writes a full dump to stdout
    pub dump: CommandSpec,
    /// Reads a full dump from stdin, replacing existing data
    pub restore: CommandSpec,
    /// Prints one collection name per line
    pub list_collections: CommandSpec,
}

/// Canonical export: collections by name, documents by `_id`, canonical Extended JSON.
/// One header line per collection carries its secondary indexes. The output depends
/// only on the data, so a faithful restore exports to the same bytes.
const MONGO_EXPORT: &str = r#"db.getCollectionNames().filter(n => !n.startsWith('system.')).sort().forEach(n => {
  const c = db.getCollection(n);
  const indexes = c.getIndexes()
    .filter(i => i.name !== '_id_')
    .map(({ v, ns, ...spec }) => spec)
    .sort((a, b) => (a.name < b.name ? -1 : a.name > b.name ? 1 : 0));
  print('{"collection":' + JSON.stringify(n) + ',"indexes":' + EJSON.stringify(indexes, { relaxed: false }) + '}');
  c.find().sort({ _id: 1 }).forEach(d =>
    print('{"collection":' + JSON.stringify(n) + ',"document":' + EJSON.stringify(d, { relaxed: false }) + '}'));
});"#;

/// Inverse of [`MONGO_EXPORT`], read from stdin. Writes only into the database named
/// by the URI, replacing its collections.
const MONGO_IMPORT: &str = r#"const lines = require('readline').createInterface({ input: process.stdin, crlfDelay: Infinity });
db.getCollectionNames().filter(n => !n.startsWith('system.')).forEach(n => db.getCollection(n).drop());
let current = null;
let batch = [];
const flush = () => {
  if (batch.length) {
    db.getCollection(current).insertMany(batch, { ordered: true });
    batch = [];
  }
};
for await (const line of lines) {
  if (!line.trim()) continue;
  const entry = EJSON.parse(line, { relaxed: false });
  if (entry.collection !== current) {
    flush();
    current = entry.collection;
  }
  if (entry.document === undefined) {
    db.createCollection(current);
    if (entry.indexes && entry.indexes.length) {
      db.runCommand({ createIndexes: current, indexes: entry.indexes });
    }
  } else {
    batch.push(entry.document);
    if (batch.length >= 1000) flush();
  }
}
flush();"#;

impl CommandTargetConfig {
    /// MongoDB through `mongosh`: dumps are the canonical line export above rather
    /// than `mongodump` archives, whose byte layout varies between runs.
    pub fn mongodb(identifier: impl Into<String>, uri: impl Into<String>, production: bool) -> Self {
        Self {
            identifier: identifier.into(),
            uri: uri.into(),
            production,
            dump: CommandSpec::new(["mongosh", "{uri}", "--quiet", "--eval", MONGO_EXPORT]),
            restore: CommandSpec::new(["mongosh", "{uri}", "--quiet", "--eval", MONGO_IMPORT]),
            list_collections: CommandSpec::new([
                "mongosh",
                "{uri}",
                "--quiet",
                "--eval",
                "db.getCollectionNames().filter(n => !n.startsWith('system.')).join('\\n')",
            ]),
        }
    }
}

/// A database reached through external commands
pub struct CommandTarget {
    config: CommandTargetConfig,
}

impl CommandTarget {
    /// Create a target
    pub fn new(config: CommandTargetConfig) -> Self {
        Self { config }
    }

    /// Configuration
    pub fn config(&self) -> &CommandTargetConfig {
        &self.config
    }
}

fn tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

/// Stdout of a running dump command. End of stream is only reported once the
/// process exited successfully; a non-zero exit surfaces as a read error.
struct CommandOutput {
    stdout: ChildStdout,
    exit: Option<oneshot::Receiver<std::result::Result<(), String>>>,
}

impl AsyncRead for CommandOutput {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.stdout).poll_read(cx, buf))?;
        if buf.filled().len() > before || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let exit = match this.exit.as_mut() {
            Some(exit) => exit,
            None => return Poll::Ready(Ok(())),
        };
        let outcome = ready!(Pin::new(exit).poll(cx));
        this.exit = None;
        match outcome {
            Ok(Ok(())) => Poll::Ready(Ok(())),
            Ok(Err(message)) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, message))),
            Err(_) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "dump process lost"))),
        }
    }
}

#[async_trait]
impl DumpSource for CommandTarget {
    fn identifier(&self) -> &str {
        &self.config.identifier
    }

    async fn open_dump_stream(&self) -> Result<ByteReader> {
        let mut command = self
            .config
            .dump
            .command(&self.config.uri)
            .map_err(|e| OrchestratorError::SourceUnavailable(e.to_string()))?;
        command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            OrchestratorError::SourceUnavailable(format!("failed to start dump for {}: {}", self.config.identifier, e))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OrchestratorError::SourceUnavailable("dump stdout not captured".to_string()))?;
        let stderr = child.stderr.take();

        let stderr_task = tokio::spawn(async move {
            let mut captured = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut captured).await;
            }
            captured
        });

        let (tx, rx) = oneshot::channel();
        let identifier = self.config.identifier.clone();
        tokio::spawn(async move {
            let mut tx = tx;
            let status = tokio::select! {
                status = child.wait() => Some(status),
                _ = tx.closed() => None,
            };

            match status {
                Some(status) => {
                    let captured = stderr_task.await.unwrap_or_default();
                    let outcome = match status {
                        Ok(status) if status.success() => Ok(()),
                        Ok(status) => Err(format!("dump for {} exited with {}: {}", identifier, status, tail(&captured))),
                        Err(e) => Err(format!("dump for {} could not be awaited: {}", identifier, e)),
                    };
                    let _ = tx.send(outcome);
                }
                None => {
                    debug!(identifier = %identifier, "Dump reader dropped; stopping dump process");
                    let _ = child.kill().await;
                }
            }
        });

        Ok(Box::pin(CommandOutput { stdout, exit: Some(rx) }))
    }
}

#[async_trait]
impl DatabaseTarget for CommandTarget {
    fn is_production(&self) -> bool {
        self.config.production
    }

    async fn restore(&self, mut data: ByteReader) -> Result<()> {
        let mut command = self.config.restore.command(&self.config.uri)?;
        command.stdin(Stdio::piped()).stdout(Stdio::null()).stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            OrchestratorError::Target(format!("failed to start restore for {}: {}", self.config.identifier, e))
        })?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| OrchestratorError::Target("restore stdin not captured".to_string()))?;
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut captured = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut captured).await;
            }
            captured
        });

        let copied = tokio::io::copy(&mut data, &mut stdin).await;
        drop(stdin);

        if let Err(e) = copied {
            if e.kind() != io::ErrorKind::BrokenPipe {
                // Bad input; do not let the tool finish on a partial dump
                if let Err(kill_err) = child.kill().await {
                    warn!(identifier = %self.config.identifier, error = %kill_err, "Failed to stop restore process");
                }
                return Err(OrchestratorError::Target(format!(
                    "restore input for {} failed: {}",
                    self.config.identifier, e
                )));
            }
        }

        let status = child.wait().await.map_err(|e| {
            OrchestratorError::Target(format!("restore for {} could not be awaited: {}", self.config.identifier, e))
        })?;
        if !status.success() {
            let captured = stderr_task.await.unwrap_or_default();
            return Err(OrchestratorError::Target(format!(
                "restore for {} exited with {}: {}",
                self.config.identifier,
                status,
                tail(&captured)
            )));
        }
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let mut command = self.config.list_collections.command(&self.config.uri)?;
        let output = command
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| OrchestratorError::Target(format!("failed to query {}: {}", self.config.identifier, e)))?;
        if !output.status.success() {
            return Err(OrchestratorError::Target(format!(
                "collection query on {} exited with {}: {}",
                self.config.identifier,
                output.status,
                tail(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}
