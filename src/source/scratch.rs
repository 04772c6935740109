//! Disposable verification targets.
//!
//! Every verification run gets a freshly provisioned target that is dropped again when
//! the run ends, so no state leaks from one run into the next.

use super::command::{CommandSpec, CommandTarget, CommandTargetConfig};
use super::{DatabaseTarget, MemoryDatabase};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Creates and destroys isolated restore targets
#[async_trait]
pub trait ScratchProvisioner: Send + Sync {
    /// A new, empty, non-production target
    async fn provision(&self) -> Result<Arc<dyn DatabaseTarget>>;

    /// Destroy a target returned by [`ScratchProvisioner::provision`]
    async fn teardown(&self, target: Arc<dyn DatabaseTarget>) -> Result<()>;
}

/// Provisions [`MemoryDatabase`]s named `verify-scratch-1`, `verify-scratch-2`, ...
#[derive(Default)]
pub struct MemoryScratchProvisioner {
    next: AtomicUsize,
    live: Mutex<HashMap<String, Arc<MemoryDatabase>>>,
    provisioned: Mutex<Vec<String>>,
    torn_down: Mutex<Vec<String>>,
    fail_next_teardown: AtomicBool,
}

impl MemoryScratchProvisioner {
    /// Create a provisioner
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of targets that exist right now
    pub fn live(&self) -> Vec<String> {
        let mut names: Vec<String> = self.live.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Every target ever provisioned, in order
    pub fn provisioned(&self) -> Vec<String> {
        self.provisioned.lock().clone()
    }

    /// Every target torn down, in order
    pub fn torn_down(&self) -> Vec<String> {
        self.torn_down.lock().clone()
    }

    /// Live target by name
    pub fn get(&self, name: &str) -> Option<Arc<MemoryDatabase>> {
        self.live.lock().get(name).cloned()
    }

    /// Make the next teardown fail
    pub fn fail_next_teardown(&self) {
        self.fail_next_teardown.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ScratchProvisioner for MemoryScratchProvisioner {
    async fn provision(&self) -> Result<Arc<dyn DatabaseTarget>> {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!("verify-scratch-{}", n);
        let database = Arc::new(MemoryDatabase::scratch(name.clone()));

        self.live.lock().insert(name.clone(), database.clone());
        self.provisioned.lock().push(name.clone());
        info!(target_name = %name, "Provisioned scratch target");
        Ok(database)
    }

    async fn teardown(&self, target: Arc<dyn DatabaseTarget>) -> Result<()> {
        let name = target.identifier().to_string();
        if self.fail_next_teardown.swap(false, Ordering::SeqCst) {
            return Err(crate::OrchestratorError::Target(format!("could not drop {}", name)));
        }
        self.live.lock().remove(&name);
        self.torn_down.lock().push(name.clone());
        info!(target_name = %name, "Tore down scratch target");
        Ok(())
    }
}

/// Scratch targets created through external commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandScratchConfig {
    /// Prefix of generated target names
    pub name_prefix: String,
    /// Connection URI template; `{name}` is replaced by the generated name
    pub uri_template: String,
    /// Optional command run before first use (`{uri}` substituted)
    #[serde(default)]
    pub create: Option<CommandSpec>,
    /// Command that destroys the target (`{uri}` substituted)
    pub drop: CommandSpec,
    /// Dump/restore/list tooling for the generated targets
    pub dump: CommandSpec,
    /// Restore tool
    pub restore: CommandSpec,
    /// Collection listing
    pub list_collections: CommandSpec,
}

impl CommandScratchConfig {
    /// MongoDB databases on one server, e.g. `mongodb://verify-host:27017/{name}`
    pub fn mongodb(uri_template: impl Into<String>) -> Self {
        let tools = CommandTargetConfig::mongodb("template", "", false);
        Self {
            name_prefix: "verify-scratch".to_string(),
            uri_template: uri_template.into(),
            create: None,
            drop: CommandSpec::new(["mongosh", "{uri}", "--quiet", "--eval", "db.dropDatabase()"]),
            dump: tools.dump,
            restore: tools.restore,
            list_collections: tools.list_collections,
        }
    }
}

/// Provisions [`CommandTarget`]s from a template
pub struct CommandScratchProvisioner {
    config: CommandScratchConfig,
}

impl CommandScratchProvisioner {
    /// Create a provisioner
    pub fn new(config: CommandScratchConfig) -> Self {
        Self { config }
    }

    fn uri_for(&self, name: &str) -> String {
        self.config.uri_template.replace("{name}", name)
    }
}

#[async_trait]
impl ScratchProvisioner for CommandScratchProvisioner {
    async fn provision(&self) -> Result<Arc<dyn DatabaseTarget>> {
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", self.config.name_prefix, &suffix[..8]);
        let uri = self.uri_for(&name);

        if let Some(create) = &self.config.create {
            create.run(&uri).await?;
        }

        info!(target_name = %name, "Provisioned scratch target");
        Ok(Arc::new(CommandTarget::new(CommandTargetConfig {
            identifier: name,
            uri,
            production: false,
            dump: self.config.dump.clone(),
            restore: self.config.restore.clone(),
            list_collections: self.config.list_collections.clone(),
        })))
    }

    async fn teardown(&self, target: Arc<dyn DatabaseTarget>) -> Result<()> {
        let name = target.identifier().to_string();
        self.config.drop.run(&self.uri_for(&name)).await?;
        info!(target_name = %name, "Tore down scratch target");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_provisioner_names_and_teardown() {
        let provisioner = MemoryScratchProvisioner::new();

        let first = provisioner.provision().await.unwrap();
        let second = provisioner.provision().await.unwrap();
        assert_eq!(first.identifier(), "verify-scratch-1");
        assert_eq!(second.identifier(), "verify-scratch-2");
        assert!(!first.is_production());
        assert_eq!(provisioner.live(), vec!["verify-scratch-1", "verify-scratch-2"]);

        provisioner.teardown(first).await.unwrap();
        assert_eq!(provisioner.live(), vec!["verify-scratch-2"]);
        assert_eq!(provisioner.torn_down(), vec!["verify-scratch-1"]);

        provisioner.fail_next_teardown();
        assert!(provisioner.teardown(second).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_provisioner_runs_drop() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("dropped");
        let mut config = CommandScratchConfig::mongodb("mem://{name}");
        config.drop = CommandSpec::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("echo {{uri}} > {}", marker.display()),
        ]);

        let provisioner = CommandScratchProvisioner::new(config);
        let target = provisioner.provision().await.unwrap();
        let name = target.identifier().to_string();
        assert!(name.starts_with("verify-scratch-"));

        provisioner.teardown(target).await.unwrap();
        let written = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(written.trim(), format!("mem://{}", name));
    }
}
