//! Command-line entry point.

use anyhow::Context;
use backup_orchestrator::backup::{BackupRecord, Tier};
use backup_orchestrator::restore::RestoreRequest;
use backup_orchestrator::{Orchestrator, OrchestratorConfig, RunResult};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Tiered backup, verification and disaster recovery.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, rename_all = "kebab-case")]
struct Opts {
    /// JSON configuration file. Without it, settings come from the environment.
    #[arg(long, value_name = "FILE", env = "BACKUP_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Command {
    /// Back up the production database into a tier
    Backup {
        /// daily, weekly, monthly or annual
        tier: String,
    },
    /// Restore a backup into a scratch target and validate it
    Verify {
        /// A tier (latest backup) or a backup key
        selector: String,
    },
    /// Overwrite a target with a backup, after taking a safety backup of it
    Restore {
        /// Confirmation literal; the restore is refused without it
        #[arg(long)]
        confirm: String,
        /// Backup key to restore
        #[arg(long)]
        key: String,
        /// Target identifier
        #[arg(long)]
        target: String,
        /// Operator name recorded in the audit log
        #[arg(long, env = "USER", default_value = "unknown")]
        requested_by: String,
    },
    /// Apply retention policies and remove orphaned uploads
    Sweep,
    /// List committed backups of a tier
    List {
        /// Tier to list
        tier: String,
    },
}

/// The single JSON document printed on stdout
#[derive(Debug, Serialize)]
struct Output {
    #[serde(flatten)]
    result: RunResult,
    /// Only set by `list`
    #[serde(skip_serializing_if = "Option::is_none")]
    records: Option<Vec<BackupRecord>>,
}

impl From<RunResult> for Output {
    fn from(result: RunResult) -> Self {
        Self { result, records: None }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(opts: Opts) -> anyhow::Result<Output> {
    let config = match &opts.config {
        Some(path) => OrchestratorConfig::from_file(path)?,
        None => OrchestratorConfig::from_env()?,
    };
    let orchestrator = Orchestrator::from_config(config)
        .await
        .context("failed to initialise orchestrator")?;

    let result = match opts.command {
        Command::Backup { tier } => orchestrator.run_backup(&tier).await,
        Command::Verify { selector } => orchestrator.run_verification(&selector).await,
        Command::Restore {
            confirm,
            key,
            target,
            requested_by,
        } => {
            orchestrator
                .run_restore_as(RestoreRequest {
                    confirmation_token: confirm,
                    source_backup_key: key,
                    target_identifier: target,
                    requested_by,
                })
                .await
        }
        Command::Sweep => orchestrator.run_retention_sweep().await,
        Command::List { tier } => {
            let tier: Tier = tier.parse()?;
            let records = orchestrator.list_backups(tier).await?;
            return Ok(Output {
                result: RunResult {
                    success: true,
                    detail: format!("{} {} backups", records.len(), tier),
                    record_key: records.last().map(|r| r.key.clone()),
                    error_kind: None,
                },
                records: Some(records),
            });
        }
    };
    Ok(result.into())
}

#[tokio::main]
async fn main() {
    let opts = Opts::parse();
    init_tracing(opts.json_logs);

    let code = match run(opts).await {
        Ok(output) => {
            match serde_json::to_string(&output) {
                Ok(body) => println!("{}", body),
                Err(e) => tracing::error!(error = %e, "Failed to encode result"),
            }
            output.result.exit_code()
        }
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Startup failed");
            1
        }
    };
    std::process::exit(code);
}
