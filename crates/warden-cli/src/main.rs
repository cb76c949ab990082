//! `warden` operator command line
//!
//! Every command prints one JSON document on stdout; logs go to stderr.
//! Exit status is 0 on success, 1 when the pipeline refused or rolled back
//! the request and 2 on error.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use warden_core::prelude::*;
use warden_core::ApplyPatchOutcome;

#[derive(Debug, Parser)]
#[command(name = "warden", version, about = "Gated, rollback-safe patch deployment")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Project root; overrides the configuration file
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Review and apply a file in one step
    Deploy {
        #[command(flatten)]
        candidate: Candidate,
        /// Task description; part of the idempotency key
        #[arg(long, default_value = "")]
        task: String,
        #[arg(long)]
        task_id: Option<String>,
        #[arg(long)]
        job_id: Option<String>,
    },
    /// Run the curator only
    Review {
        #[command(flatten)]
        candidate: Candidate,
        #[arg(long, default_value = "")]
        task: String,
    },
    /// Record a patch for later approval-gated apply
    Submit {
        #[command(flatten)]
        candidate: Candidate,
        #[arg(long, default_value = "")]
        author: String,
        #[arg(long)]
        task_id: Option<String>,
        #[arg(long)]
        job_id: Option<String>,
    },
    /// Apply a submitted patch
    Apply {
        id: PatchId,
        #[arg(long)]
        token: String,
    },
    /// Show a patch and its events
    Show { id: PatchId },
    /// List patches, newest first
    List {
        #[arg(long)]
        status: Option<PatchStatus>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Saved versions of a file
    History { target: String },
    /// Put a saved version back in place
    Revert { target: String, version: i64 },
    /// Whole-tree snapshots
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
}

#[derive(Debug, Subcommand)]
enum SnapshotCommand {
    Create {
        #[arg(long, default_value = "")]
        description: String,
    },
    Restore { id: i64 },
    List,
}

#[derive(Debug, Args)]
struct Candidate {
    /// Root-relative target path
    #[arg(long)]
    target: String,
    /// File holding the new content; `-` reads stdin
    #[arg(long, default_value = "-")]
    file: PathBuf,
}

impl Candidate {
    fn read(&self) -> Result<String> {
        if self.file == Path::new("-") {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("failed to read candidate from stdin")?;
            Ok(code)
        } else {
            std::fs::read_to_string(&self.file)
                .with_context(|| format!("failed to read {}", self.file.display()))
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(cli: &Cli) -> Result<WardenConfig> {
    let mut config = match &cli.config {
        Some(path) => WardenConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => WardenConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.root.clone_from(root);
    }
    Ok(config)
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn status(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    let pipeline = PatchPipeline::open(&config)
        .await
        .with_context(|| format!("failed to open pipeline at {}", config.root.display()))?;

    match cli.command {
        Command::Deploy {
            candidate,
            task,
            task_id,
            job_id,
        } => {
            let request = DeployRequest {
                target_path: candidate.target.clone(),
                code: candidate.read()?,
                task_text: task,
                task_id,
                job_id,
            };
            let outcome = pipeline.deploy(request).await?;
            print(&outcome)?;
            Ok(status(outcome.succeeded()))
        }
        Command::Review { candidate, task } => {
            let code = candidate.read()?;
            let decision = pipeline.review(&task, &code, &candidate.target, None).await;
            print(&decision)?;
            Ok(status(decision.is_approved()))
        }
        Command::Submit {
            candidate,
            author,
            task_id,
            job_id,
        } => {
            let request = SubmitRequest {
                author,
                target_path: candidate.target.clone(),
                content: candidate.read()?,
                task_id,
                job_id,
            };
            let outcome = pipeline.submit_patch(request).await?;
            print(&outcome)?;
            Ok(status(outcome.status == PatchStatus::Approved))
        }
        Command::Apply { id, token } => {
            let response = pipeline.apply_patch(id, &token).await?;
            print(&response)?;
            Ok(status(response.outcome == ApplyPatchOutcome::Success))
        }
        Command::Show { id } => match pipeline.get_patch(id).await? {
            Some(details) => {
                print(&details)?;
                Ok(ExitCode::SUCCESS)
            }
            None => anyhow::bail!("no patch {id}"),
        },
        Command::List { status, limit } => {
            print(&pipeline.list_patches(status, limit).await?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::History { target } => {
            let relative = pipeline.root().resolve(&target)?.relative().to_string();
            let history: Vec<_> = pipeline
                .versions()
                .history(&relative)
                .await?
                .into_iter()
                .map(|v| {
                    serde_json::json!({
                        "version_id": v.version_id,
                        "sha256": v.content_hash,
                        "bytes": v.content.len(),
                        "patch_id": v.patch_id,
                        "created_at": v.created_at,
                    })
                })
                .collect();
            print(&history)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Revert { target, version } => {
            print(&pipeline.revert_file(&target, version).await?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Snapshot(SnapshotCommand::Create { description }) => {
            print(&pipeline.create_snapshot(&description).await?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Snapshot(SnapshotCommand::Restore { id }) => {
            print(&pipeline.restore_snapshot(id).await?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Snapshot(SnapshotCommand::List) => {
            print(&pipeline.list_snapshots().await?)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            let operator = err
                .downcast_ref::<PatchError>()
                .is_some_and(PatchError::requires_operator);
            if operator {
                tracing::error!(error = %err, "target left inconsistent; manual repair required");
            }
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}
