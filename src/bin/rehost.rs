//! rehost: one invocation of the attachment migration.
//! Configuration comes from REHOST_* env vars (see `MigrationConfig::from_env`);
//! flags override individual values. Designed to be re-run (cron, CI) until
//! `remaining` reaches zero.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use attachment_rehost::checkpoint::{CheckpointStore, JsonFileStore, ProgressHandle};
use attachment_rehost::clock::{Clock, TokioClock};
use attachment_rehost::config::{quota_from_env, EngineSettings, MigrationConfig};
use attachment_rehost::orchestrator::{Orchestrator, StatusReport};
use attachment_rehost::source::HttpTabularSource;
use attachment_rehost::uploader::HttpImageHost;
use attachment_rehost::util::env as env_util;
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "rehost",
    version,
    about = "Re-host record attachments under an upload quota",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    // `rehost --dry-run` works without the explicit `run` subcommand.
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Migrate the next batch of records (default when no command supplied)
    Run(RunArgs),
    /// Print checkpoint totals, quota usage and recent errors without network access
    Status(StatusArgs),
    /// Drop record ids from the checkpoint so the next run retries them
    Requeue(RequeueArgs),
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Resolve and report only; no uploads, patches or checkpoint writes
    #[arg(long = "dry-run", action = ArgAction::SetTrue)]
    dry_run: bool,
    /// Records needing upload to take on in this invocation (0 = no cap)
    #[arg(long)]
    max_uploads: Option<usize>,
    /// Records processed concurrently (1..=10)
    #[arg(long)]
    concurrency: Option<usize>,
    /// Field mappings, e.g. `Logo:LogoUrl,Photo:PhotoUrl|PhotoBackup`
    #[arg(long)]
    fields: Option<String>,
    /// Checkpoint file location
    #[arg(long)]
    checkpoint: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct StatusArgs {
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// Number of recent errors to print
    #[arg(long, default_value_t = 10)]
    errors: usize,
}

#[derive(Debug, Args)]
struct RequeueArgs {
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// Record ids to retry
    #[arg(required = true)]
    record_ids: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    attachment_rehost::tracing::init_tracing("info,attachment_rehost=info")?;
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Run(args)) => run(args).await,
        None => run(cli.run).await,
        Some(Command::Status(args)) => status(args).await,
        Some(Command::Requeue(args)) => requeue(args).await,
    }
}

/// `fields` replaces `REHOST_FIELDS` before the default checkpoint path is derived.
fn load_config(checkpoint: Option<PathBuf>, fields: Option<&str>) -> Result<MigrationConfig> {
    let mut cfg = MigrationConfig::from_env_with_fields(fields)
        .context("loading REHOST_* configuration")?;
    if let Some(path) = checkpoint {
        cfg.checkpoint_path = path;
    }
    Ok(cfg)
}

async fn run(args: RunArgs) -> Result<()> {
    let mut cfg = load_config(args.checkpoint, args.fields.as_deref())?;
    if let Some(cap) = args.max_uploads {
        cfg.engine.max_uploads_per_run = (cap > 0).then_some(cap);
    }
    if let Some(n) = args.concurrency {
        cfg.engine.concurrency = n;
    }
    cfg.engine.dry_run = args.dry_run;
    cfg.validate()?;

    let source = HttpTabularSource::new(
        &cfg.source.base_url,
        &cfg.source.container,
        &cfg.source.token,
        cfg.source.timeout,
    )
    .context("building source client")?
    .with_page_size(cfg.source.page_size)
    .with_update_mode(cfg.source.update_mode);
    let host = HttpImageHost::new(&cfg.host.endpoint, &cfg.host.api_key, cfg.host.timeout)
        .context("building image host client")?;
    let store = JsonFileStore::new(cfg.checkpoint_path.clone());
    info!(
        checkpoint = %cfg.checkpoint_path.display(),
        container = %cfg.source.container,
        roles = ?cfg.engine.role_names(),
        budget = cfg.engine.quota.budget,
        window_secs = cfg.engine.quota.window.as_secs(),
        "starting migration run"
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; finishing the in-flight step and stopping");
                shutdown.cancel();
            }
        });
    }

    let orchestrator = Orchestrator::new(
        Arc::new(source),
        Arc::new(host),
        Arc::new(store),
        cfg.engine.clone(),
    )
    .with_shutdown(shutdown);

    match orchestrator.run().await {
        Ok(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "migration run aborted");
            Err(e.into())
        }
    }
}

/// `status` and `requeue` only touch the checkpoint, so credentials are not
/// needed when the path is given by flag or `REHOST_CHECKPOINT`.
fn checkpoint_store(checkpoint: Option<PathBuf>) -> Result<JsonFileStore> {
    let explicit =
        checkpoint.or_else(|| env_util::env_opt("REHOST_CHECKPOINT").map(PathBuf::from));
    let path = match explicit {
        Some(path) => path,
        None => load_config(None, None)?.checkpoint_path,
    };
    Ok(JsonFileStore::new(path))
}

async fn status(args: StatusArgs) -> Result<()> {
    let store = checkpoint_store(args.checkpoint)?;
    let progress = store
        .load()
        .await
        .with_context(|| format!("reading {}", store.path().display()))?;
    let quota = quota_from_env(EngineSettings::new(Vec::new()).quota)?;
    let now = TokioClock::new().now_millis();
    let report = StatusReport::from_progress(&progress, &quota, now, args.errors);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn requeue(args: RequeueArgs) -> Result<()> {
    let store = checkpoint_store(args.checkpoint)?;
    let path = store.path().display().to_string();
    let handle = ProgressHandle::open(Arc::new(store))
        .await
        .with_context(|| format!("reading {path}"))?;
    let removed = handle.requeue(&args.record_ids).await?;
    info!(removed, requested = args.record_ids.len(), checkpoint = %path, "records re-queued");
    Ok(())
}
