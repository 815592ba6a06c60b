//! CLI command definitions for media-forge.
//!
//! `run` submits one generation job for a script file and follows it to
//! completion; `health` prints the model health report.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ForgeConfig;
use crate::metrics::{export_metrics, init_metrics};
use crate::orchestrator::Orchestrator;
use crate::progress::JobSnapshot;
use crate::scheduler::{AssetType, GenerationRequest, Status};

/// How often `run` re-reads the job from the store, in case progress
/// events were dropped.
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Multi-model media generation orchestrator.
#[derive(Parser)]
#[command(name = "media-forge")]
#[command(about = "Orchestrate script-to-media generation jobs across generation models")]
#[command(version)]
#[command(
    long_about = "media-forge plans assets from a script, generates them on a pool of workers with model fallback, and reports throttled progress.\n\nExample usage:\n  media-forge run script.txt --types image,audio --num-assets 4 --model flux-pro"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file; FORGE_* environment variables override it.
    #[arg(short, long, global = true, env = "FORGE_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Submit a job for a script and follow it until it finishes.
    Run(RunArgs),

    /// Print the model health report as JSON.
    Health,
}

/// Arguments for `media-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the script file.
    pub script: PathBuf,

    /// Comma-separated asset types (image, video, audio).
    #[arg(short, long, value_delimiter = ',', default_value = "image")]
    pub types: Vec<AssetType>,

    /// Number of assets to generate.
    #[arg(short = 'n', long, default_value = "3")]
    pub num_assets: u32,

    /// Preferred model; defaults to the configured default model.
    #[arg(short, long)]
    pub model: Option<String>,

    /// Fail instead of switching to a fallback model.
    #[arg(long)]
    pub no_fallback: bool,

    /// Print Prometheus metrics after the job finishes.
    #[arg(long)]
    pub metrics: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config =
        ForgeConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Run(args) => run_job_command(config, args).await,
        Commands::Health => run_health_command(config).await,
    }
}

async fn run_job_command(config: ForgeConfig, args: RunArgs) -> anyhow::Result<()> {
    let script = fs::read_to_string(&args.script)
        .with_context(|| format!("Failed to read script {}", args.script.display()))?;

    if args.metrics {
        if let Err(e) = init_metrics() {
            warn!(error = %e, "Failed to register metrics");
        }
    }

    let orchestrator = Orchestrator::from_config(config)
        .await
        .context("Failed to build orchestrator")?;
    let events = orchestrator.subscribe();
    orchestrator.start().await?;

    let mut request = GenerationRequest::new(script, args.types.clone(), args.num_assets)
        .with_allow_fallback(!args.no_fallback);
    if let Some(model) = &args.model {
        request = request.with_preferred_model(model.clone());
    }

    let receipt = orchestrator.submit(&request).await?;
    info!(
        job_id = %receipt.job_id,
        estimated_completion = ?receipt.estimated_completion,
        "Job accepted"
    );

    let outcome = follow_job(&orchestrator, receipt.job_id, events).await;
    orchestrator.shutdown().await?;
    let final_status = outcome?;

    println!("{}", serde_json::to_string_pretty(&final_status)?);
    if args.metrics {
        println!("{}", export_metrics());
    }

    if final_status.status == Status::Failed {
        anyhow::bail!(
            "Job {} failed: {}",
            final_status.job_id,
            final_status.error_message.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// Prints progress lines for `job_id` until it is terminal, then returns
/// its committed state.
async fn follow_job(
    orchestrator: &Orchestrator,
    job_id: Uuid,
    events: broadcast::Receiver<JobSnapshot>,
) -> anyhow::Result<JobSnapshot> {
    let mut events = BroadcastStream::new(events);
    let mut poll = tokio::time::interval(STATUS_POLL_INTERVAL);

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(Ok(snapshot)) if snapshot.job_id == job_id => {
                    print_progress(&snapshot);
                    if snapshot.is_terminal() {
                        break;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!(skipped = skipped, "Progress subscriber lagged");
                }
                None => break,
            },
            _ = poll.tick() => {
                if orchestrator.get_status(job_id).await?.is_terminal() {
                    break;
                }
            }
        }
    }

    // Snapshots are best effort; the store has the final word.
    Ok(orchestrator.get_status(job_id).await?)
}

fn print_progress(snapshot: &JobSnapshot) {
    let done = snapshot
        .tasks
        .iter()
        .filter(|t| t.status.is_terminal())
        .count();
    println!(
        "[{}] {:>5.1}% {} ({}/{} assets){}",
        snapshot.job_id,
        snapshot.progress_percentage,
        snapshot.status,
        done,
        snapshot.tasks.len(),
        snapshot
            .model_selected
            .as_deref()
            .map(|m| format!(" model={}", m))
            .unwrap_or_default()
    );
}

async fn run_health_command(config: ForgeConfig) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::from_config(config)
        .await
        .context("Failed to build orchestrator")?;
    println!("{}", serde_json::to_string_pretty(&orchestrator.health())?);
    Ok(())
}
