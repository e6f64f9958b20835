use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use fleetroll_config::Config;
use fleetroll_rollout::tui::TuiProgress;
use fleetroll_rollout::{
    detect_multiple_image_versions, plan_rollout, run_rollout, DesiredFleet, HeadlessProgress, HttpMachines,
    ProgressSink, RolloutOptions,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleetroll", version, about = "Lease-gated rolling updates for machine fleets")]
struct Cli {
    /// Path to the config file (default: ./.fleetroll.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Roll the fleet to the machines described in a fleet file
    Deploy {
        /// JSON fleet file: {"machines": [...]}
        #[arg(long)]
        fleet: PathBuf,
        /// Return the first failure instead of rolling back
        #[arg(long)]
        no_push_forward: bool,
        /// Plain line output even on a terminal
        #[arg(long)]
        headless: bool,
    },
    /// Show what a deploy would do, without changing anything
    Plan {
        #[arg(long)]
        fleet: PathBuf,
    },
    /// List machines running an image other than the newest one
    Images,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)?,
        None => Config::load_from_dir(Path::new("."))?,
    };
    Ok(config)
}

/// Logs gehen nach stderr, stdout gehört der Fortschrittsanzeige.
fn init_tracing(level: &str, quiet: bool) {
    let default = if quiet { "error" } else { level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let use_tui = matches!(cli.command, Commands::Deploy { headless: false, .. }) && std::io::stdout().is_terminal();
    init_tracing(&config.log.level, use_tui);

    if config.api.token().is_none() {
        warn!(token_env = %config.api.token_env, "no API token set, requests are unauthenticated");
    }
    let api = Arc::new(HttpMachines::from_config(&config.api)?);

    match cli.command {
        Commands::Deploy { fleet, no_push_forward, .. } => {
            let desired = DesiredFleet::load(&fleet)?;
            let mut options = RolloutOptions::from(&config.rollout);
            if no_push_forward {
                options.push_forward = false;
            }
            debug!(machines = desired.machines.len(), ?options, "starting rollout");

            let cancel = CancellationToken::new();
            let interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    interrupt.cancel();
                }
            });

            if use_tui {
                let (progress, tui) = TuiProgress::start(cancel.clone())?;
                let result = run_rollout(api, desired, options, Arc::new(progress), cancel).await;
                let summary = match &result {
                    Ok(()) => "Rollout complete".to_string(),
                    Err(err) => format!("Rollout failed: {}", err),
                };
                tui.finish(summary).await?;
                result?;
            } else {
                let progress: Arc<dyn ProgressSink> = Arc::new(HeadlessProgress::new());
                println!("Rolling out {} machine(s) of {}", desired.machines.len(), config.api.app);
                run_rollout(api, desired, options, progress, cancel).await?;
            }

            println!("Rollout complete.");
        }
        Commands::Plan { fleet } => {
            let desired = DesiredFleet::load(&fleet)?;
            let plan = plan_rollout(api.as_ref(), &desired).await?;

            if plan.touched() == 0 && plan.ignored.is_empty() {
                println!("Nothing to do.");
                return Ok(ExitCode::SUCCESS);
            }

            println!("Plan for {}:\n", config.api.app);
            for id in &plan.updates {
                println!("  update     {}", id);
            }
            for id in &plan.creates {
                println!("  create     {}", id);
            }
            for id in &plan.unchanged {
                println!("  unchanged  {}", id);
            }
            for id in &plan.ignored {
                println!("  ignored    {} (not in fleet file, left untouched)", id);
            }
        }
        Commands::Images => {
            let outdated = detect_multiple_image_versions(api.as_ref()).await?;

            if outdated.is_empty() {
                println!("All machines run the newest image.");
                return Ok(ExitCode::SUCCESS);
            }

            println!("{} machine(s) run an outdated image:\n", outdated.len());
            for machine in &outdated {
                println!("  {}  {}  {}", machine.id, machine.region, machine.image());
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
