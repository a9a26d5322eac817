use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use ota_engine::capabilities::NullCapabilities;
use ota_engine::config::Config;
use ota_engine::engine::UpdateEngine;
use ota_engine::fetcher::Fetcher;
use ota_engine::resolver;
use ota_engine::swap::SwapOrchestrator;
use ota_engine::transport::AlwaysOnTransport;
use ota_engine::version_record::VersionRecord;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Crash-safe OTA update engine", long_about = None)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "ota.toml")]
    config: PathBuf,
    /// Root of the live tree the engine manages.
    #[arg(long, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve the configured channel to a target ref/commit without
    /// downloading or changing anything.
    Resolve,
    /// Run a full update attempt: resolve, stage, swap, reset.
    Run,
    /// Stage candidates only, leaving the live tree untouched (dry run of
    /// the fetch/verify path).
    Stage,
    /// Run only the swap step against whatever is already staged.
    Swap,
    /// Run boot recovery only: restore from a non-empty backup directory
    /// and clear stray staging artifacts.
    Recover,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let cfg = Config::from_file(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?;
    let caps = NullCapabilities;

    match cli.command {
        Commands::Resolve => {
            let fetcher = Fetcher::new(&cfg, &caps)?;
            let target = resolver::resolve_target(&cfg, &fetcher)?;
            println!("ref={} commit={}", target.ref_, target.commit);
        }
        Commands::Run => {
            // No connectivity collaborator is wired into this standalone
            // binary; an embedding application that knows its link's
            // bandwidth/cost should use `UpdateEngine::with_transport`
            // instead so delta preference reflects the active link.
            let transport = AlwaysOnTransport;
            let engine = UpdateEngine::with_transport(cfg, &caps, &transport, cli.root.clone());
            let outcome = engine.run()?;
            info!(outcome = outcome.reason_line(), "update attempt finished");
            println!("{}", outcome.reason_line());
            std::process::exit(outcome.exit_code());
        }
        Commands::Stage => {
            return Err(anyhow!(
                "stage-only runs require a resolved target; use `run` for the full attempt"
            ));
        }
        Commands::Swap => {
            let orchestrator = SwapOrchestrator::new(&cli.root, &cfg.stage_dir, &cfg.backup_dir)?;
            let current = VersionRecord::read(&cli.root)?
                .ok_or_else(|| anyhow!("no installed-version record to carry forward"))?;
            let outcome = orchestrator.run_swap(&[], &cfg.delete_patterns, &current)?;
            println!("applied={} deleted={}", outcome.applied, outcome.deleted);
        }
        Commands::Recover => {
            // Boot recovery runs as a side effect of construction.
            SwapOrchestrator::new(&cli.root, &cfg.stage_dir, &cfg.backup_dir)?;
            println!("recovery complete");
        }
    }
    Ok(())
}
