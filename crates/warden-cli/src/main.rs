//! wardend - supervisor daemon for restic-compatible backups

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use warden_core::Config;
use warden_daemon::Daemon;

#[derive(Parser)]
#[command(name = "wardend")]
#[command(about = "Supervisor for restic-compatible backups", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory for the operation log, log blobs, and secrets
    #[arg(long, default_value = ".warden", global = true)]
    data_dir: PathBuf,

    /// Path to the configuration file
    #[arg(long, default_value = "warden.toml", global = true)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Run,

    /// Write a starter configuration file
    Init,

    /// Parse and validate the configuration, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("WARDEN_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Run => run(&cli).await,
        Commands::Init => init(&cli),
        Commands::CheckConfig => check_config(&cli),
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let config = Config::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if config.plans.is_empty() {
        info!(
            "no plans configured; edit {} and send SIGHUP or restart",
            cli.config.display()
        );
    }

    let daemon = Daemon::start(&cli.data_dir, cli.config.clone(), config)
        .await
        .context("starting daemon")?;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("interrupt received");
    daemon.stop().await.context("stopping daemon")?;
    Ok(())
}

fn init(cli: &Cli) -> Result<()> {
    if cli.config.exists() {
        anyhow::bail!("{} already exists", cli.config.display());
    }
    let starter = Config::default();
    starter
        .save(&cli.config)
        .with_context(|| format!("writing {}", cli.config.display()))?;
    println!("wrote {}", cli.config.display());
    println!("declare at least one [[repos]] and one [[plans]] entry, then `wardend run`");
    Ok(())
}

fn check_config(cli: &Cli) -> Result<()> {
    let config =
        Config::load(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?;
    println!(
        "ok: {} repo(s), {} plan(s)",
        config.repos.len(),
        config.plans.len()
    );
    Ok(())
}
