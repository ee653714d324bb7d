mod commands;
mod config;
mod progress;

use anyhow::Result;
use cipherset_core::CancelFlag;
use clap::{Parser, Subcommand};
use commands::{
    Outcome, backup::BackupCommand, create_set::CreateSetCommand,
    generate_key::GenerateKeyCommand, recover::RecoverCommand, restore::RestoreCommand,
};
use config::Settings;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "cipherset",
    about = "Encrypted differential backups of folder sets",
    long_about = "Cipherset copies changed files from a set of source folders into an encrypted, compressed archive and restores them on demand"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, env = "CIPHERSET_CONFIG", help = "Config file path")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Generate a new key file")]
    GenerateKey(GenerateKeyCommand),

    #[command(about = "Create a backup set file")]
    CreateSet(CreateSetCommand),

    #[command(about = "Back up one or more sets")]
    Backup(BackupCommand),

    #[command(about = "Restore one or more sets")]
    Restore(RestoreCommand),

    #[command(about = "Restore from an index file when the set file is lost")]
    Recover(RecoverCommand),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    match run(&cli).await {
        Ok(Outcome::Clean) => ExitCode::SUCCESS,
        Ok(Outcome::WithErrors) => ExitCode::from(3),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: &Cli) -> Result<Outcome> {
    let settings = Settings::load(cli.config.as_deref())?;
    debug!(?settings, "Starting cipherset");

    let cancel = CancelFlag::new();
    watch_interrupt(cancel.clone());

    match &cli.command {
        Commands::GenerateKey(cmd) => cmd.run(),
        Commands::CreateSet(cmd) => cmd.run(&settings),
        Commands::Backup(cmd) => cmd.run(cli, &settings, cancel).await,
        Commands::Restore(cmd) => cmd.run(cli, &settings, cancel).await,
        Commands::Recover(cmd) => cmd.run(cli, &settings, cancel).await,
    }
}

fn watch_interrupt(cancel: CancelFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing files in progress");
            cancel.cancel();
        }
    });
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cipherset={0},cipherset_core={0}", level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Setting default subscriber failed");
}
