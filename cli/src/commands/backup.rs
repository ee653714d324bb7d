use super::Outcome;
use crate::Cli;
use crate::config::Settings;
use crate::progress::BarObserver;
use anyhow::Result;
use cipherset_core::{BackupOptions, CancelFlag, RunContext, operations};
use clap::Args;
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct BackupCommand {
    #[arg(required = true, help = "Backup set files")]
    sets: Vec<PathBuf>,

    #[arg(long, help = "Dry run - don't actually backup")]
    dry_run: bool,

    #[arg(long, env = "CIPHERSET_WORKERS", help = "Files copied in parallel")]
    workers: Option<usize>,
}

impl BackupCommand {
    pub async fn run(&self, cli: &Cli, settings: &Settings, cancel: CancelFlag) -> Result<Outcome> {
        let options = BackupOptions {
            dry_run: self.dry_run,
            workers: settings.workers(self.workers),
        };
        if self.dry_run {
            println!("DRY RUN - no data will be written");
        }
        info!("Backing up {} set(s) with {} worker(s)", self.sets.len(), options.workers);

        let observer = BarObserver::new(cli.quiet)?;
        let ctx = RunContext::new(observer.clone(), cancel);
        let summary = operations::run_backup(&self.sets, &options, &ctx).await?;
        observer.finish();

        println!("{}", summary);
        Ok(Outcome::from_errors(summary.has_errors()))
    }
}
