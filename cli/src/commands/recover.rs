use super::Outcome;
use crate::Cli;
use crate::config::Settings;
use crate::progress::BarObserver;
use anyhow::Result;
use cipherset_core::{CancelFlag, RestoreOptions, RunContext, operations};
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct RecoverCommand {
    #[arg(help = "Index file of the set to recover")]
    index: PathBuf,

    #[arg(long, help = "Folder to recover into")]
    destination: PathBuf,

    #[arg(long, help = "Key file the set was encrypted with")]
    key_file: PathBuf,

    #[arg(long, help = "Archive file extension (looked up next to the index if omitted)")]
    extension: Option<String>,

    #[arg(long, help = "Dry run - don't actually restore")]
    dry_run: bool,

    #[arg(long, env = "CIPHERSET_WORKERS", help = "Files restored in parallel")]
    workers: Option<usize>,
}

impl RecoverCommand {
    pub async fn run(&self, cli: &Cli, settings: &Settings, cancel: CancelFlag) -> Result<Outcome> {
        let options = RestoreOptions {
            dry_run: self.dry_run,
            workers: settings.workers(self.workers),
            ..RestoreOptions::to_root(std::path::absolute(&self.destination)?)
        };
        if self.dry_run {
            println!("DRY RUN - no files will be written");
        }

        let observer = BarObserver::new(cli.quiet)?;
        let ctx = RunContext::new(observer.clone(), cancel);
        let summary = operations::run_recover(
            &self.index,
            Some(self.key_file.as_path()),
            self.extension.as_deref(),
            &options,
            &ctx,
        )
        .await?;
        observer.finish();

        println!("{}", summary);
        Ok(Outcome::from_errors(summary.has_errors()))
    }
}
