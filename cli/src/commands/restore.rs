use super::Outcome;
use crate::Cli;
use crate::config::Settings;
use crate::progress::BarObserver;
use anyhow::Result;
use cipherset_core::{CancelFlag, RestoreOptions, RunContext, operations};
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct RestoreCommand {
    #[arg(required = true, help = "Backup set files")]
    sets: Vec<PathBuf>,

    #[arg(long, help = "Restore under this folder instead of in place")]
    chroot: Option<PathBuf>,

    #[arg(long, help = "Overwrite files that are newer than their archive")]
    force: bool,

    #[arg(long, help = "Dry run - don't actually restore")]
    dry_run: bool,

    #[arg(long, env = "CIPHERSET_WORKERS", help = "Files restored in parallel")]
    workers: Option<usize>,
}

impl RestoreCommand {
    pub async fn run(&self, cli: &Cli, settings: &Settings, cancel: CancelFlag) -> Result<Outcome> {
        let base = match &self.chroot {
            Some(root) => RestoreOptions::to_root(std::path::absolute(root)?),
            None => RestoreOptions::in_place(),
        };
        let options = RestoreOptions {
            force: self.force,
            dry_run: self.dry_run,
            workers: settings.workers(self.workers),
            ..base
        };
        if self.dry_run {
            println!("DRY RUN - no files will be written");
        }

        let observer = BarObserver::new(cli.quiet)?;
        let ctx = RunContext::new(observer.clone(), cancel);
        let summary = operations::run_restore(&self.sets, &options, &ctx).await?;
        observer.finish();

        println!("{}", summary);
        Ok(Outcome::from_errors(summary.has_errors()))
    }
}
