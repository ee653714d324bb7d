//! Entry points the CLI dispatches to, one per command.

use crate::backup::{BackupEngine, BackupOptions, BackupReport};
use crate::crypto::KeyMaterial;
use crate::progress::RunContext;
use crate::restore::{RestoreEngine, RestoreOptions, RestoreReport};
use crate::set::{BackupSet, BackupSetConfig};
use crate::{Error, Result};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info};

/// A set that could not be processed at all.
#[derive(Debug)]
pub struct SetFailure {
    pub set_file: PathBuf,
    pub error: Error,
}

impl fmt::Display for SetFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.set_file.display(), self.error)
    }
}

#[derive(Debug, Default)]
pub struct BackupSummary {
    pub reports: Vec<BackupReport>,
    pub failures: Vec<SetFailure>,
    pub elapsed: Duration,
}

impl BackupSummary {
    pub fn has_errors(&self) -> bool {
        !self.failures.is_empty() || self.reports.iter().any(BackupReport::has_errors)
    }
}

impl fmt::Display for BackupSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for report in &self.reports {
            writeln!(f, "{}", report)?;
        }
        write_failures(f, &self.failures)
    }
}

#[derive(Debug, Default)]
pub struct RestoreSummary {
    pub reports: Vec<RestoreReport>,
    pub failures: Vec<SetFailure>,
    pub elapsed: Duration,
}

impl RestoreSummary {
    pub fn has_errors(&self) -> bool {
        !self.failures.is_empty() || self.reports.iter().any(RestoreReport::has_errors)
    }
}

impl fmt::Display for RestoreSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for report in &self.reports {
            writeln!(f, "{}", report)?;
        }
        write_failures(f, &self.failures)
    }
}

fn write_failures(f: &mut fmt::Formatter<'_>, failures: &[SetFailure]) -> fmt::Result {
    for failure in failures {
        writeln!(f, "*** Set failed: {}", failure)?;
    }
    Ok(())
}

/// Generates fresh key material and writes it to `output`, or stdout for `-`.
pub fn generate_key(output: &Path, force: bool) -> Result<KeyMaterial> {
    let key = KeyMaterial::generate()?;
    if output == Path::new("-") {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", key.encode()?)?;
        return Ok(key);
    }
    if output.exists() && !force {
        return Err(Error::config(format!(
            "Key file '{}' already exists, use force to overwrite it",
            output.display()
        )));
    }
    key.save(output)?;
    info!("Wrote new key to {}", output.display());
    Ok(key)
}

pub fn create_backup_set(config: BackupSetConfig, force: bool) -> Result<BackupSet> {
    BackupSet::create(config, force)
}

/// Backs up every set in turn. A set that fails is recorded and the next one runs.
pub async fn run_backup(
    set_files: &[PathBuf],
    options: &BackupOptions,
    ctx: &RunContext,
) -> Result<BackupSummary> {
    check_set_files(set_files)?;
    let started = Instant::now();
    let mut summary = BackupSummary::default();

    for set_file in set_files {
        if ctx.cancel.is_cancelled() {
            break;
        }
        match backup_one(set_file, options, ctx).await {
            Ok(report) => {
                info!("*** Finished backup set {}", set_file.display());
                summary.reports.push(report);
            }
            Err(error) => {
                error!("*** Backup set {} failed: {}", set_file.display(), error);
                summary.failures.push(SetFailure {
                    set_file: set_file.clone(),
                    error,
                });
            }
        }
    }
    summary.elapsed = started.elapsed();
    Ok(summary)
}

async fn backup_one(
    set_file: &Path,
    options: &BackupOptions,
    ctx: &RunContext,
) -> Result<BackupReport> {
    let set = BackupSet::load(set_file)?;
    BackupEngine::new(&set, options.clone())
        .with_observer(ctx.observer.clone())
        .with_cancel(ctx.cancel.clone())
        .run()
        .await
}

/// Restores every set in turn under `options.target_root`.
pub async fn run_restore(
    set_files: &[PathBuf],
    options: &RestoreOptions,
    ctx: &RunContext,
) -> Result<RestoreSummary> {
    check_set_files(set_files)?;
    let started = Instant::now();
    let mut summary = RestoreSummary::default();

    for set_file in set_files {
        if ctx.cancel.is_cancelled() {
            break;
        }
        match restore_one(set_file, options, ctx).await {
            Ok(report) => {
                info!("*** Finished restore of set {}", set_file.display());
                summary.reports.push(report);
            }
            Err(error) => {
                error!("*** Restore of set {} failed: {}", set_file.display(), error);
                summary.failures.push(SetFailure {
                    set_file: set_file.clone(),
                    error,
                });
            }
        }
    }
    summary.elapsed = started.elapsed();
    Ok(summary)
}

async fn restore_one(
    set_file: &Path,
    options: &RestoreOptions,
    ctx: &RunContext,
) -> Result<RestoreReport> {
    let set = BackupSet::load(set_file)?;
    RestoreEngine::for_set(&set, options.clone())?
        .with_observer(ctx.observer.clone())
        .with_cancel(ctx.cancel.clone())
        .run()
        .await
}

/// Restores straight from an index file, with blobs read from the index's folder.
pub async fn run_recover(
    index_file: &Path,
    key_file: Option<&Path>,
    extension: Option<&str>,
    options: &RestoreOptions,
    ctx: &RunContext,
) -> Result<RestoreSummary> {
    if !index_file.is_file() {
        return Err(Error::config(format!(
            "Index file '{}' does not exist",
            index_file.display()
        )));
    }
    let index_file = std::path::absolute(index_file)?;
    let started = Instant::now();
    let mut summary = RestoreSummary::default();

    let outcome = match RestoreEngine::for_recovery(&index_file, key_file, extension, options.clone()) {
        Ok(engine) => {
            engine
                .with_observer(ctx.observer.clone())
                .with_cancel(ctx.cancel.clone())
                .run()
                .await
        }
        Err(e) => Err(e),
    };
    match outcome {
        Ok(report) => summary.reports.push(report),
        Err(e) if e.is_config() => return Err(e),
        Err(error) => {
            error!("*** Recovery from {} failed: {}", index_file.display(), error);
            summary.failures.push(SetFailure {
                set_file: index_file,
                error,
            });
        }
    }
    summary.elapsed = started.elapsed();
    Ok(summary)
}

fn check_set_files(set_files: &[PathBuf]) -> Result<()> {
    if set_files.is_empty() {
        return Err(Error::config("No backup set files given"));
    }
    for set_file in set_files {
        if !set_file.is_file() {
            return Err(Error::config(format!(
                "Set file '{}' does not exist",
                set_file.display()
            )));
        }
    }
    Ok(())
}
