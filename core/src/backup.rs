use crate::codec;
use crate::crypto::KeyMaterial;
use crate::index::Index;
use crate::progress::{CancelFlag, FileOutcome, NoopObserver, RunObserver};
use crate::set::{self, BackupSet};
use crate::store::IndexStore;
use crate::types::{Direction, FileStat};
use crate::{Error, Result};
use futures::future;
use futures::stream::{self, StreamExt};
use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{Instrument, debug, error, info, info_span, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Plan and report without writing archives or the index.
    pub dry_run: bool,
    /// Number of files copied concurrently.
    pub workers: usize,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            workers: 1,
        }
    }
}

/// Counters for one backup set run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupReport {
    pub set_name: String,
    pub backed_up: usize,
    pub skipped: usize,
    pub new_files: usize,
    pub deleted: usize,
    pub errored: usize,
    pub total: usize,
    pub elapsed: Duration,
    pub dry_run: bool,
    pub cancelled: bool,
}

impl BackupReport {
    pub fn has_errors(&self) -> bool {
        self.errored > 0
    }
}

impl fmt::Display for BackupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "==== {} ====", self.set_name)?;
        if self.dry_run {
            writeln!(f, "*** DRY RUN ONLY")?;
        }
        if self.cancelled {
            writeln!(f, "*** CANCELLED")?;
        }
        writeln!(f, "{}", RULE)?;
        row(f, "Backed up files:", self.backed_up)?;
        row(f, "Skipped files:", self.skipped)?;
        row(f, "New files backed up:", self.new_files)?;
        row(f, "Apparently Deleted:", self.deleted)?;
        row(f, "Errored files:", self.errored)?;
        row(f, "Total processed:", self.total)?;
        elapsed_row(f, self.elapsed)?;
        write!(f, "{}", RULE)
    }
}

pub(crate) const RULE: &str = "+----------------------------------------+";

pub(crate) fn row(f: &mut fmt::Formatter<'_>, label: &str, value: usize) -> fmt::Result {
    writeln!(f, "| {:<26}{:>12} |", label, value)
}

pub(crate) fn elapsed_row(f: &mut fmt::Formatter<'_>, elapsed: Duration) -> fmt::Result {
    let secs = elapsed.as_secs();
    writeln!(
        f,
        "| {:<26}{:>9}:{:02} |",
        "Total Time (m:ss):",
        secs / 60,
        secs % 60
    )
}

struct ArchiveJob {
    source: PathBuf,
    target: PathBuf,
}

/// Differential backup of one set.
///
/// Walks the source folders, decides per file whether it changed since its
/// last archive, copies changed files through the codec and persists the
/// updated index. Per-file failures are counted and retried on the next run.
pub struct BackupEngine<'a> {
    set: &'a BackupSet,
    options: BackupOptions,
    observer: Arc<dyn RunObserver>,
    cancel: CancelFlag,
}

impl<'a> BackupEngine<'a> {
    pub fn new(set: &'a BackupSet, options: BackupOptions) -> Self {
        Self {
            set,
            options,
            observer: Arc::new(NoopObserver),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(&self) -> Result<BackupReport> {
        let span = info_span!("backup", set = %self.set.name());
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> Result<BackupReport> {
        let started = Instant::now();
        let mut report = BackupReport {
            set_name: self.set.name().to_string(),
            dry_run: self.options.dry_run,
            ..Default::default()
        };
        info!(
            "Starting backup of {} source folder(s) to {}",
            self.set.source_folders().len(),
            self.set.destination().display()
        );

        self.resolve().await?;
        let key = self.set.load_key()?.map(Arc::new);
        let store = IndexStore::for_set(self.set, key.clone(), self.options.dry_run);
        let mut index = store.create_or_load().await?;
        index.begin_run();

        let observed = scan_sources(
            self.set.source_folders().to_vec(),
            self.set.destination().to_path_buf(),
        )
        .await?;
        for (path, stat) in &observed {
            if index.add_if_absent(path) {
                debug!("New file {}", path.display());
                report.new_files += 1;
            }
            index.mark_observed(path, *stat);
        }
        report.total = index.len();
        self.observer.planned(report.total);

        let mut jobs = Vec::new();
        for entry in index.iter() {
            let path = entry.source_path();
            if !entry.was_observed() {
                info!("Apparently deleted: {}", path.display());
                report.deleted += 1;
                self.observer.file_done(path, FileOutcome::Missing);
            } else if entry.needs_backup() {
                jobs.push(ArchiveJob {
                    source: path.to_path_buf(),
                    target: self.set.archive_path(entry.archive_id()),
                });
            } else {
                debug!("Unchanged: {}", path.display());
                report.skipped += 1;
                self.observer.file_done(path, FileOutcome::Unchanged);
            }
        }

        self.archive(jobs, key, &mut index, &mut report).await;
        store.save(&index).await?;

        report.elapsed = started.elapsed();
        info!(
            backed_up = report.backed_up,
            errored = report.errored,
            "Backup of set '{}' finished",
            report.set_name
        );
        Ok(report)
    }

    /// Checks the source folders and makes sure the destination exists and is writable.
    async fn resolve(&self) -> Result<()> {
        for folder in self.set.source_folders() {
            let meta = fs::metadata(folder).await.map_err(|e| {
                Error::config(format!(
                    "Source folder '{}' is not readable: {}",
                    folder.display(),
                    e
                ))
            })?;
            if !meta.is_dir() {
                return Err(Error::config(format!(
                    "Source '{}' is not a folder",
                    folder.display()
                )));
            }
        }

        let destination = self.set.destination();
        match fs::metadata(destination).await {
            Ok(meta) if meta.is_dir() => set::check_folder_write(destination),
            Ok(_) => Err(Error::config(format!(
                "Destination '{}' exists and is not a folder",
                destination.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.options.dry_run {
                    debug!("Destination {} would be created", destination.display());
                    return Ok(());
                }
                fs::create_dir_all(destination).await.map_err(|e| {
                    Error::config(format!(
                        "Cannot create destination '{}': {}",
                        destination.display(),
                        e
                    ))
                })?;
                info!("Created destination {}", destination.display());
                Ok(())
            }
            Err(e) => Err(Error::config(format!(
                "Destination '{}' is not accessible: {}",
                destination.display(),
                e
            ))),
        }
    }

    async fn archive(
        &self,
        jobs: Vec<ArchiveJob>,
        key: Option<Arc<KeyMaterial>>,
        index: &mut Index,
        report: &mut BackupReport,
    ) {
        let dry_run = self.options.dry_run;
        let cancel = self.cancel.clone();
        let mut results = pin!(
            stream::iter(jobs)
                .take_while(move |_| future::ready(!cancel.is_cancelled()))
                .map(move |job| {
                    let key = key.clone();
                    async move {
                        let outcome = archive_one(job.source.clone(), job.target, key, dry_run).await;
                        (job.source, outcome)
                    }
                })
                .buffer_unordered(self.options.workers.max(1))
        );

        while let Some((source, outcome)) = results.next().await {
            match outcome {
                Ok(stat) => {
                    if let Some(stat) = stat {
                        index.commit(&source, stat);
                    }
                    report.backed_up += 1;
                    self.observer.file_done(&source, FileOutcome::Archived);
                }
                Err(e) => {
                    error!("Failed to back up {}: {}", source.display(), e);
                    index.rollback(&source);
                    report.errored += 1;
                    self.observer.file_done(&source, FileOutcome::Failed);
                }
            }
        }

        if self.cancel.is_cancelled() {
            warn!("Backup cancelled, remaining files are left for the next run");
            report.cancelled = true;
        }
    }
}

/// Copies one changed file into the archive and returns the stat it was taken at.
async fn archive_one(
    source: PathBuf,
    target: PathBuf,
    key: Option<Arc<KeyMaterial>>,
    dry_run: bool,
) -> Result<Option<FileStat>> {
    codec::run_blocking(move || {
        let stat = FileStat::probe(&source)?;
        if dry_run {
            info!("Would back up {} -> {}", source.display(), target.display());
            return Ok(None);
        }
        info!("Backing up {} -> {}", source.display(), target.display());
        codec::copy(&source, &target, key.as_deref(), Direction::Encrypt)?;
        Ok(Some(stat))
    })
    .await
}

async fn scan_sources(
    folders: Vec<PathBuf>,
    destination: PathBuf,
) -> Result<Vec<(PathBuf, FileStat)>> {
    codec::run_blocking(move || Ok(scan(&folders, &destination))).await
}

/// Regular files under `folders`, leaving out the archive itself.
///
/// Symlinks are not followed and unreadable entries are skipped.
fn scan(folders: &[PathBuf], destination: &Path) -> Vec<(PathBuf, FileStat)> {
    let mut found = Vec::new();
    for folder in folders {
        let walker = WalkDir::new(folder)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.path() != destination);
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Failed to check file: {}", e);
                    continue;
                }
            };
            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }
            if !file_type.is_file() {
                debug!("Skipping non-regular file {}", entry.path().display());
                continue;
            }
            let stat = entry
                .metadata()
                .map_err(std::io::Error::from)
                .and_then(|meta| FileStat::from_metadata(&meta));
            match stat {
                Ok(stat) => found.push((entry.into_path(), stat)),
                Err(e) => warn!("Failed to check file {}: {}", entry.path().display(), e),
            }
        }
    }
    found
}
