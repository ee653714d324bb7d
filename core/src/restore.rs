use crate::backup::{RULE, elapsed_row, row};
use crate::codec;
use crate::crypto::KeyMaterial;
use crate::index::NEVER_ARCHIVED;
use crate::progress::{CancelFlag, FileOutcome, NoopObserver, RunObserver};
use crate::set::BackupSet;
use crate::store::IndexStore;
use crate::types::{ArchiveId, Direction, normalize_path, system_time_from_millis};
use crate::{Error, Result};
use futures::future;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, debug, error, info, info_span, warn};

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Directory the recorded absolute paths are re-rooted under. `/` restores in place.
    pub target_root: PathBuf,
    /// Overwrite targets even when they are newer than the archive.
    pub force: bool,
    pub dry_run: bool,
    pub workers: usize,
}

impl RestoreOptions {
    pub fn in_place() -> Self {
        Self::to_root("/")
    }

    pub fn to_root(target_root: impl Into<PathBuf>) -> Self {
        Self {
            target_root: target_root.into(),
            force: false,
            dry_run: false,
            workers: 1,
        }
    }
}

/// Counters for one restore or recover run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub label: String,
    pub restored: usize,
    pub skipped: usize,
    pub errored: usize,
    pub total: usize,
    pub elapsed: Duration,
    pub dry_run: bool,
    pub cancelled: bool,
}

impl RestoreReport {
    pub fn has_errors(&self) -> bool {
        self.errored > 0
    }
}

impl fmt::Display for RestoreReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "==== {} ====", self.label)?;
        if self.dry_run {
            writeln!(f, "*** DRY RUN ONLY")?;
        }
        if self.cancelled {
            writeln!(f, "*** CANCELLED")?;
        }
        writeln!(f, "{}", RULE)?;
        row(f, "Restored files:", self.restored)?;
        row(f, "Skipped files:", self.skipped)?;
        row(f, "Errored files:", self.errored)?;
        row(f, "Total processed:", self.total)?;
        elapsed_row(f, self.elapsed)?;
        write!(f, "{}", RULE)
    }
}

/// Re-roots an absolute `path` under `root`.
///
/// `.` and `..` are resolved first, clamped at the filesystem root, then the
/// root and drive prefix are dropped. The result never leaves `root`.
pub fn rebase(root: &Path, path: &Path) -> PathBuf {
    let mut target = root.to_path_buf();
    for component in normalize_path(path).components() {
        if let Component::Normal(part) = component {
            target.push(part);
        }
    }
    target
}

/// How archive ids map to blob files.
enum BlobLocator {
    Extension(String),
    /// File stem to blob path, built from a listing of the archive directory.
    Catalog(HashMap<String, PathBuf>),
}

impl BlobLocator {
    fn locate(&self, dir: &Path, id: &ArchiveId) -> Option<PathBuf> {
        match self {
            Self::Extension(ext) => Some(dir.join(id.blob_name(ext))),
            Self::Catalog(blobs) => blobs.get(id.as_str()).cloned(),
        }
    }
}

struct RestoreJob {
    source_path: PathBuf,
    archive_id: ArchiveId,
    archive: Option<PathBuf>,
    target: PathBuf,
    recorded_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Restored,
    Newer,
}

/// Copies archived files back out, either for a set or from a bare index.
pub struct RestoreEngine {
    label: String,
    store: IndexStore,
    archive_dir: PathBuf,
    locator: BlobLocator,
    key: Option<Arc<KeyMaterial>>,
    check_freshness: bool,
    options: RestoreOptions,
    observer: Arc<dyn RunObserver>,
    cancel: CancelFlag,
}

impl RestoreEngine {
    /// Restore driven by a set file. Targets newer than their archive are kept unless forced.
    pub fn for_set(set: &BackupSet, options: RestoreOptions) -> Result<Self> {
        let key = set.load_key()?.map(Arc::new);
        Ok(Self {
            label: set.name().to_string(),
            store: IndexStore::for_set(set, key.clone(), true),
            archive_dir: set.destination().to_path_buf(),
            locator: BlobLocator::Extension(set.extension().to_string()),
            key,
            check_freshness: true,
            options,
            observer: Arc::new(NoopObserver),
            cancel: CancelFlag::new(),
        })
    }

    /// Recovery from an index file alone, with blobs looked up next to it.
    ///
    /// Without an `extension` the archive directory is listed once and blobs
    /// are matched by file stem. Targets are always overwritten.
    pub fn for_recovery(
        index_file: &Path,
        key_file: Option<&Path>,
        extension: Option<&str>,
        options: RestoreOptions,
    ) -> Result<Self> {
        let key = key_file.map(KeyMaterial::load).transpose()?.map(Arc::new);
        let archive_dir = index_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        let locator = match extension {
            Some(ext) => BlobLocator::Extension(ext.to_string()),
            None => BlobLocator::Catalog(catalog(&archive_dir, index_file)?),
        };
        Ok(Self {
            label: index_file.display().to_string(),
            store: IndexStore::for_index_file(index_file, key.clone(), true),
            archive_dir,
            locator,
            key,
            check_freshness: false,
            options,
            observer: Arc::new(NoopObserver),
            cancel: CancelFlag::new(),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(&self) -> Result<RestoreReport> {
        let span = info_span!("restore", set = %self.label);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> Result<RestoreReport> {
        let started = Instant::now();
        let mut report = RestoreReport {
            label: self.label.clone(),
            dry_run: self.options.dry_run,
            ..Default::default()
        };
        let index = self.store.load_only().await?;
        report.total = index.len();
        self.observer.planned(report.total);
        info!(
            "Restoring {} file(s) from {} to {}",
            report.total,
            self.archive_dir.display(),
            self.options.target_root.display()
        );

        let jobs: Vec<RestoreJob> = index
            .iter()
            .map(|entry| RestoreJob {
                source_path: entry.source_path().to_path_buf(),
                archive_id: entry.archive_id().clone(),
                archive: self.locator.locate(&self.archive_dir, entry.archive_id()),
                target: rebase(&self.options.target_root, entry.source_path()),
                recorded_ms: entry.last_modified_ms(),
            })
            .collect();

        let key = self.key.clone();
        let overwrite = self.options.force || !self.check_freshness;
        let dry_run = self.options.dry_run;
        let cancel = self.cancel.clone();
        let mut results = pin!(
            stream::iter(jobs)
                .take_while(move |_| future::ready(!cancel.is_cancelled()))
                .map(move |job| {
                    let key = key.clone();
                    async move {
                        let source = job.source_path.clone();
                        let outcome = codec::run_blocking(move || {
                            restore_one(&job, key.as_deref(), overwrite, dry_run)
                        })
                        .await;
                        (source, outcome)
                    }
                })
                .buffer_unordered(self.options.workers.max(1))
        );

        while let Some((source, outcome)) = results.next().await {
            match outcome {
                Ok(Settled::Restored) => {
                    report.restored += 1;
                    self.observer.file_done(&source, FileOutcome::Restored);
                }
                Ok(Settled::Newer) => {
                    report.skipped += 1;
                    self.observer.file_done(&source, FileOutcome::Skipped);
                }
                Err(e) => {
                    error!("Failed to restore {}: {}", source.display(), e);
                    report.errored += 1;
                    self.observer.file_done(&source, FileOutcome::Failed);
                }
            }
        }

        if self.cancel.is_cancelled() {
            warn!("Restore cancelled");
            report.cancelled = true;
        }
        report.elapsed = started.elapsed();
        info!(
            restored = report.restored,
            errored = report.errored,
            "Restore of '{}' finished",
            report.label
        );
        Ok(report)
    }
}

fn restore_one(
    job: &RestoreJob,
    key: Option<&KeyMaterial>,
    overwrite: bool,
    dry_run: bool,
) -> Result<Settled> {
    let archive = job.archive.as_deref().ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no archive blob found for id {}", job.archive_id),
        ))
    })?;
    let archived_at = fs::metadata(archive)?.modified()?;

    if !overwrite {
        if let Ok(existing) = fs::metadata(&job.target) {
            if existing.modified()? >= archived_at {
                debug!("Keeping newer {}", job.target.display());
                return Ok(Settled::Newer);
            }
        }
    }

    if dry_run {
        info!("Would restore {} -> {}", archive.display(), job.target.display());
        return Ok(Settled::Restored);
    }

    info!("Restoring {} -> {}", archive.display(), job.target.display());
    if let Some(parent) = job.target.parent() {
        fs::create_dir_all(parent)?;
    }
    codec::copy(archive, &job.target, key, Direction::Decrypt)?;

    // Plain copies already carry the archived mtime.
    if key.is_some() && job.recorded_ms != NEVER_ARCHIVED {
        if let Some(time) = system_time_from_millis(job.recorded_ms) {
            File::options()
                .write(true)
                .open(&job.target)?
                .set_modified(time)?;
        }
    }
    Ok(Settled::Restored)
}

/// Maps file stems in `dir` to blob paths, leaving out the index itself.
fn catalog(dir: &Path, index_file: &Path) -> Result<HashMap<String, PathBuf>> {
    let mut blobs = HashMap::new();
    let entries = fs::read_dir(dir).map_err(|e| {
        Error::config(format!(
            "Cannot list archive folder '{}': {}",
            dir.display(),
            e
        ))
    })?;
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() || path.file_name() == index_file.file_name() {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            blobs.entry(stem.to_string()).or_insert(path);
        }
    }
    debug!("Found {} candidate blobs in {}", blobs.len(), dir.display());
    Ok(blobs)
}
