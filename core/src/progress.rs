use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// What happened to one index entry during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Archived,
    Unchanged,
    Missing,
    Restored,
    Skipped,
    Failed,
}

impl FileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Archived => "archived",
            Self::Unchanged => "unchanged",
            Self::Missing => "missing",
            Self::Restored => "restored",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

/// Receives per-file progress from the engines.
///
/// Called from the engine task only, never concurrently for the same run.
pub trait RunObserver: Send + Sync {
    /// The run is about to settle `total` entries.
    fn planned(&self, _total: usize) {}

    fn file_done(&self, _path: &Path, _outcome: FileOutcome) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// Cooperative stop signal, checked before each file is scheduled.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Observer and cancellation shared by every set of one invocation.
#[derive(Clone)]
pub struct RunContext {
    pub observer: Arc<dyn RunObserver>,
    pub cancel: CancelFlag,
}

impl RunContext {
    pub fn new(observer: Arc<dyn RunObserver>, cancel: CancelFlag) -> Self {
        Self { observer, cancel }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(Arc::new(NoopObserver), CancelFlag::new())
    }
}
