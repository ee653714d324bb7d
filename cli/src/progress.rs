use anyhow::Result;
use cipherset_core::{FileOutcome, RunObserver};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;

/// Drives a progress bar from engine callbacks. Restarts for every set.
pub struct BarObserver {
    bar: ProgressBar,
}

impl BarObserver {
    pub fn new(hidden: bool) -> Result<Arc<Self>> {
        let bar = if hidden {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(0)
        };
        bar.set_style(
            ProgressStyle::default_bar().template("{bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")?,
        );
        Ok(Arc::new(Self { bar }))
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl RunObserver for BarObserver {
    fn planned(&self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(0);
    }

    fn file_done(&self, path: &Path, outcome: FileOutcome) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.bar.set_message(format!("{} {}", outcome.as_str(), name));
        self.bar.inc(1);
    }
}
