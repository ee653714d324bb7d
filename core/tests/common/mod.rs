//! Shared fixtures for the engine integration tests
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use cipherset_core::{BackupSet, BackupSetConfig, Index, IndexStore, KeyMaterial};
use tempfile::TempDir;

/// A scratch tree with `src/`, `dest/` and optionally a key file.
pub struct Fixture {
    temp_dir: TempDir,
    key_file: Option<PathBuf>,
    extension: String,
}

impl Fixture {
    /// Encrypted fixture with a freshly generated key
    pub fn new() -> Self {
        let fixture = Self::plain();
        let key_file = fixture.root().join("set.key");
        KeyMaterial::generate()
            .expect("Failed to generate key")
            .save(&key_file)
            .expect("Failed to write key");
        Self {
            key_file: Some(key_file),
            ..fixture
        }
    }

    /// Fixture without a key file
    pub fn plain() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        fs::create_dir(temp_dir.path().join("src")).expect("Failed to create src");
        fs::create_dir(temp_dir.path().join("dest")).expect("Failed to create dest");
        Self {
            temp_dir,
            key_file: None,
            extension: "aes".to_string(),
        }
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.to_string();
        self
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn source(&self) -> PathBuf {
        self.root().join("src")
    }

    pub fn destination(&self) -> PathBuf {
        self.root().join("dest")
    }

    pub fn restore_root(&self) -> PathBuf {
        self.root().join("restore")
    }

    pub fn set_file(&self) -> PathBuf {
        self.root().join("set.json")
    }

    pub fn key_file(&self) -> Option<&Path> {
        self.key_file.as_deref()
    }

    pub fn key(&self) -> Option<Arc<KeyMaterial>> {
        self.key_file
            .as_deref()
            .map(|p| Arc::new(KeyMaterial::load(p).expect("Failed to load key")))
    }

    /// Writes a file under `src/` and returns its path
    pub fn write(&self, relative: &str, contents: &[u8]) -> PathBuf {
        let path = self.source().join(relative);
        fs::create_dir_all(path.parent().unwrap()).expect("Failed to create parent");
        fs::write(&path, contents).expect("Failed to write source file");
        path
    }

    /// Writes the set file and returns the loaded set
    pub fn set(&self) -> BackupSet {
        let mut config = BackupSetConfig::new("fixture", self.destination(), self.set_file())
            .with_extension(self.extension.clone())
            .with_source(self.source());
        if let Some(key_file) = &self.key_file {
            config = config.with_key_file(key_file);
        }
        BackupSet::create(config, true).expect("Failed to create backup set")
    }

    pub async fn load_index(&self, set: &BackupSet) -> Index {
        IndexStore::for_set(set, self.key(), true)
            .load_only()
            .await
            .expect("Failed to load index")
    }

    /// Archive blobs in the destination, keyed by file name
    pub fn blobs(&self) -> BTreeMap<String, Vec<u8>> {
        fs::read_dir(self.destination())
            .expect("Failed to list destination")
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|e| e == self.extension.as_str()))
            .map(|p| {
                let name = p.file_name().unwrap().to_string_lossy().into_owned();
                (name, fs::read(&p).unwrap())
            })
            .collect()
    }

    /// Where a source file lands under the restore root
    pub fn restored(&self, source: &Path) -> PathBuf {
        cipherset_core::restore::rebase(&self.restore_root(), source)
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

pub fn set_mtime(path: &Path, time: SystemTime) {
    fs::File::options()
        .write(true)
        .open(path)
        .expect("Failed to open for mtime")
        .set_modified(time)
        .expect("Failed to set mtime");
}

/// A fixed point well in the past, so tests never race the clock
pub fn past(offset_secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000 + offset_secs)
}
