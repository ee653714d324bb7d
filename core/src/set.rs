use crate::crypto::KeyMaterial;
use crate::types::{self, ArchiveId, DEFAULT_EXTENSION};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// A named binding of source folders to one destination, key and index.
///
/// Immutable once loaded. The index file and archive blob locations are
/// derived from it on demand.
///
/// # Examples
///
/// ```no_run
/// use cipherset_core::{BackupSet, BackupSetConfig};
///
/// # fn main() -> cipherset_core::Result<()> {
/// let config = BackupSetConfig::new("home", "/mnt/backups", "/etc/cipherset/home.json")
///     .with_key_file("/etc/cipherset/home.key")
///     .with_source("/home/alice");
/// let set = BackupSet::create(config, false)?;
/// println!("index lives at {}", set.index_file().display());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSet {
    name: String,
    destination: PathBuf,
    #[serde(rename = "key-file", default, skip_serializing_if = "Option::is_none")]
    key_file: Option<PathBuf>,
    #[serde(rename = "set-file")]
    set_file: PathBuf,
    #[serde(default = "default_extension")]
    extension: String,
    #[serde(rename = "source-folders")]
    source_folders: Vec<PathBuf>,
}

fn default_extension() -> String {
    DEFAULT_EXTENSION.to_string()
}

/// Operator input for [`BackupSet::create`].
#[derive(Debug, Clone)]
pub struct BackupSetConfig {
    pub name: String,
    pub destination: PathBuf,
    pub key_file: Option<PathBuf>,
    pub set_file: PathBuf,
    pub extension: String,
    pub source_folders: Vec<PathBuf>,
}

impl BackupSetConfig {
    pub fn new(
        name: impl Into<String>,
        destination: impl Into<PathBuf>,
        set_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
            key_file: None,
            set_file: set_file.into(),
            extension: default_extension(),
            source_folders: Vec::new(),
        }
    }

    pub fn with_key_file(mut self, key_file: impl Into<PathBuf>) -> Self {
        self.key_file = Some(key_file.into());
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn with_source(mut self, folder: impl Into<PathBuf>) -> Self {
        self.source_folders.push(folder.into());
        self
    }
}

impl BackupSet {
    /// Validates `config` against the filesystem and writes the set file.
    ///
    /// The destination must be a writable folder, every source a readable
    /// folder and the key file (when given) a valid key. All paths are stored
    /// absolute. An existing set file is only replaced when `force` is set.
    pub fn create(config: BackupSetConfig, force: bool) -> Result<Self> {
        check_folder_write(&config.destination)?;
        if config.source_folders.is_empty() {
            return Err(Error::config("A backup set needs at least one source folder"));
        }
        for folder in &config.source_folders {
            check_folder_read(folder)?;
        }
        if let Some(key_file) = &config.key_file {
            check_file_read(key_file)?;
            KeyMaterial::load(key_file)?;
        }
        if config.set_file.exists() && !force {
            return Err(Error::config(format!(
                "Set file '{}' already exists, use force to overwrite it",
                config.set_file.display()
            )));
        }

        let set = Self {
            name: config.name,
            destination: config.destination,
            key_file: config.key_file,
            set_file: config.set_file,
            extension: config.extension,
            source_folders: config.source_folders,
        }
        .normalized()?;

        let contents = serde_json::to_string_pretty(&set)?;
        fs::write(&set.set_file, &contents).map_err(|e| {
            Error::config(format!(
                "Failed to write set file '{}': {}",
                set.set_file.display(),
                e
            ))
        })?;
        info!("Created backup set '{}' at {}", set.name, set.set_file.display());
        Ok(set)
    }

    /// Reads a set file. Relative paths inside it resolve against the working directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Cannot read set file '{}': {}", path.display(), e))
        })?;
        let set: Self = serde_json::from_str(&text).map_err(|e| {
            Error::config(format!("Set file '{}' is invalid: {}", path.display(), e))
        })?;
        if set.source_folders.is_empty() {
            return Err(Error::config(format!(
                "Set file '{}' lists no source folders",
                path.display()
            )));
        }
        set.normalized()
    }

    fn normalized(mut self) -> Result<Self> {
        if self.name.trim().is_empty() {
            return Err(Error::config("Backup set name must not be empty"));
        }
        if self.extension.is_empty()
            || self.extension.starts_with('.')
            || self.extension.contains(['/', '\\'])
        {
            return Err(Error::config(format!(
                "Invalid archive extension '{}'",
                self.extension
            )));
        }
        self.destination = absolute(&self.destination)?;
        self.set_file = absolute(&self.set_file)?;
        self.key_file = self.key_file.as_deref().map(absolute).transpose()?;
        self.source_folders = self
            .source_folders
            .iter()
            .map(|p| absolute(p))
            .collect::<Result<_>>()?;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn key_file(&self) -> Option<&Path> {
        self.key_file.as_deref()
    }

    pub fn set_file(&self) -> &Path {
        &self.set_file
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn source_folders(&self) -> &[PathBuf] {
        &self.source_folders
    }

    /// `destination/<set-file-name>.index`
    pub fn index_file(&self) -> PathBuf {
        let stem = self
            .set_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone());
        self.destination.join(format!("{}.index", stem))
    }

    /// `destination/<archive-id>.<extension>`
    pub fn archive_path(&self, id: &ArchiveId) -> PathBuf {
        self.destination.join(id.blob_name(&self.extension))
    }

    /// Loads the set's key, or `None` for a plain-mode set.
    pub fn load_key(&self) -> Result<Option<KeyMaterial>> {
        self.key_file.as_deref().map(KeyMaterial::load).transpose()
    }
}

/// Absolute, with `.` and `..` resolved, so it compares equal to walked paths.
fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path)
        .map(|p| types::normalize_path(&p))
        .map_err(|e| Error::config(format!("Cannot resolve '{}': {}", path.display(), e)))
}

pub(crate) fn check_folder_write(folder: &Path) -> Result<()> {
    match fs::metadata(folder) {
        Ok(meta) if meta.is_dir() && !meta.permissions().readonly() => Ok(()),
        _ => Err(Error::config(format!(
            "Folder '{}' is either not a directory or is not writable",
            folder.display()
        ))),
    }
}

fn check_folder_read(folder: &Path) -> Result<()> {
    let readable = fs::metadata(folder).map(|m| m.is_dir()).unwrap_or(false)
        && fs::read_dir(folder).is_ok();
    if readable {
        Ok(())
    } else {
        Err(Error::config(format!(
            "Folder '{}' is either not a directory or is not readable",
            folder.display()
        )))
    }
}

fn check_file_read(file: &Path) -> Result<()> {
    let readable = fs::metadata(file).map(|m| m.is_file()).unwrap_or(false)
        && fs::File::open(file).is_ok();
    if readable {
        Ok(())
    } else {
        Err(Error::config(format!(
            "File '{}' is either not a regular file or is not readable",
            file.display()
        )))
    }
}
