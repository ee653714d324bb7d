use crate::codec;
use crate::crypto::KeyMaterial;
use crate::index::Index;
use crate::set::BackupSet;
use crate::{Error, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

/// Loads and persists the index of one backup set.
///
/// The index is sealed with the set's key, or kept as plain JSON when the
/// set has none. A dry-run store never touches the disk.
#[derive(Debug, Clone)]
pub struct IndexStore {
    index_file: PathBuf,
    key: Option<Arc<KeyMaterial>>,
    dry_run: bool,
}

impl IndexStore {
    pub fn for_set(set: &BackupSet, key: Option<Arc<KeyMaterial>>, dry_run: bool) -> Self {
        Self::for_index_file(set.index_file(), key, dry_run)
    }

    pub fn for_index_file(
        index_file: impl Into<PathBuf>,
        key: Option<Arc<KeyMaterial>>,
        dry_run: bool,
    ) -> Self {
        Self {
            index_file: index_file.into(),
            key,
            dry_run,
        }
    }

    pub fn index_file(&self) -> &Path {
        &self.index_file
    }

    /// Loads the index, creating and persisting an empty one if the file is missing.
    pub async fn create_or_load(&self) -> Result<Index> {
        if fs::try_exists(&self.index_file).await? {
            return self.read().await;
        }

        let index = Index::new();
        if self.dry_run {
            debug!("No index at {}, starting empty", self.index_file.display());
            return Ok(index);
        }
        if let Some(parent) = self.index_file.parent() {
            fs::create_dir_all(parent).await?;
        }
        self.save(&index).await?;
        info!("Created new index {}", self.index_file.display());
        Ok(index)
    }

    /// Loads an existing index without ever creating one.
    pub async fn load_only(&self) -> Result<Index> {
        if !fs::try_exists(&self.index_file).await? {
            return Err(Error::IndexNotFound {
                path: self.index_file.display().to_string(),
            });
        }
        self.read().await
    }

    pub async fn save(&self, index: &Index) -> Result<()> {
        if self.dry_run {
            debug!("Dry run, not writing {}", self.index_file.display());
            return Ok(());
        }
        let json = index.to_json()?;
        let path = self.index_file.clone();
        let key = self.key.clone();
        codec::run_blocking(move || match key.as_deref() {
            Some(key) => codec::write_encrypted_text(&json, &path, key),
            None => codec::write_plain_text(&json, &path),
        })
        .await?;
        debug!(entries = index.len(), "Saved index {}", self.index_file.display());
        Ok(())
    }

    async fn read(&self) -> Result<Index> {
        let path = self.index_file.clone();
        let key = self.key.clone();
        let text = codec::run_blocking(move || match key.as_deref() {
            Some(key) => codec::read_encrypted_text(&path, key),
            None => Ok(std::fs::read_to_string(&path)?),
        })
        .await
        .map_err(|e| self.classify(e))?;

        let index = Index::from_json(&text).map_err(|e| self.classify(e))?;
        debug!(entries = index.len(), "Loaded index {}", self.index_file.display());
        Ok(index)
    }

    /// Content problems become `IndexCorrupt`; plain I/O failures pass through.
    fn classify(&self, err: Error) -> Error {
        match err {
            Error::Io(e)
                if !matches!(
                    e.kind(),
                    io::ErrorKind::InvalidData
                        | io::ErrorKind::InvalidInput
                        | io::ErrorKind::UnexpectedEof
                ) =>
            {
                Error::Io(e)
            }
            other => Error::IndexCorrupt {
                path: self.index_file.display().to_string(),
                reason: other.to_string(),
            },
        }
    }
}
