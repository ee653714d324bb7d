use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;

pub const DEFAULT_EXTENSION: &str = "aes";

/// Stable, content-independent name of a file's archived blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArchiveId(String);

impl ArchiveId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the blob inside the archive directory.
    pub fn blob_name(&self, extension: &str) -> String {
        format!("{}.{}", self.0, extension)
    }

    pub fn short_string(&self) -> String {
        self.0.chars().take(8).collect()
    }
}

impl FromStr for ArchiveId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.contains(['/', '\\']) {
            return Err(format!("invalid archive id '{}'", s));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for ArchiveId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ArchiveId> for String {
    fn from(id: ArchiveId) -> Self {
        id.0
    }
}

impl fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// The two on-disk attributes used for change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStat {
    /// Milliseconds since the Unix epoch.
    pub modified_ms: i64,
    pub size: u64,
}

impl FileStat {
    pub fn from_metadata(metadata: &Metadata) -> std::io::Result<Self> {
        let modified: DateTime<Utc> = metadata.modified()?.into();
        Ok(Self {
            modified_ms: modified.timestamp_millis(),
            size: metadata.len(),
        })
    }

    pub fn probe(path: &Path) -> std::io::Result<Self> {
        Self::from_metadata(&std::fs::metadata(path)?)
    }
}

/// Resolves `.` and `..` lexically without touching the filesystem.
///
/// `..` pops the previous component and never climbs above the root.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => normalized.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth > 0 {
                    normalized.pop();
                    depth -= 1;
                }
            }
            Component::Normal(part) => {
                normalized.push(part);
                depth += 1;
            }
        }
    }
    normalized
}

pub(crate) fn system_time_from_millis(ms: i64) -> Option<SystemTime> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(SystemTime::from)
}
