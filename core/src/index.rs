use crate::types::{ArchiveId, FileStat};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Recorded `last_modified_ms` of an entry that has no good archive yet.
pub const NEVER_ARCHIVED: i64 = 0;

/// Change-tracking state for one source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    source_path: PathBuf,
    archive_id: ArchiveId,
    last_modified_ms: i64,
    last_size: u64,
    needs_backup: bool,
    was_observed: bool,
}

impl IndexEntry {
    fn new(source_path: PathBuf) -> Self {
        Self {
            source_path,
            archive_id: ArchiveId::generate(),
            last_modified_ms: NEVER_ARCHIVED,
            last_size: 0,
            needs_backup: true,
            was_observed: false,
        }
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn archive_id(&self) -> &ArchiveId {
        &self.archive_id
    }

    pub fn last_modified_ms(&self) -> i64 {
        self.last_modified_ms
    }

    pub fn last_size(&self) -> u64 {
        self.last_size
    }

    pub fn needs_backup(&self) -> bool {
        self.needs_backup
    }

    pub fn was_observed(&self) -> bool {
        self.was_observed
    }

    fn observe(&mut self, current: FileStat) -> bool {
        self.was_observed = true;
        self.needs_backup =
            self.last_modified_ms != current.modified_ms || self.last_size != current.size;
        self.needs_backup
    }
}

/// Serialized form of one entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexRecord {
    #[serde(rename = "full-name")]
    full_name: PathBuf,
    file: PathBuf,
    id: ArchiveId,
    #[serde(rename = "last-modified")]
    last_modified: i64,
    #[serde(rename = "last-size")]
    last_size: u64,
}

/// Map of absolute source path to its tracking entry.
///
/// Serializes as a JSON array of records ordered by path, so an unchanged
/// index always produces the same document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<IndexRecord>", into = "Vec<IndexRecord>")]
pub struct Index {
    entries: BTreeMap<PathBuf, IndexEntry>,
}

impl From<Vec<IndexRecord>> for Index {
    fn from(records: Vec<IndexRecord>) -> Self {
        let entries = records
            .into_iter()
            .map(|r| {
                let entry = IndexEntry {
                    source_path: r.full_name.clone(),
                    archive_id: r.id,
                    last_modified_ms: r.last_modified,
                    last_size: r.last_size,
                    needs_backup: false,
                    was_observed: false,
                };
                (r.full_name, entry)
            })
            .collect();
        Self { entries }
    }
}

impl From<Index> for Vec<IndexRecord> {
    fn from(index: Index) -> Self {
        index
            .entries
            .into_iter()
            .map(|(path, entry)| IndexRecord {
                file: entry.source_path,
                full_name: path,
                id: entry.archive_id,
                last_modified: entry.last_modified_ms,
                last_size: entry.last_size,
            })
            .collect()
    }
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn get(&self, path: &Path) -> Option<&IndexEntry> {
        self.entries.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    /// Clears the per-run flags on every entry.
    pub fn begin_run(&mut self) {
        for entry in self.entries.values_mut() {
            entry.needs_backup = false;
            entry.was_observed = false;
        }
    }

    /// Starts tracking `path` with a fresh archive id. Returns false if it was already tracked.
    pub fn add_if_absent(&mut self, path: &Path) -> bool {
        debug_assert!(path.is_absolute(), "index keys must be absolute");
        if self.entries.contains_key(path) {
            return false;
        }
        self.entries
            .insert(path.to_path_buf(), IndexEntry::new(path.to_path_buf()));
        true
    }

    /// Flags `path` as seen this run and decides whether it changed since its last archive.
    ///
    /// Only size and modification time are compared. A rewrite that keeps both
    /// is not detected. Returns `None` for untracked paths.
    pub fn mark_observed(&mut self, path: &Path, current: FileStat) -> Option<bool> {
        self.entries.get_mut(path).map(|entry| entry.observe(current))
    }

    /// Records `stat` as the archived state of `path`.
    pub fn commit(&mut self, path: &Path, stat: FileStat) -> bool {
        match self.entries.get_mut(path) {
            Some(entry) => {
                entry.last_modified_ms = stat.modified_ms;
                entry.last_size = stat.size;
                entry.needs_backup = false;
                true
            }
            None => false,
        }
    }

    /// Forces `path` to be archived again on the next run.
    pub fn rollback(&mut self, path: &Path) -> bool {
        match self.entries.get_mut(path) {
            Some(entry) => {
                entry.last_modified_ms = NEVER_ARCHIVED;
                true
            }
            None => false,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(modified_ms: i64, size: u64) -> FileStat {
        FileStat { modified_ms, size }
    }

    #[test]
    fn test_add_if_absent_is_idempotent() {
        let mut index = Index::new();
        let path = Path::new("/data/a.txt");
        assert!(index.add_if_absent(path));
        let id = index.get(path).unwrap().archive_id().clone();

        assert!(!index.add_if_absent(path));
        assert_eq!(index.len(), 1);
        assert_eq!(index.get(path).unwrap().archive_id(), &id);
        assert!(index.get(path).unwrap().needs_backup());
    }

    #[test]
    fn test_new_entry_always_needs_backup() {
        let mut index = Index::new();
        let path = Path::new("/data/new.txt");
        index.add_if_absent(path);
        assert_eq!(index.mark_observed(path, stat(NEVER_ARCHIVED + 1, 0)), Some(true));
    }

    #[test]
    fn test_change_detection_by_size_or_mtime() {
        let mut index = Index::new();
        let path = Path::new("/data/a.txt");
        index.add_if_absent(path);
        index.commit(path, stat(1_000, 10));

        index.begin_run();
        assert_eq!(index.mark_observed(path, stat(1_000, 10)), Some(false));
        index.begin_run();
        assert_eq!(index.mark_observed(path, stat(2_000, 10)), Some(true));
        index.begin_run();
        assert_eq!(index.mark_observed(path, stat(1_000, 11)), Some(true));
        assert!(index.get(path).unwrap().was_observed());
    }

    #[test]
    fn test_mark_observed_on_untracked_path() {
        let mut index = Index::new();
        assert_eq!(index.mark_observed(Path::new("/nope"), stat(1, 1)), None);
    }

    #[test]
    fn test_rollback_forces_retry() {
        let mut index = Index::new();
        let path = Path::new("/data/a.txt");
        index.add_if_absent(path);
        index.commit(path, stat(5_000, 3));
        assert!(index.rollback(path));

        index.begin_run();
        assert_eq!(index.mark_observed(path, stat(5_000, 3)), Some(true));
        assert!(!index.rollback(Path::new("/other")));
    }

    #[test]
    fn test_begin_run_clears_flags() {
        let mut index = Index::new();
        let path = Path::new("/data/a.txt");
        index.add_if_absent(path);
        index.mark_observed(path, stat(1, 1));
        index.begin_run();
        let entry = index.get(path).unwrap();
        assert!(!entry.was_observed());
        assert!(!entry.needs_backup());
    }

    #[test]
    fn test_persisted_field_names() {
        let mut index = Index::new();
        let path = Path::new("/data/a.txt");
        index.add_if_absent(path);
        index.commit(path, stat(1_234, 56));

        let value: serde_json::Value = serde_json::from_str(&index.to_json().unwrap()).unwrap();
        let record = &value.as_array().unwrap()[0];
        assert_eq!(record["full-name"], "/data/a.txt");
        assert_eq!(record["file"], "/data/a.txt");
        assert_eq!(record["last-modified"], 1_234);
        assert_eq!(record["last-size"], 56);
        assert_eq!(
            record["id"],
            index.get(path).unwrap().archive_id().as_str()
        );
    }

    #[test]
    fn test_json_roundtrip_is_stable() {
        let mut index = Index::new();
        for name in ["/b", "/a", "/c/d"] {
            index.add_if_absent(Path::new(name));
            index.commit(Path::new(name), stat(7, 7));
        }
        let first = index.to_json().unwrap();
        let reloaded = Index::from_json(&first).unwrap();
        assert_eq!(reloaded.to_json().unwrap(), first);

        let order: Vec<_> = reloaded.iter().map(|e| e.source_path().to_path_buf()).collect();
        assert_eq!(order, vec![PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c/d")]);
    }
}
