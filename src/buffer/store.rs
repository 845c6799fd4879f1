//! Filesystem container for segment files.
//!
//! The scratch directory is owned exclusively by one buffer. It holds only
//! segment files (`segment_<generation>_<index>.mp4`) and, during an export,
//! the concat manifest.

use std::path::{Path, PathBuf};

use crate::shared::errors::StorageError;
use crate::shared::paths::ensure_dir;

const SEGMENT_PREFIX: &str = "segment_";
const SEGMENT_EXTENSION: &str = "mp4";
const MANIFEST_NAME: &str = "segmentlist.txt";

#[derive(Debug, Clone)]
pub struct SegmentStore {
    dir: PathBuf,
}

impl SegmentStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        ensure_dir(&dir)
            .map_err(|e| StorageError::directory(format!("{}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segment_path(&self, generation: u64, index: u64) -> PathBuf {
        self.dir.join(format!(
            "{}{}_{:06}.{}",
            SEGMENT_PREFIX, generation, index, SEGMENT_EXTENSION
        ))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_NAME)
    }

    pub fn is_segment_file(path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        name.starts_with(SEGMENT_PREFIX)
            && path.extension().and_then(|e| e.to_str()) == Some(SEGMENT_EXTENSION)
    }

    /// Segment files currently on disk, in lexical order.
    pub fn list(&self) -> Result<Vec<PathBuf>, StorageError> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && Self::is_segment_file(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    /// Removes a file. A file that is already gone is not an error.
    pub fn delete(&self, path: &Path) -> Result<(), StorageError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes a file and logs instead of failing. Used for eviction, where a
    /// failed delete must not stop rotation.
    pub fn delete_quietly(&self, path: &Path) {
        if let Err(e) = self.delete(path) {
            tracing::warn!(target: "buffer", "[STORE] Failed to delete {:?}: {}", path, e);
        }
    }

    /// Removes every segment-pattern file and any stale manifest left by an
    /// unclean shutdown. Returns the number of files removed.
    pub fn clear(&self) -> Result<usize, StorageError> {
        let mut removed = 0;
        for path in self.list()? {
            self.delete(&path)?;
            removed += 1;
        }

        let manifest = self.manifest_path();
        if manifest.exists() {
            self.delete(&manifest)?;
            removed += 1;
        }

        if removed > 0 {
            tracing::info!(target: "buffer", "[STORE] Cleared {} stale files from {:?}", removed, self.dir);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_path_is_inside_scratch_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(tmp.path()).unwrap();

        let path = store.segment_path(2, 7);
        assert_eq!(path.parent().unwrap(), tmp.path());
        assert_eq!(path.file_name().unwrap(), "segment_2_000007.mp4");
        assert!(SegmentStore::is_segment_file(&path));
    }

    #[test]
    fn test_list_ignores_foreign_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(tmp.path()).unwrap();

        std::fs::write(store.segment_path(1, 1), b"b").unwrap();
        std::fs::write(store.segment_path(1, 0), b"a").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"x").unwrap();
        std::fs::write(tmp.path().join("segment_1_000009.mkv"), b"x").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed, vec![store.segment_path(1, 0), store.segment_path(1, 1)]);
    }

    #[test]
    fn test_clear_removes_segments_and_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(tmp.path()).unwrap();

        for i in 0..3 {
            std::fs::write(store.segment_path(0, i), b"data").unwrap();
        }
        std::fs::write(store.manifest_path(), b"file 'x'").unwrap();
        std::fs::write(tmp.path().join("keep.log"), b"x").unwrap();

        assert_eq!(store.clear().unwrap(), 4);
        assert!(store.list().unwrap().is_empty());
        assert!(!store.manifest_path().exists());
        assert!(tmp.path().join("keep.log").exists());
    }

    #[test]
    fn test_delete_missing_file_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(tmp.path()).unwrap();
        assert!(store.delete(&store.segment_path(0, 42)).is_ok());
    }
}
