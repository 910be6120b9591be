//! Status document kept as a plain JSON file.
//!
//! The redb store is held exclusively by a running engine, so anything that
//! wants to read status from another process reads this file instead. Writes
//! go to a sibling temp file first and are renamed into place, so a reader
//! never sees a half-written document.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Status file that sits next to a snapshot store: `state.redb` → `state.status.json`.
    pub fn beside(store_path: &Path) -> Self {
        Self::new(store_path.with_extension("status.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the document.
    pub fn write<T: Serialize>(&self, value: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(category = "storage", path = %self.path.display(), "Status file written");
        Ok(())
    }

    /// The current document, or `None` when nothing was written yet.
    pub fn read<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshots::SnapshotStore;

    #[test]
    fn test_beside_store_path() {
        let file = StatusFile::beside(Path::new("/var/lib/fieldscan/state.redb"));
        assert_eq!(file.path(), Path::new("/var/lib/fieldscan/state.status.json"));
    }

    #[test]
    fn test_readable_while_store_is_open() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("state.redb");
        let _store = SnapshotStore::open(&db, 5).unwrap();
        assert!(SnapshotStore::open(&db, 5).is_err());

        let file = StatusFile::beside(&db);
        assert!(file.read::<serde_json::Value>().unwrap().is_none());
        file.write(&serde_json::json!({"cycles_run": 3})).unwrap();
        file.write(&serde_json::json!({"cycles_run": 4})).unwrap();

        let status: serde_json::Value = StatusFile::beside(&db).read().unwrap().unwrap();
        assert_eq!(status["cycles_run"], 4);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
