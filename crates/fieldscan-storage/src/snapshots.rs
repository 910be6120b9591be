//! Persistent registry snapshots using redb.
//!
//! One JSON document per cycle number, oldest pruned beyond the configured
//! retention.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use fieldscan_core::RegistrySnapshot;

use crate::error::{Result, StorageError};

// Snapshots table: key = cycle number, value = RegistrySnapshot (JSON)
const SNAPSHOTS_TABLE: TableDefinition<u64, &str> = TableDefinition::new("registry_snapshots");

// Meta table: key = document name, value = JSON
const META_TABLE: TableDefinition<&str, &str> = TableDefinition::new("meta");

/// Where registry snapshots and status documents are persisted.
///
/// [`SnapshotStore`] is the redb implementation; the orchestrator only sees
/// this trait.
pub trait SnapshotBackend: Send + Sync {
    /// Persist a snapshot, pruning old ones as the backend sees fit.
    fn save(&self, snapshot: &RegistrySnapshot) -> Result<()>;

    /// Most recent snapshot, if any.
    fn latest(&self) -> Result<Option<RegistrySnapshot>>;

    /// Store a named JSON document.
    fn put_document(&self, key: &str, json: &str) -> Result<()>;

    fn get_document(&self, key: &str) -> Result<Option<String>>;

    /// Human-readable location for logs.
    fn location(&self) -> String;
}

impl dyn SnapshotBackend + '_ {
    pub fn put_meta<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.put_document(key, &serde_json::to_string(value)?)
    }

    pub fn get_meta<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_document(key)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

pub struct SnapshotStore {
    db: Arc<Database>,
    path: PathBuf,
    retention: usize,
}

impl SnapshotStore {
    /// Open or create a snapshot store at the given path.
    pub fn open<P: AsRef<Path>>(path: P, retention: usize) -> Result<Self> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = if path_ref.exists() {
            Database::open(path_ref)?
        } else {
            Database::create(path_ref)?
        };

        let write_txn = db.begin_write()?;
        {
            let _snapshots = write_txn.open_table(SNAPSHOTS_TABLE)?;
            let _meta = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        info!(category = "storage", path = %path_ref.display(), "Snapshot store opened");
        Ok(Self {
            db: Arc::new(db),
            path: path_ref.to_path_buf(),
            retention: retention.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a snapshot and prune the oldest beyond retention.
    pub fn save(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;
        let write_txn = self.db.begin_write()?;
        let pruned = {
            let mut table = write_txn.open_table(SNAPSHOTS_TABLE)?;
            table.insert(snapshot.cycle, json.as_str())?;

            let len = table.len()? as usize;
            let excess = len.saturating_sub(self.retention);
            let mut old = Vec::with_capacity(excess);
            for entry in table.iter()?.take(excess) {
                let (key, _) = entry?;
                old.push(key.value());
            }
            for cycle in &old {
                table.remove(*cycle)?;
            }
            old.len()
        };
        write_txn.commit()?;
        debug!(category = "storage", cycle = snapshot.cycle, pruned, "Snapshot saved");
        Ok(())
    }

    pub fn load(&self, cycle: u64) -> Result<RegistrySnapshot> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SNAPSHOTS_TABLE)?;
        match table.get(cycle)? {
            Some(value) => Ok(serde_json::from_str(value.value())?),
            None => Err(StorageError::NotFound(format!("snapshot for cycle {}", cycle))),
        }
    }

    /// Most recent snapshot, if any.
    pub fn latest(&self) -> Result<Option<RegistrySnapshot>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SNAPSHOTS_TABLE)?;
        let result = match table.iter()?.next_back() {
            Some(entry) => {
                let (_, value) = entry?;
                Ok(Some(serde_json::from_str(value.value())?))
            }
            None => Ok(None),
        };
        result
    }

    /// Stored cycle numbers in ascending order.
    pub fn cycles(&self) -> Result<Vec<u64>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SNAPSHOTS_TABLE)?;
        let mut cycles = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            cycles.push(key.value());
        }
        Ok(cycles)
    }

    /// Store a small named JSON document next to the snapshots.
    pub fn put_meta<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.put_document(key, &serde_json::to_string(value)?)
    }

    pub fn get_meta<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_document(key)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

impl SnapshotBackend for SnapshotStore {
    fn save(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        SnapshotStore::save(self, snapshot)
    }

    fn latest(&self) -> Result<Option<RegistrySnapshot>> {
        SnapshotStore::latest(self)
    }

    fn put_document(&self, key: &str, json: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(META_TABLE)?;
            table.insert(key, json)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_document(&self, key: &str) -> Result<Option<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(META_TABLE)?;
        Ok(table.get(key)?.map(|value| value.value().to_string()))
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldscan_core::CurrentView;

    fn snapshot(cycle: u64) -> RegistrySnapshot {
        RegistrySnapshot {
            cycle,
            taken_at: 1_000 + cycle as i64,
            view: CurrentView {
                version: cycle * 10,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_save_load_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().join("snap.redb"), 10).unwrap();
        assert!(store.latest().unwrap().is_none());

        store.save(&snapshot(1)).unwrap();
        store.save(&snapshot(2)).unwrap();
        assert_eq!(store.load(1).unwrap().view.version, 10);
        assert_eq!(store.latest().unwrap().unwrap().cycle, 2);
        assert!(matches!(store.load(7), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_retention_prunes_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().join("nested/snap.redb"), 3).unwrap();
        for cycle in 1..=5 {
            store.save(&snapshot(cycle)).unwrap();
        }
        assert_eq!(store.cycles().unwrap(), vec![3, 4, 5]);
    }

    #[test]
    fn test_reopen_keeps_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.redb");
        {
            let store = SnapshotStore::open(&path, 5).unwrap();
            store.save(&snapshot(9)).unwrap();
        }
        let store = SnapshotStore::open(&path, 5).unwrap();
        assert_eq!(store.latest().unwrap().unwrap().cycle, 9);
    }

    #[test]
    fn test_meta_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().join("snap.redb"), 5).unwrap();
        assert!(store.get_meta::<serde_json::Value>("status").unwrap().is_none());
        store.put_meta("status", &serde_json::json!({"cycle": 3})).unwrap();
        store.put_meta("status", &serde_json::json!({"cycle": 4})).unwrap();
        let status: serde_json::Value = store.get_meta("status").unwrap().unwrap();
        assert_eq!(status["cycle"], 4);
    }
}
