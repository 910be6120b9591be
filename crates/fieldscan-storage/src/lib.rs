//! Canonical discovery state for fieldscan.
//!
//! - [`registry`]: in-memory registry with per-key merge rules and a change log
//! - [`snapshots`]: redb-backed snapshots of the registry view per cycle
//! - [`status_file`]: status document readable while the engine runs

pub mod error;
pub mod registry;
pub mod snapshots;
pub mod status_file;

pub use error::{Result, StorageError};
pub use registry::{Change, ClassificationMerge, DeviceMerge, LogEntry, Registry};
pub use snapshots::{SnapshotBackend, SnapshotStore};
pub use status_file::StatusFile;
