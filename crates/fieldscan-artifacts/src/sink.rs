//! Writes generated artifacts to disk.
//!
//! Layout under the output directory:
//! `dashboards/<group>.json`, `alerts/<group>.json`, `wiring/<group>.json`,
//! where `<group>` is the group id with `/` replaced by `.`.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::Result;
use crate::model::{GenerationReport, GroupArtifacts};

const KINDS: [&str; 3] = ["dashboards", "alerts", "wiring"];

pub struct FileSink {
    root: PathBuf,
}

impl FileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_name(group_id: &str) -> String {
        format!("{}.json", group_id.replace('/', "."))
    }

    pub fn path_for(&self, kind: &str, group_id: &str) -> PathBuf {
        self.root.join(kind).join(Self::file_name(group_id))
    }

    /// Write changed groups and delete files of removed ones.
    ///
    /// Returns the number of files written.
    pub fn apply(&self, report: &GenerationReport) -> Result<usize> {
        let mut written = 0;
        for artifacts in &report.changed {
            written += self.write_group(artifacts)?;
        }
        for group_id in &report.removed {
            self.remove_group(group_id)?;
        }
        if written > 0 || !report.removed.is_empty() {
            info!(
                category = "artifacts",
                dir = %self.root.display(),
                written,
                removed = report.removed.len(),
                "Artifacts written"
            );
        }
        Ok(written)
    }

    fn write_group(&self, artifacts: &GroupArtifacts) -> Result<usize> {
        let documents = [
            serde_json::to_vec_pretty(&artifacts.dashboard)?,
            serde_json::to_vec_pretty(&artifacts.alerts)?,
            serde_json::to_vec_pretty(&artifacts.wiring)?,
        ];
        for (kind, bytes) in KINDS.iter().zip(documents.iter()) {
            let path = self.path_for(kind, &artifacts.group_id);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, bytes)?;
            debug!(category = "artifacts", path = %path.display(), "Artifact file written");
        }
        Ok(KINDS.len())
    }

    fn remove_group(&self, group_id: &str) -> Result<()> {
        for kind in KINDS {
            let path = self.path_for(kind, group_id);
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(category = "artifacts", path = %path.display(), "Artifact file removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
