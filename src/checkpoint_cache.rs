use std::fs;
use std::path::{Path, PathBuf};

use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};

/// The on-disk mirror of a `_local/<sessionID>` checkpoint document (spec
/// §4.8). This cache is not authoritative: on startup the replicator still
/// asks the remote for the real checkpoint via `GET _local/<sessionID>` and
/// only falls back to this file if that request fails, since the remote
/// may have been reset independently of the local disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckpointDocument {
    pub last_sequence: u64,
    #[serde(default)]
    pub session_id: String,
}

pub struct CheckpointCache {
    path: PathBuf,
}

impl CheckpointCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<Option<CheckpointDocument>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .map_err(|e| eyre!("failed to read checkpoint cache {}: {e}", self.path.display()))?;
        let doc: CheckpointDocument = serde_json::from_str(&raw)
            .map_err(|e| eyre!("failed to parse checkpoint cache {}: {e}", self.path.display()))?;
        Ok(Some(doc))
    }

    /// Writes `doc` via a temp-file-then-rename, so a crash mid-write never
    /// leaves a half-written checkpoint behind.
    pub fn save(&self, doc: &CheckpointDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| eyre!("failed to create checkpoint directory {}: {e}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(doc)
            .map_err(|e| eyre!("failed to serialize checkpoint: {e}"))?;

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json)
            .map_err(|e| eyre!("failed to write temp checkpoint file {}: {e}", tmp_path.display()))?;

        if let Err(err) = fs::rename(&tmp_path, &self.path) {
            if cfg!(windows) {
                let _ = fs::remove_file(&self.path);
                fs::rename(&tmp_path, &self.path)
                    .map_err(|e| eyre!("failed to replace checkpoint file {}: {e}", self.path.display()))?;
            } else {
                return Err(eyre!(
                    "failed to replace checkpoint file {}: {err}",
                    self.path.display()
                ));
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
