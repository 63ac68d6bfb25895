//! Per-network resume checkpoints.
//!
//! After each batch a runner sees committed, it records the last committed
//! ledger in `checkpoint-<network>.json`. On restart the runner resumes from
//! the ledger after it, or from the configured start ledger if that is later.
//!
//! The file is written to a temporary sibling and renamed into place, so a
//! crash mid-write leaves the previous checkpoint intact.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::current_time_ms;
use crate::error::Result;
use crate::types::{NetworkName, SchemaName};

/// Contents of one resume file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeCheckpoint {
    /// Network the file belongs to.
    pub network: String,
    /// Schema the network writes to.
    pub schema: String,
    /// Highest ledger known to be committed.
    pub last_committed_ledger: u32,
    /// Batches committed since the runner started counting.
    pub batch_number: u64,
    /// Unix ms of the last update.
    pub updated_ms: u64,
}

impl ResumeCheckpoint {
    /// A checkpoint stamped now.
    pub fn new(network: &NetworkName, schema: &SchemaName, last_committed_ledger: u32, batch_number: u64) -> Self {
        Self {
            network: network.to_string(),
            schema: schema.to_string(),
            last_committed_ledger,
            batch_number,
            updated_ms: current_time_ms(),
        }
    }
}

/// Reads and writes one network's resume file.
#[derive(Debug, Clone)]
pub struct ResumeStore {
    path: PathBuf,
}

impl ResumeStore {
    /// Store for `network` under `dir`.
    pub fn new(dir: impl AsRef<Path>, network: &NetworkName) -> Self {
        Self {
            path: dir.as_ref().join(format!("checkpoint-{}.json", network)),
        }
    }

    /// Path of the resume file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the checkpoint, or `None` if there is no file yet.
    pub fn load(&self) -> Result<Option<ResumeCheckpoint>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Replaces the checkpoint.
    pub fn save(&self, checkpoint: &ResumeCheckpoint) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(checkpoint)?)?;
        fs::rename(&tmp, &self.path)?;
        debug!(
            path = %self.path.display(),
            last_committed_ledger = checkpoint.last_committed_ledger,
            "resume checkpoint saved"
        );
        Ok(())
    }

    /// First ledger to ingest: the later of `configured_start` and the ledger
    /// after the last committed one.
    pub fn resume_point(&self, configured_start: u32) -> Result<u32> {
        Ok(match self.load()? {
            Some(cp) => configured_start.max(cp.last_committed_ledger.saturating_add(1)),
            None => configured_start,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path) -> ResumeStore {
        ResumeStore::new(dir, &NetworkName::new("alpha"))
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.load().unwrap().is_none());
        assert_eq!(store.resume_point(100).unwrap(), 100);
    }

    #[test]
    fn test_save_then_resume_after_last_committed() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let schema = SchemaName::parse("alpha").unwrap();

        store
            .save(&ResumeCheckpoint::new(&NetworkName::new("alpha"), &schema, 250, 1))
            .unwrap();
        assert!(store.path().ends_with("checkpoint-alpha.json"));

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.last_committed_ledger, 250);
        assert_eq!(loaded.batch_number, 1);

        assert_eq!(store.resume_point(1).unwrap(), 251);
        // a later configured start wins
        assert_eq!(store.resume_point(1000).unwrap(), 1000);
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        fs::write(store.path(), b"{not json").unwrap();
        assert!(store.load().is_err());
    }
}
