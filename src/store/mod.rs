//! Durable state for the upload engine.
//!
//! Two independent namespaces live under the state directory: the per-asset
//! record map and the singleton progress document. Each is one JSON file that
//! is replaced atomically on every write.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

mod progress;
mod records;

pub use progress::{ProgressTracker, UploadProgress};
pub use records::{
    AssetKey, RecordPatch, RecordStore, UploadRecord, UploadStats, UploadStatus,
    DEFAULT_MAX_RETRIES,
};

pub const RECORDS_FILE: &str = "records.json";
pub const PROGRESS_FILE: &str = "progress.json";

/// A single JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonDocument {
    path: PathBuf,
}

impl JsonDocument {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `Ok(None)` when the document has never been written.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        let value = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        Ok(Some(value))
    }

    pub fn save<T: Serialize>(&self, value: &T) -> Result<()> {
        write_json_atomic(&self.path, value)
    }

    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove {}", self.path.display()))
            }
        }
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;

    let bytes = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to move temporary file {} to {}",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

/// Opens both namespaces under `state_dir`.
pub fn open(state_dir: &Path, max_retries: u32) -> (RecordStore, ProgressTracker) {
    let records = RecordStore::new(JsonDocument::new(state_dir.join(RECORDS_FILE)), max_retries);
    let progress = ProgressTracker::new(JsonDocument::new(state_dir.join(PROGRESS_FILE)));
    (records, progress)
}
