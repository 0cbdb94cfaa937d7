use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::JsonDocument;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadProgress {
    pub current: usize,
    pub total: usize,
    pub is_uploading: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
}

impl UploadProgress {
    pub fn started(total: usize) -> Self {
        Self {
            current: 0,
            total,
            is_uploading: true,
            start_time: Some(Utc::now()),
        }
    }
}

/// Singleton progress document shared between whoever runs uploads and
/// whoever polls for them. Each save replaces the whole document.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    doc: JsonDocument,
}

impl ProgressTracker {
    pub fn new(doc: JsonDocument) -> Self {
        Self { doc }
    }

    pub fn save(&self, progress: &UploadProgress) {
        if let Err(err) = self.doc.save(progress) {
            warn!(error = %format!("{err:#}"), "failed to save upload progress");
        }
    }

    pub fn load(&self) -> Option<UploadProgress> {
        match self.doc.load() {
            Ok(progress) => progress,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to read upload progress");
                None
            }
        }
    }

    pub fn clear(&self) {
        if let Err(err) = self.doc.remove() {
            warn!(error = %format!("{err:#}"), "failed to clear upload progress");
        }
    }
}
