use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::JsonDocument;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Success,
    Failed,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Success => "success",
            UploadStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadRecord {
    pub id: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub uri: String,
    pub status: UploadStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadRecord {
    fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            filename: String::new(),
            uri: String::new(),
            status: UploadStatus::Pending,
            retry_count: 0,
            last_attempt: None,
            uploaded_at: None,
            error: None,
        }
    }

    fn set_status(&mut self, status: UploadStatus) {
        self.status = status;
        if status == UploadStatus::Success {
            self.uploaded_at.get_or_insert_with(Utc::now);
        } else {
            self.uploaded_at = None;
        }
    }
}

/// Fields merged into a record by [`RecordStore::set_status`].
///
/// There is no `retry_count` field; it only moves through
/// [`RecordStore::mark_failed`].
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub filename: Option<String>,
    pub uri: Option<String>,
    pub status: Option<UploadStatus>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl RecordPatch {
    pub fn uploading(filename: &str, uri: &str) -> Self {
        Self {
            filename: Some(filename.to_string()),
            uri: Some(uri.to_string()),
            status: Some(UploadStatus::Uploading),
            ..Default::default()
        }
    }

    fn apply(self, record: &mut UploadRecord) {
        // filename is fixed once known
        if let Some(filename) = self.filename {
            if record.filename.is_empty() {
                record.filename = filename;
            }
        }
        if let Some(uri) = self.uri {
            record.uri = uri;
        }
        if let Some(status) = self.status {
            record.set_status(status);
        }
        if let Some(last_attempt) = self.last_attempt {
            record.last_attempt = Some(last_attempt);
        }
        if let Some(error) = self.error {
            record.error = Some(error);
        }
    }
}

/// Anything that carries a stable asset identifier.
pub trait AssetKey {
    fn asset_id(&self) -> &str;
}

impl AssetKey for UploadRecord {
    fn asset_id(&self) -> &str {
        &self.id
    }
}

impl AssetKey for String {
    fn asset_id(&self) -> &str {
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadStats {
    pub total: usize,
    pub success: usize,
    /// Failed and out of retries.
    pub failed: usize,
    /// Pending, interrupted, or failed with retries left.
    pub pending: usize,
}

/// Selection policy for one candidate given its persisted record.
pub fn needs_upload(record: Option<&UploadRecord>, max_retries: u32) -> bool {
    let Some(record) = record else {
        return true;
    };
    match record.status {
        UploadStatus::Pending | UploadStatus::Uploading => true,
        UploadStatus::Failed => record.retry_count < max_retries,
        UploadStatus::Success => false,
    }
}

/// Durable asset id -> [`UploadRecord`] map.
///
/// Every mutation is a read-modify-write of the whole document under one
/// process-wide lock, so concurrent merges never drop each other's fields.
/// Storage failures are logged and swallowed.
#[derive(Debug)]
pub struct RecordStore {
    doc: JsonDocument,
    max_retries: u32,
    lock: Mutex<()>,
}

impl RecordStore {
    pub fn new(doc: JsonDocument, max_retries: u32) -> Self {
        Self {
            doc,
            max_retries,
            lock: Mutex::new(()),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn get_status(&self, id: &str) -> Option<UploadRecord> {
        self.read().remove(id)
    }

    pub fn all(&self) -> Vec<UploadRecord> {
        self.read().into_values().collect()
    }

    pub fn set_status(&self, id: &str, patch: RecordPatch) {
        self.update_many([(id.to_string(), patch)]);
    }

    /// Merges several patches with a single document write.
    pub fn update_many(&self, patches: impl IntoIterator<Item = (String, RecordPatch)>) {
        let _guard = self.guard();
        let mut records = self.read();
        for (id, patch) in patches {
            let record = records
                .entry(id.clone())
                .or_insert_with(|| UploadRecord::empty(&id));
            patch.apply(record);
        }
        self.write(&records);
    }

    pub fn mark_success(&self, id: &str) {
        self.update(id, |record| {
            record.set_status(UploadStatus::Success);
            record.uploaded_at = Some(Utc::now());
            record.error = None;
        });
    }

    pub fn mark_failed(&self, id: &str, error: &str) {
        self.update(id, |record| {
            record.set_status(UploadStatus::Failed);
            record.retry_count = record.retry_count.saturating_add(1);
            record.last_attempt = Some(Utc::now());
            record.error = Some(error.to_string());
        });
    }

    /// Returns the candidates that must be (re)uploaded, preserving order.
    pub fn select_needing_upload<T: AssetKey + Clone>(&self, candidates: &[T]) -> Vec<T> {
        let records = self.read();
        candidates
            .iter()
            .filter(|candidate| needs_upload(records.get(candidate.asset_id()), self.max_retries))
            .cloned()
            .collect()
    }

    pub fn clear_all(&self) {
        let _guard = self.guard();
        if let Err(err) = self.doc.remove() {
            warn!(error = %format!("{err:#}"), "failed to clear upload records");
        }
    }

    pub fn stats(&self) -> UploadStats {
        let mut stats = UploadStats::default();
        for record in self.read().values() {
            stats.total += 1;
            match record.status {
                UploadStatus::Success => stats.success += 1,
                UploadStatus::Failed if record.retry_count >= self.max_retries => {
                    stats.failed += 1
                }
                _ => stats.pending += 1,
            }
        }
        stats
    }

    fn update(&self, id: &str, apply: impl FnOnce(&mut UploadRecord)) {
        let _guard = self.guard();
        let mut records = self.read();
        let record = records
            .entry(id.to_string())
            .or_insert_with(|| UploadRecord::empty(id));
        apply(record);
        self.write(&records);
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read(&self) -> BTreeMap<String, UploadRecord> {
        match self.doc.load() {
            Ok(records) => records.unwrap_or_default(),
            Err(err) => {
                warn!(
                    path = %self.doc.path().display(),
                    error = %format!("{err:#}"),
                    "upload records unreadable; treating as empty"
                );
                BTreeMap::new()
            }
        }
    }

    fn write(&self, records: &BTreeMap<String, UploadRecord>) {
        if let Err(err) = self.doc.save(records) {
            warn!(
                path = %self.doc.path().display(),
                error = %format!("{err:#}"),
                "failed to persist upload records"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> RecordStore {
        RecordStore::new(
            JsonDocument::new(tmp.path().join("records.json")),
            DEFAULT_MAX_RETRIES,
        )
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn unknown_assets_need_upload() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let candidates = ids(&["a", "b"]);
        assert_eq!(store.select_needing_upload(&candidates), candidates);
    }

    #[test]
    fn success_is_excluded_and_selection_is_stable() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.mark_success("done");
        let candidates = ids(&["done", "fresh"]);

        let first = store.select_needing_upload(&candidates);
        let second = store.select_needing_upload(&candidates);

        assert_eq!(first, ids(&["fresh"]));
        assert_eq!(first, second);
    }

    #[test]
    fn failed_assets_retry_until_ceiling() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let candidates = ids(&["flaky"]);

        store.mark_failed("flaky", "boom");
        store.mark_failed("flaky", "boom");
        assert_eq!(store.get_status("flaky").unwrap().retry_count, 2);
        assert_eq!(store.select_needing_upload(&candidates), candidates);

        store.mark_failed("flaky", "boom again");
        assert_eq!(store.get_status("flaky").unwrap().retry_count, 3);
        assert!(store.select_needing_upload(&candidates).is_empty());
    }

    #[test]
    fn retry_count_increments_by_one_per_failure() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let mut previous = 0;
        for attempt in 1..=5 {
            store.mark_failed("x", &format!("attempt {attempt}"));
            let record = store.get_status("x").unwrap();
            assert_eq!(record.retry_count, previous + 1);
            assert_eq!(record.error.as_deref(), Some(format!("attempt {attempt}").as_str()));
            assert!(record.last_attempt.is_some());
            previous = record.retry_count;
        }

        store.set_status("x", RecordPatch::uploading("x.png", "/tmp/x.png"));
        assert_eq!(store.get_status("x").unwrap().retry_count, previous);

        store.clear_all();
        store.mark_failed("x", "fresh start");
        assert_eq!(store.get_status("x").unwrap().retry_count, 1);
    }

    #[test]
    fn uploaded_at_tracks_success_only() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.mark_failed("a", "nope");
        assert!(store.get_status("a").unwrap().uploaded_at.is_none());

        store.mark_success("a");
        let record = store.get_status("a").unwrap();
        assert_eq!(record.status, UploadStatus::Success);
        assert!(record.uploaded_at.is_some());
        assert!(record.error.is_none());

        store.set_status(
            "a",
            RecordPatch {
                status: Some(UploadStatus::Pending),
                ..Default::default()
            },
        );
        assert!(store.get_status("a").unwrap().uploaded_at.is_none());
    }

    #[test]
    fn interrupted_run_is_fully_reselected() {
        let tmp = TempDir::new().unwrap();
        let candidates: Vec<String> = (0..10).map(|i| format!("asset-{i}")).collect();
        {
            let store = store(&tmp);
            store.update_many(candidates.iter().map(|id| {
                (
                    id.clone(),
                    RecordPatch::uploading(&format!("{id}.png"), &format!("/shots/{id}.png")),
                )
            }));
        }

        // A fresh store stands in for the restarted process.
        let store = store(&tmp);
        assert_eq!(store.select_needing_upload(&candidates), candidates);
        assert_eq!(store.stats().pending, 10);
    }

    #[test]
    fn set_status_merges_and_keeps_filename() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.set_status("a", RecordPatch::uploading("first.png", "/old/first.png"));
        store.set_status("a", RecordPatch::uploading("renamed.png", "/new/first.png"));

        let record = store.get_status("a").unwrap();
        assert_eq!(record.filename, "first.png");
        assert_eq!(record.uri, "/new/first.png");
        assert_eq!(record.status, UploadStatus::Uploading);
    }

    #[test]
    fn stats_are_derived_from_records() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.mark_success("ok");
        for _ in 0..3 {
            store.mark_failed("dead", "gone");
        }
        store.mark_failed("retry", "once");
        store.set_status("busy", RecordPatch::uploading("busy.png", "/busy.png"));

        assert_eq!(
            store.stats(),
            UploadStats {
                total: 4,
                success: 1,
                failed: 1,
                pending: 2,
            }
        );
    }

    #[test]
    fn corrupt_document_reads_as_empty() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("records.json"), "{not json").unwrap();
        let store = store(&tmp);

        assert!(store.get_status("a").is_none());
        assert_eq!(store.stats(), UploadStats::default());

        store.mark_success("a");
        assert_eq!(store.get_status("a").unwrap().status, UploadStatus::Success);
    }

    #[test]
    fn concurrent_failures_are_not_lost() {
        let tmp = TempDir::new().unwrap();
        let store = std::sync::Arc::new(store(&tmp));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || store.mark_failed("shared", "contended"))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get_status("shared").unwrap().retry_count, 8);
    }

    #[test]
    fn policy_table() {
        let mut record = UploadRecord::empty("a");
        assert!(needs_upload(None, 3));
        assert!(needs_upload(Some(&record), 3));
        record.status = UploadStatus::Uploading;
        assert!(needs_upload(Some(&record), 3));
        record.status = UploadStatus::Failed;
        record.retry_count = 2;
        assert!(needs_upload(Some(&record), 3));
        record.retry_count = 3;
        assert!(!needs_upload(Some(&record), 3));
        assert!(needs_upload(Some(&record), 5));
        record.status = UploadStatus::Success;
        assert!(!needs_upload(Some(&record), 3));
    }
}
