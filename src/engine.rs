//! Batch orchestration: turns a candidate list into a terminal status per
//! asset.
//!
//! Candidates are split into fixed-size batches that all run at once. Inside a
//! batch every file is resolved and compressed concurrently (phase A), then
//! the survivors are transferred one after another (phase B). Outcomes flow
//! back over a channel to the single fan-in loop in [`Orchestrator::run`],
//! which is the only writer of terminal record state and progress.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::compress::{discard_staged, Compressor};
use crate::error::{AssetError, RunFailure};
use crate::source::{Access, AssetSource, Candidate};
use crate::store::{ProgressTracker, RecordPatch, RecordStore, UploadProgress};
use crate::transport::{TransferExecutor, TransferRequest, Transport, UploadMetadata};

pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Outcome handed to whoever triggered the run, including a background host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchResult {
    NewData,
    NoData,
    Failed,
}

impl FetchResult {
    pub fn is_success(self) -> bool {
        !matches!(self, FetchResult::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FetchResult::NewData => "new_data",
            FetchResult::NoData => "no_data",
            FetchResult::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAsset {
    pub id: String,
    pub filename: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub result: FetchResult,
    pub total: usize,
    pub succeeded: usize,
    pub failed: Vec<FailedAsset>,
    pub failure: Option<RunFailure>,
    pub elapsed_ms: u64,
}

impl RunReport {
    fn finished(result: FetchResult, total: usize, started: Instant) -> Self {
        Self {
            result,
            total,
            succeeded: 0,
            failed: Vec::new(),
            failure: None,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// The external pieces one run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn AssetSource>,
    pub compressor: Arc<dyn Compressor>,
    pub transport: Arc<dyn Transport>,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub batch_size: usize,
    pub user_id: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            user_id: String::new(),
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    collaborators: Collaborators,
    executor: TransferExecutor,
    records: Arc<RecordStore>,
    progress: Arc<ProgressTracker>,
    options: EngineOptions,
}

#[derive(Debug)]
struct FileOutcome {
    candidate: Candidate,
    result: Result<(), AssetError>,
}

#[derive(Debug, Default)]
struct Tally {
    succeeded: usize,
    failed: Vec<FailedAsset>,
    resolved: HashSet<String>,
}

impl Orchestrator {
    /// Must be called from within a tokio runtime; transfers are spawned onto it.
    pub fn new(
        collaborators: Collaborators,
        records: Arc<RecordStore>,
        progress: Arc<ProgressTracker>,
        options: EngineOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                collaborators,
                executor: TransferExecutor::current(),
                records,
                progress,
                options,
            }),
        }
    }

    pub fn records(&self) -> &Arc<RecordStore> {
        &self.inner.records
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.inner.progress
    }

    pub fn source(&self) -> &Arc<dyn AssetSource> {
        &self.inner.collaborators.source
    }

    /// Runs every candidate to a terminal status. Never fails: problems are
    /// folded into the report.
    pub async fn run(&self, files: Vec<Candidate>) -> RunReport {
        let started = Instant::now();
        let files = dedup_by_id(files);
        let total = files.len();

        if let Access::Denied(reason) = self.inner.collaborators.source.check_access().await {
            warn!(%reason, "source access not granted; aborting run");
            let mut report = RunReport::finished(FetchResult::Failed, total, started);
            report.failure = Some(RunFailure::PermissionDenied(reason));
            return report;
        }

        if files.is_empty() {
            self.inner.progress.clear();
            return RunReport::finished(FetchResult::NoData, 0, started);
        }

        let batch_size = self.inner.options.batch_size.max(1);
        let batches: Vec<Vec<Candidate>> = files.chunks(batch_size).map(<[_]>::to_vec).collect();
        info!(
            files = total,
            batches = batches.len(),
            batch_size,
            transport = self.inner.collaborators.transport.name(),
            "upload run starting"
        );

        self.inner.records.update_many(files.iter().map(|file| {
            (
                file.id.clone(),
                RecordPatch::uploading(&file.filename, &file.locator),
            )
        }));

        let mut progress = UploadProgress::started(total);
        self.inner.progress.save(&progress);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut handles = Vec::with_capacity(batches.len());
        for (offset, batch) in batches.into_iter().enumerate() {
            let index = offset + 1;
            let engine = self.clone();
            let events = events_tx.clone();
            let files = batch.clone();
            let handle = tokio::spawn(async move { engine.run_batch(index, files, events).await });
            handles.push((index, batch, handle));
        }
        drop(events_tx);

        let mut tally = Tally::default();
        while let Some(outcome) = events_rx.recv().await {
            self.settle(outcome, &mut tally);
            progress.current = tally.resolved.len();
            self.inner.progress.save(&progress);
        }

        for (index, batch, handle) in handles {
            let Err(err) = handle.await else {
                continue;
            };
            let reason = describe_join_error(err);
            error!(batch = index, %reason, "batch failed unexpectedly");
            for file in batch {
                if tally.resolved.contains(&file.id) {
                    continue;
                }
                // Siblings may have been staged before the batch died.
                self.inner.collaborators.compressor.discard(&file.id);
                self.settle(
                    FileOutcome {
                        candidate: file,
                        result: Err(AssetError::Batch(reason.clone())),
                    },
                    &mut tally,
                );
            }
        }

        progress.current = tally.succeeded;
        progress.is_uploading = false;
        self.inner.progress.save(&progress);

        let result = if tally.succeeded > 0 {
            FetchResult::NewData
        } else {
            FetchResult::Failed
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            files = total,
            succeeded = tally.succeeded,
            failed = tally.failed.len(),
            elapsed_ms,
            "upload run finished"
        );

        RunReport {
            result,
            total,
            succeeded: tally.succeeded,
            failed: tally.failed,
            failure: None,
            elapsed_ms,
        }
    }

    fn settle(&self, outcome: FileOutcome, tally: &mut Tally) {
        let FileOutcome { candidate, result } = outcome;
        match result {
            Ok(()) => {
                self.inner.records.mark_success(&candidate.id);
                tally.succeeded += 1;
            }
            Err(err) => {
                let error = err.to_string();
                warn!(asset_id = %candidate.id, filename = %candidate.filename, %error, "upload failed");
                self.inner.records.mark_failed(&candidate.id, &error);
                tally.failed.push(FailedAsset {
                    id: candidate.id.clone(),
                    filename: candidate.filename,
                    error,
                });
            }
        }
        tally.resolved.insert(candidate.id);
    }

    async fn run_batch(
        &self,
        index: usize,
        files: Vec<Candidate>,
        events: mpsc::UnboundedSender<FileOutcome>,
    ) {
        let started = Instant::now();
        let count = files.len();
        let mut failed = 0usize;

        let prepared = join_all(files.into_iter().map(|file| self.prepare(file))).await;
        let mut ready = Vec::with_capacity(prepared.len());
        for (candidate, result) in prepared {
            match result {
                Ok(payload) => ready.push((candidate, payload)),
                Err(err) => {
                    failed += 1;
                    let _ = events.send(FileOutcome {
                        candidate,
                        result: Err(err),
                    });
                }
            }
        }

        for (candidate, payload) in ready {
            let result = self.transfer(&candidate, &payload).await;
            discard_staged(&payload);
            if result.is_err() {
                failed += 1;
            }
            let _ = events.send(FileOutcome { candidate, result });
        }

        info!(
            batch = index,
            succeeded = count - failed,
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch complete"
        );
    }

    async fn prepare(&self, file: Candidate) -> (Candidate, Result<PathBuf, AssetError>) {
        let collaborators = &self.inner.collaborators;
        let started = Instant::now();
        let resolved = match collaborators.source.resolve(&file).await {
            Ok(path) => path,
            Err(err) => return (file, Err(AssetError::Resolve(format!("{err:#}")))),
        };
        let resolve_ms = started.elapsed().as_millis() as u64;

        let result = collaborators
            .compressor
            .compress(&file.id, &resolved)
            .await
            .map_err(|err| AssetError::Compress(format!("{err:#}")));
        debug!(
            asset_id = %file.id,
            resolve_ms,
            compress_ms = started.elapsed().as_millis() as u64 - resolve_ms,
            "prepared asset"
        );
        (file, result)
    }

    async fn transfer(&self, file: &Candidate, payload: &Path) -> Result<(), AssetError> {
        let started = Instant::now();
        let request = TransferRequest {
            payload: payload.to_path_buf(),
            metadata: UploadMetadata {
                asset_id: file.id.clone(),
                filename: file.filename.clone(),
                user_id: self.inner.options.user_id.clone(),
            },
        };
        let response = self
            .inner
            .executor
            .submit(Arc::clone(&self.inner.collaborators.transport), request)
            .await?;
        debug!(
            asset_id = %file.id,
            status = response.status,
            transfer_ms = started.elapsed().as_millis() as u64,
            "transfer finished"
        );
        response.into_outcome()?;
        Ok(())
    }
}

fn dedup_by_id(files: Vec<Candidate>) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    files
        .into_iter()
        .filter(|file| seen.insert(file.id.clone()))
        .collect()
}

fn describe_join_error(err: JoinError) -> String {
    if !err.is_panic() {
        return "batch task was cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "batch task panicked".to_string()
    }
}
