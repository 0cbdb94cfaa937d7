//! Periodic and foreground entry points into the orchestrator.
//!
//! [`UploadScheduler`] owns the pending queue that hands file identity from a
//! foreground submission to a later background wake-up, and makes sure only
//! one run is active at a time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::engine::{FetchResult, Orchestrator, RunReport};
use crate::source::Candidate;

mod host;

pub use host::TokioHost;

pub const UPLOAD_TASK: &str = "shotup-background-upload";
pub const DEFAULT_INTERVAL_MINUTES: u64 = 15;
/// One week.
pub const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

/// Converts a minute count into a wake-up interval, clamped to
/// `1..=MAX_INTERVAL_MINUTES`.
pub fn interval_from_minutes(minutes: u64) -> Duration {
    Duration::from_secs(minutes.clamp(1, MAX_INTERVAL_MINUTES) * 60)
}

pub type TaskCallback = Arc<dyn Fn() -> BoxFuture<'static, FetchResult> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    pub minimum_interval: Duration,
    pub stop_on_terminate: bool,
    pub start_on_boot: bool,
}

impl TaskOptions {
    pub fn every(minimum_interval: Duration) -> Self {
        Self {
            minimum_interval,
            stop_on_terminate: false,
            start_on_boot: true,
        }
    }
}

/// Whatever wakes the process up periodically.
#[async_trait]
pub trait SchedulingHost: Send + Sync {
    /// Associates a callback with a task name. Must happen before `register`.
    fn define(&self, name: &str, callback: TaskCallback);

    async fn is_registered(&self, name: &str) -> bool;

    async fn register(&self, name: &str, options: TaskOptions) -> Result<()>;

    async fn unregister(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub registered: bool,
    pub queued: usize,
    pub running: bool,
}

pub struct UploadScheduler {
    orchestrator: Orchestrator,
    host: Arc<dyn SchedulingHost>,
    pending: Mutex<Vec<Candidate>>,
    run_guard: tokio::sync::Mutex<()>,
    rescan: bool,
}

impl UploadScheduler {
    pub fn new(orchestrator: Orchestrator, host: Arc<dyn SchedulingHost>) -> Self {
        Self {
            orchestrator,
            host,
            pending: Mutex::new(Vec::new()),
            run_guard: tokio::sync::Mutex::new(()),
            rescan: false,
        }
    }

    /// Lets background wake-ups with an empty queue list the source themselves.
    pub fn with_rescan(mut self, rescan: bool) -> Self {
        self.rescan = rescan;
        self
    }

    /// Hands the background callback to the host. The callback only holds a
    /// weak reference, so dropping the scheduler turns wake-ups into no-ops.
    pub fn install(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.host.define(
            UPLOAD_TASK,
            Arc::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(scheduler) => scheduler.run_background().await,
                        None => FetchResult::NoData,
                    }
                })
            }),
        );
    }

    pub fn pending(&self) -> Vec<Candidate> {
        self.queue().clone()
    }

    /// Foreground path: queue the files, then run them right away.
    pub async fn submit(&self, files: Vec<Candidate>) -> RunReport {
        *self.queue() = files.clone();
        let ids = ids_of(&files);

        let _running = self.run_guard.lock().await;
        let report = self.orchestrator.run(files).await;
        if report.result.is_success() {
            self.clear_queue_if(&ids);
        }
        report
    }

    /// What the host calls on every wake-up.
    pub async fn run_background(&self) -> FetchResult {
        let Ok(_running) = self.run_guard.try_lock() else {
            info!("upload already running; skipping background wake-up");
            return FetchResult::NoData;
        };

        let queued = self.pending();
        let candidates = if !queued.is_empty() {
            queued.clone()
        } else if self.rescan {
            match self.orchestrator.source().list_candidates().await {
                Ok(candidates) => candidates,
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "background scan failed");
                    return FetchResult::Failed;
                }
            }
        } else {
            debug!("background wake-up with nothing queued");
            return FetchResult::NoData;
        };

        let files = self
            .orchestrator
            .records()
            .select_needing_upload(&candidates);
        info!(
            queued = queued.len(),
            candidates = candidates.len(),
            selected = files.len(),
            "background upload starting"
        );

        let report = self.orchestrator.run(files).await;
        if report.result.is_success() && !queued.is_empty() {
            self.clear_queue_if(&ids_of(&queued));
        }
        report.result
    }

    /// Registers the periodic task unless it already is. Returns whether a
    /// new registration was made.
    pub async fn register_periodic(&self, interval: Duration) -> Result<bool> {
        if self.host.is_registered(UPLOAD_TASK).await {
            debug!(task = UPLOAD_TASK, "background task already registered");
            return Ok(false);
        }
        self.host
            .register(UPLOAD_TASK, TaskOptions::every(interval))
            .await?;
        info!(
            task = UPLOAD_TASK,
            interval_secs = interval.as_secs(),
            "background task registered"
        );
        Ok(true)
    }

    pub async fn unregister_periodic(&self) -> Result<()> {
        if !self.host.is_registered(UPLOAD_TASK).await {
            return Ok(());
        }
        self.host.unregister(UPLOAD_TASK).await?;
        info!(task = UPLOAD_TASK, "background task unregistered");
        Ok(())
    }

    pub async fn status(&self) -> SchedulerStatus {
        let queued = self.queue().len();
        let running = self.run_guard.try_lock().is_err();
        SchedulerStatus {
            registered: self.host.is_registered(UPLOAD_TASK).await,
            queued,
            running,
        }
    }

    fn queue(&self) -> MutexGuard<'_, Vec<Candidate>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // A newer submission may have replaced the queue while this run was going.
    fn clear_queue_if(&self, ids: &[String]) {
        let mut queue = self.queue();
        if ids_of(&queue) == ids {
            queue.clear();
        }
    }
}

fn ids_of(files: &[Candidate]) -> Vec<String> {
    files.iter().map(|file| file.id.clone()).collect()
}
