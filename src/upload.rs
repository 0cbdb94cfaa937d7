use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;

use crate::args::BaseArgs;
use crate::engine::{FetchResult, RunReport};
use crate::error::RunFailure;
use crate::scheduler::{TokioHost, UploadScheduler};
use crate::settings::UploadSettings;
use crate::source::{modified_after, Access};
use crate::store::{ProgressTracker, UploadProgress};
use crate::ui::{bounded_bar, print_command_status, with_spinner, CommandStatus};
use crate::utils::pluralize;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Args)]
pub struct UploadArgs {
    /// Only consider the N most recent screenshots
    #[arg(long)]
    pub limit: Option<usize>,

    /// Only consider screenshots modified after this time (RFC 3339)
    #[arg(long, value_parser = parse_since)]
    pub since: Option<DateTime<Utc>>,

    /// Seconds to wait for the run before returning
    #[arg(long, default_value_t = 600)]
    pub wait_timeout: u64,
}

fn parse_since(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|err| format!("expected an RFC 3339 timestamp: {err}"))
}

#[derive(Debug)]
pub enum WaitOutcome {
    Finished(RunReport),
    TimedOut(Option<UploadProgress>),
}

pub async fn run(base: BaseArgs, args: UploadArgs) -> Result<()> {
    let settings = UploadSettings::resolve(&base)?;
    let orchestrator = settings.build_orchestrator()?;
    let source = Arc::clone(orchestrator.source());

    if let Access::Denied(reason) = source.check_access().await {
        return Err(RunFailure::PermissionDenied(reason).into());
    }

    let mut candidates = with_spinner("Scanning screenshots...", source.list_candidates())
        .await
        .context("failed to scan screenshots")?;
    if let Some(since) = args.since {
        candidates = modified_after(candidates, since);
    }
    if let Some(limit) = args.limit {
        candidates.truncate(limit);
    }

    let selected = orchestrator.records().select_needing_upload(&candidates);
    info!(
        scanned = candidates.len(),
        selected = selected.len(),
        "selected screenshots for upload"
    );
    if selected.is_empty() {
        if base.json {
            println!(
                "{}",
                json!({ "result": FetchResult::NoData.as_str(), "scanned": candidates.len(), "total": 0 })
            );
        } else {
            print_command_status(
                CommandStatus::Success,
                &format!(
                    "Nothing to upload ({} {} scanned)",
                    candidates.len(),
                    pluralize(&candidates.len(), "screenshot", None)
                ),
            );
        }
        return Ok(());
    }

    let total = selected.len();
    let progress = Arc::clone(orchestrator.progress());
    let scheduler = Arc::new(UploadScheduler::new(
        orchestrator,
        Arc::new(TokioHost::new()),
    ));
    let worker = tokio::spawn(async move { scheduler.submit(selected).await });

    let bar = bounded_bar(total as u64, "Uploading", "screenshots");
    let outcome = wait_for_run(
        worker,
        &progress,
        Duration::from_secs(args.wait_timeout),
        POLL_INTERVAL,
        |snapshot| bar.set_position(snapshot.current.min(total) as u64),
    )
    .await?;
    bar.finish_and_clear();

    match outcome {
        WaitOutcome::Finished(report) => report_finished(&base, &report),
        WaitOutcome::TimedOut(snapshot) => {
            report_timed_out(&base, total, snapshot.as_ref(), args.wait_timeout)
        }
    }
}

/// Polls the progress document until `worker` finishes or `timeout` passes.
/// Timing out leaves the worker running.
pub async fn wait_for_run(
    mut worker: JoinHandle<RunReport>,
    progress: &ProgressTracker,
    timeout: Duration,
    interval: Duration,
    mut on_tick: impl FnMut(&UploadProgress),
) -> Result<WaitOutcome> {
    let deadline = Instant::now() + timeout;
    loop {
        tokio::select! {
            joined = &mut worker => {
                let report = joined.context("upload task failed")?;
                return Ok(WaitOutcome::Finished(report));
            }
            _ = tokio::time::sleep(interval) => {}
        }
        let snapshot = progress.load();
        if let Some(snapshot) = &snapshot {
            on_tick(snapshot);
        }
        if Instant::now() >= deadline {
            return Ok(WaitOutcome::TimedOut(snapshot));
        }
    }
}

fn report_finished(base: &BaseArgs, report: &RunReport) -> Result<()> {
    if let Some(failure) = &report.failure {
        return Err(failure.clone().into());
    }

    if base.json {
        let failed: Vec<_> = report
            .failed
            .iter()
            .map(|f| json!({ "id": f.id, "filename": f.filename, "error": f.error }))
            .collect();
        println!(
            "{}",
            json!({
                "result": report.result.as_str(),
                "total": report.total,
                "succeeded": report.succeeded,
                "failed": failed,
                "elapsed_ms": report.elapsed_ms,
            })
        );
    } else {
        print_summary(report);
    }

    if report.result == FetchResult::Failed {
        bail!("no screenshots were uploaded");
    }
    Ok(())
}

/// "N of M succeeded" followed by each failure's last diagnostic.
pub fn print_summary(report: &RunReport) {
    let status = match (report.succeeded, report.failed.len()) {
        (_, 0) => CommandStatus::Success,
        (0, _) => CommandStatus::Error,
        _ => CommandStatus::Warning,
    };
    print_command_status(
        status,
        &format!(
            "{} of {} {} succeeded",
            report.succeeded,
            report.total,
            pluralize(&report.total, "upload", None)
        ),
    );
    for failed in &report.failed {
        eprintln!("  {}: {}", failed.filename, failed.error);
    }
}

fn report_timed_out(
    base: &BaseArgs,
    total: usize,
    snapshot: Option<&UploadProgress>,
    waited_secs: u64,
) -> Result<()> {
    let done = snapshot.map(|p| p.current).unwrap_or(0);
    if base.json {
        println!(
            "{}",
            json!({ "result": "timed_out", "total": total, "current": done, "waited_secs": waited_secs })
        );
    } else {
        print_command_status(
            CommandStatus::Warning,
            &format!(
                "Stopped waiting after {waited_secs}s with {done} of {total} processed. Unfinished screenshots will be retried on the next run."
            ),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonDocument;
    use tempfile::TempDir;

    fn report(succeeded: usize) -> RunReport {
        RunReport {
            result: FetchResult::NewData,
            total: succeeded,
            succeeded,
            failed: Vec::new(),
            failure: None,
            elapsed_ms: 0,
        }
    }

    fn tracker(tmp: &TempDir) -> ProgressTracker {
        ProgressTracker::new(JsonDocument::new(tmp.path().join("progress.json")))
    }

    #[test]
    fn since_accepts_rfc3339_only() {
        assert!(parse_since("2024-05-01T10:00:00+02:00").is_ok());
        assert!(parse_since("yesterday").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_worker_and_reports_progress() {
        let tmp = TempDir::new().unwrap();
        let progress = tracker(&tmp);
        progress.save(&UploadProgress {
            current: 1,
            total: 2,
            is_uploading: true,
            start_time: None,
        });
        let worker = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            report(2)
        });

        let mut ticks = Vec::new();
        let outcome = wait_for_run(
            worker,
            &progress,
            Duration::from_secs(10),
            POLL_INTERVAL,
            |snapshot| ticks.push(snapshot.current),
        )
        .await
        .unwrap();

        let WaitOutcome::Finished(report) = outcome else {
            panic!("expected the run to finish");
        };
        assert_eq!(report.succeeded, 2);
        assert_eq!(ticks, vec![1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_timeout_without_cancelling() {
        let tmp = TempDir::new().unwrap();
        let progress = tracker(&tmp);
        progress.save(&UploadProgress::started(4));
        let worker = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            report(4)
        });
        let abort = worker.abort_handle();

        let outcome = wait_for_run(
            worker,
            &progress,
            Duration::from_secs(2),
            POLL_INTERVAL,
            |_| {},
        )
        .await
        .unwrap();

        let WaitOutcome::TimedOut(Some(snapshot)) = outcome else {
            panic!("expected a timeout with a progress snapshot");
        };
        assert_eq!(snapshot.total, 4);
        assert!(!abort.is_finished());
    }
}
