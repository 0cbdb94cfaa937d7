use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, warn};

use crate::args::BaseArgs;
use crate::engine::RunReport;
use crate::scheduler::{
    interval_from_minutes, TokioHost, UploadScheduler, MAX_INTERVAL_MINUTES,
};
use crate::settings::UploadSettings;
use crate::ui::{print_command_status, CommandStatus};
use crate::upload::print_summary;
use crate::utils::pluralize;

#[derive(Debug, Clone, Args)]
pub struct DaemonArgs {
    /// Minutes between background runs (or via SHOTUP_INTERVAL_MINUTES)
    #[arg(
        long,
        env = "SHOTUP_INTERVAL_MINUTES",
        value_parser = clap::value_parser!(u64).range(1..=MAX_INTERVAL_MINUTES)
    )]
    interval_minutes: Option<u64>,

    /// Upload pending screenshots right away instead of waiting for the first interval
    #[arg(long)]
    now: bool,

    /// Leave the background task registered on exit
    #[arg(long)]
    keep_registered: bool,
}

pub async fn run(base: BaseArgs, args: DaemonArgs) -> Result<()> {
    let settings = UploadSettings::resolve(&base)?;
    let interval = args
        .interval_minutes
        .map(interval_from_minutes)
        .unwrap_or(settings.interval);

    let orchestrator = settings.build_orchestrator()?;
    let scheduler = Arc::new(
        UploadScheduler::new(orchestrator.clone(), Arc::new(TokioHost::new())).with_rescan(true),
    );
    scheduler.install();
    scheduler.register_periodic(interval).await?;

    let minutes = (interval.as_secs() / 60) as usize;
    print_command_status(
        CommandStatus::Success,
        &format!(
            "Watching {} every {minutes} {}. Press Ctrl-C to stop.",
            settings.source_dir()?.display(),
            pluralize(&minutes, "minute", None)
        ),
    );

    if args.now {
        let candidates = orchestrator
            .source()
            .list_candidates()
            .await
            .context("failed to scan screenshots")?;
        let files = orchestrator.records().select_needing_upload(&candidates);
        let report = scheduler.submit(files).await;
        report_immediate_run(&report);
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    let status = scheduler.status().await;
    if status.running {
        print_command_status(
            CommandStatus::Warning,
            "An upload was still running; unfinished screenshots will be retried next time.",
        );
    }
    if args.keep_registered {
        info!("leaving background task registered");
    } else if let Err(err) = scheduler.unregister_periodic().await {
        warn!(error = %format!("{err:#}"), "failed to unregister background task");
    }
    print_command_status(CommandStatus::Success, "Stopped");
    Ok(())
}

fn report_immediate_run(report: &RunReport) {
    if let Some(failure) = &report.failure {
        print_command_status(CommandStatus::Error, &failure.to_string());
    } else if report.total == 0 {
        print_command_status(CommandStatus::Success, "Nothing to upload");
    } else {
        print_summary(report);
    }
}
