use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use comfy_table::Cell;
use serde::Serialize;

use crate::args::BaseArgs;
use crate::settings::UploadSettings;
use crate::store::{UploadProgress, UploadRecord, UploadStats, UploadStatus};
use crate::ui::{apply_column_padding, header, styled_table, truncate};

const MAX_ERROR_WIDTH: usize = 60;

#[derive(Debug, Clone, Args)]
pub struct StatusArgs {
    /// List every upload record
    #[arg(long)]
    records: bool,

    /// Only list failed records (implies --records)
    #[arg(long)]
    failed: bool,

    /// Show the record for a single asset id
    #[arg(long, value_name = "ID", conflicts_with_all = ["records", "failed"])]
    id: Option<String>,
}

#[derive(Serialize)]
struct StatusOutput<'a> {
    state_dir: String,
    stats: &'a UploadStats,
    progress: Option<&'a UploadProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    records: Option<Vec<&'a UploadRecord>>,
}

pub async fn run(base: BaseArgs, args: StatusArgs) -> Result<()> {
    let settings = UploadSettings::resolve(&base)?;
    let (records, progress) = settings.open_store();

    if let Some(id) = &args.id {
        let Some(record) = records.get_status(id) else {
            bail!("no upload record for {id}");
        };
        if base.json {
            println!("{}", serde_json::to_string_pretty(&record)?);
        } else {
            println!("{}", describe_record(&record));
        }
        return Ok(());
    }

    let stats = records.stats();
    let last_run = progress.load();
    let mut all = records.all();
    all.sort_by(|a, b| latest_activity(b).cmp(&latest_activity(a)));

    let listed: Option<Vec<&UploadRecord>> = (args.records || args.failed).then(|| {
        all.iter()
            .filter(|record| !args.failed || record.status == UploadStatus::Failed)
            .collect()
    });

    if base.json {
        let output = StatusOutput {
            state_dir: settings.state_dir.display().to_string(),
            stats: &stats,
            progress: last_run.as_ref(),
            records: listed,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("state: {}", settings.state_dir.display());
    println!(
        "records: {} total, {} uploaded, {} failed after {} attempts, {} pending",
        stats.total,
        stats.success,
        stats.failed,
        records.max_retries(),
        stats.pending
    );
    match &last_run {
        Some(run) => println!("last run: {}", describe_progress(run)),
        None => println!("last run: (none)"),
    }

    if let Some(listed) = listed {
        if listed.is_empty() {
            println!("\nNo matching records.");
        } else {
            println!("\n{}", records_table(&listed));
        }
    }
    Ok(())
}

fn latest_activity(record: &UploadRecord) -> Option<DateTime<Utc>> {
    record.uploaded_at.max(record.last_attempt)
}

fn describe_progress(progress: &UploadProgress) -> String {
    let state = if progress.is_uploading {
        "in progress"
    } else {
        "finished"
    };
    let started = progress
        .start_time
        .map(|time| format!(", started {}", time.format("%Y-%m-%d %H:%M:%S UTC")))
        .unwrap_or_default();
    format!(
        "{state}, {} of {}{started}",
        progress.current, progress.total
    )
}

fn describe_record(record: &UploadRecord) -> String {
    let mut lines = vec![
        format!("id: {}", record.id),
        format!("file: {}", record.filename),
        format!("path: {}", record.uri),
        format!("status: {}", record.status.as_str()),
        format!("retries: {}", record.retry_count),
    ];
    let stamp = |time: DateTime<Utc>| time.format("%Y-%m-%d %H:%M:%S UTC").to_string();
    if let Some(time) = record.last_attempt {
        lines.push(format!("last attempt: {}", stamp(time)));
    }
    if let Some(time) = record.uploaded_at {
        lines.push(format!("uploaded: {}", stamp(time)));
    }
    if let Some(error) = &record.error {
        lines.push(format!("error: {error}"));
    }
    lines.join("\n")
}

fn records_table(records: &[&UploadRecord]) -> String {
    let mut table = styled_table();
    table.set_header(vec![
        header("File"),
        header("Status"),
        header("Retries"),
        header("Last activity"),
        header("Error"),
    ]);
    apply_column_padding(&mut table, (0, 2));
    for record in records {
        table.add_row(vec![
            Cell::new(&record.filename),
            Cell::new(record.status.as_str()),
            Cell::new(record.retry_count),
            Cell::new(
                latest_activity(record)
                    .map(|time| time.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default(),
            ),
            Cell::new(truncate(
                record.error.as_deref().unwrap_or_default(),
                MAX_ERROR_WIDTH,
            )),
        ]);
    }
    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_description_mentions_counts() {
        let progress = UploadProgress {
            current: 3,
            total: 5,
            is_uploading: false,
            start_time: None,
        };
        assert_eq!(describe_progress(&progress), "finished, 3 of 5");
    }

    #[test]
    fn single_record_shows_only_known_fields() {
        let record = UploadRecord {
            id: "abc".into(),
            filename: "shot.png".into(),
            uri: "/shots/shot.png".into(),
            status: UploadStatus::Success,
            retry_count: 1,
            last_attempt: None,
            uploaded_at: Some(DateTime::from_timestamp(0, 0).unwrap()),
            error: None,
        };
        let rendered = describe_record(&record);
        assert!(rendered.contains("status: success"));
        assert!(rendered.contains("uploaded: 1970-01-01 00:00:00 UTC"));
        assert!(!rendered.contains("last attempt"));
        assert!(!rendered.contains("error"));
    }

    #[test]
    fn table_lists_failed_record_error() {
        let record = UploadRecord {
            id: "abc".into(),
            filename: "shot.png".into(),
            uri: "/shots/shot.png".into(),
            status: UploadStatus::Failed,
            retry_count: 2,
            last_attempt: None,
            uploaded_at: None,
            error: Some("server responded 500: boom".into()),
        };
        let rendered = records_table(&[&record]);
        assert!(rendered.contains("shot.png"));
        assert!(rendered.contains("failed"));
        assert!(rendered.contains("server responded 500: boom"));
    }
}
