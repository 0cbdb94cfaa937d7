use anyhow::{bail, Result};
use clap::Args;
use dialoguer::Confirm;
use serde_json::json;

use crate::args::BaseArgs;
use crate::settings::UploadSettings;
use crate::ui::{is_interactive, print_command_status, CommandStatus};
use crate::utils::pluralize;

#[derive(Debug, Clone, Args)]
pub struct ResetArgs {
    /// Skip the confirmation prompt
    #[arg(long, short = 'f')]
    force: bool,
}

pub async fn run(base: BaseArgs, args: ResetArgs) -> Result<()> {
    let settings = UploadSettings::resolve(&base)?;
    let (records, progress) = settings.open_store();
    let total = records.stats().total;

    if !args.force {
        if !is_interactive() {
            bail!("refusing to clear upload history without --force in non-interactive mode");
        }
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Forget {total} upload {}? Every screenshot will be uploaded again.",
                pluralize(&total, "record", None)
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            print_command_status(CommandStatus::Warning, "Reset cancelled");
            return Ok(());
        }
    }

    records.clear_all();
    progress.clear();

    if base.json {
        println!("{}", json!({ "cleared": total }));
    } else {
        print_command_status(
            CommandStatus::Success,
            &format!(
                "Cleared {total} upload {}",
                pluralize(&total, "record", None)
            ),
        );
    }
    Ok(())
}
