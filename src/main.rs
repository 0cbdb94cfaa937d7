use anyhow::Result;
use clap::{Parser, Subcommand};
use std::ffi::OsString;
use tracing_subscriber::EnvFilter;

mod args;
mod compress;
mod config;
mod daemon;
mod engine;
mod env;
mod error;
mod reset;
mod scheduler;
mod settings;
mod source;
mod status;
mod store;
mod transport;
mod ui;
mod upload;
mod utils;

use crate::args::CLIArgs;

const DEFAULT_DEV_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-dev");
const CLI_VERSION: &str = match option_env!("SHOTUP_VERSION_STRING") {
    Some(version) => version,
    None => DEFAULT_DEV_VERSION,
};

#[derive(Debug, Parser)]
#[command(
    name = "shotup",
    about = "Upload screenshots in resumable batches",
    version = CLI_VERSION
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upload screenshots that have not been uploaded yet
    Upload(CLIArgs<upload::UploadArgs>),
    /// Show upload records and the last run's progress
    Status(CLIArgs<status::StatusArgs>),
    /// Forget every upload record
    Reset(CLIArgs<reset::ResetArgs>),
    /// Keep uploading new screenshots on a schedule
    Daemon(CLIArgs<daemon::DaemonArgs>),
    /// View and change configuration
    Config(CLIArgs<config::ConfigArgs>),
}

impl Commands {
    fn verbosity(&self) -> u8 {
        match self {
            Commands::Upload(cmd) => cmd.base.verbose,
            Commands::Status(cmd) => cmd.base.verbose,
            Commands::Reset(cmd) => cmd.base.verbose,
            Commands::Daemon(cmd) => cmd.base.verbose,
            Commands::Config(cmd) => cmd.base.verbose,
        }
    }
}

fn init_tracing(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        EnvFilter::new(format!("shotup={level}"))
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let argv: Vec<OsString> = std::env::args_os().collect();
    env::bootstrap_from_args(&argv)?;
    let cli = Cli::parse_from(argv);
    init_tracing(cli.command.verbosity());

    match cli.command {
        Commands::Upload(cmd) => upload::run(cmd.base, cmd.args).await?,
        Commands::Status(cmd) => status::run(cmd.base, cmd.args).await?,
        Commands::Reset(cmd) => reset::run(cmd.base, cmd.args).await?,
        Commands::Daemon(cmd) => daemon::run(cmd.base, cmd.args).await?,
        Commands::Config(cmd) => config::run(cmd.base, cmd.args)?,
    }

    Ok(())
}
