use std::path::PathBuf;

use clap::Args;

use crate::transport::TransportKind;

#[derive(Debug, Clone, Args)]
pub struct BaseArgs {
    /// Output as JSON
    #[arg(short = 'j', long, global = true)]
    pub json: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Upload server base URL (or via SHOTUP_API_URL)
    #[arg(long, env = "SHOTUP_API_URL", hide_env_values = true, global = true)]
    pub api_url: Option<String>,

    /// Path of the upload resource on the server (or via SHOTUP_UPLOAD_PATH)
    #[arg(long, env = "SHOTUP_UPLOAD_PATH", global = true)]
    pub upload_path: Option<String>,

    /// Credential sent in the X-Guest-Id header (or via SHOTUP_GUEST_ID)
    #[arg(long, env = "SHOTUP_GUEST_ID", hide_env_values = true, global = true)]
    pub guest_id: Option<String>,

    /// User id attached to every upload (or via SHOTUP_USER_ID)
    #[arg(long, env = "SHOTUP_USER_ID", global = true)]
    pub user_id: Option<String>,

    /// Directory to scan for screenshots (or via SHOTUP_SOURCE_DIR)
    #[arg(long, env = "SHOTUP_SOURCE_DIR", global = true)]
    pub source_dir: Option<PathBuf>,

    /// Where upload records and progress are kept (or via SHOTUP_STATE_DIR)
    #[arg(long, env = "SHOTUP_STATE_DIR", global = true)]
    pub state_dir: Option<PathBuf>,

    /// Wire format for uploads (or via SHOTUP_TRANSPORT)
    #[arg(long, env = "SHOTUP_TRANSPORT", value_enum, global = true)]
    pub transport: Option<TransportKind>,

    /// Files per batch (or via SHOTUP_BATCH_SIZE)
    #[arg(long, env = "SHOTUP_BATCH_SIZE", global = true)]
    pub batch_size: Option<usize>,

    /// Failed attempts before an asset is given up on (or via SHOTUP_MAX_RETRIES)
    #[arg(long, env = "SHOTUP_MAX_RETRIES", value_parser = clap::value_parser!(u32).range(1..), global = true)]
    pub max_retries: Option<u32>,

    /// Gzip level 0-9 for staged payloads (or via SHOTUP_COMPRESSION_LEVEL)
    #[arg(long, env = "SHOTUP_COMPRESSION_LEVEL", value_parser = clap::value_parser!(u32).range(0..=9), global = true)]
    pub compression_level: Option<u32>,

    /// Per-request timeout in seconds (or via SHOTUP_REQUEST_TIMEOUT_SECS)
    #[arg(long, env = "SHOTUP_REQUEST_TIMEOUT_SECS", value_parser = clap::value_parser!(u64).range(1..), global = true)]
    pub request_timeout_secs: Option<u64>,

    /// Path to a .env file to load before running commands.
    #[arg(long, env = "SHOTUP_ENV_FILE", hide_env_values = true)]
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct CLIArgs<T: Args> {
    #[command(flatten)]
    pub base: BaseArgs,

    #[command(flatten)]
    pub args: T,
}


#[cfg(test)]
mod tests {
    use super::testing::{base_args, try_base_args};

    #[test]
    fn retry_ceiling_and_timeout_must_be_positive() {
        assert!(try_base_args(&["--max-retries", "0"]).is_err());
        assert!(try_base_args(&["--request-timeout-secs", "0"]).is_err());
        assert_eq!(base_args(&["--max-retries", "5"]).max_retries, Some(5));
    }

    #[test]
    fn upload_path_has_a_flag() {
        let base = base_args(&["--upload-path", "/v2/shots"]);
        assert_eq!(base.upload_path.as_deref(), Some("/v2/shots"));
    }
}
