use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Subcommand, ValueEnum};
use std::{
    env, fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::args::BaseArgs;
use crate::scheduler::MAX_INTERVAL_MINUTES;
use crate::transport::TransportKind;
use crate::ui::{print_command_status, CommandStatus};

mod get;
mod list;
mod set;

pub const LOCAL_DIR: &str = ".shotup";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_level: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_minutes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub const KNOWN_KEYS: &[&str] = &[
    "api_url",
    "upload_path",
    "guest_id",
    "user_id",
    "source_dir",
    "state_dir",
    "transport",
    "batch_size",
    "max_retries",
    "compression_level",
    "interval_minutes",
    "request_timeout_secs",
];

impl Config {
    pub fn get_field(&self, key: &str) -> Option<String> {
        match key {
            "api_url" => self.api_url.clone(),
            "upload_path" => self.upload_path.clone(),
            "guest_id" => self.guest_id.clone(),
            "user_id" => self.user_id.clone(),
            "source_dir" => self.source_dir.as_ref().map(|p| p.display().to_string()),
            "state_dir" => self.state_dir.as_ref().map(|p| p.display().to_string()),
            "transport" => self.transport.map(|t| t.as_str().to_string()),
            "batch_size" => self.batch_size.map(|v| v.to_string()),
            "max_retries" => self.max_retries.map(|v| v.to_string()),
            "compression_level" => self.compression_level.map(|v| v.to_string()),
            "interval_minutes" => self.interval_minutes.map(|v| v.to_string()),
            "request_timeout_secs" => self.request_timeout_secs.map(|v| v.to_string()),
            _ => None,
        }
    }

    /// Parses `value` for `key` and stores it. Numeric keys are range checked.
    pub fn set_field(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "api_url" => self.api_url = Some(value.to_string()),
            "upload_path" => self.upload_path = Some(value.to_string()),
            "guest_id" => self.guest_id = Some(value.to_string()),
            "user_id" => self.user_id = Some(value.to_string()),
            "source_dir" => self.source_dir = Some(PathBuf::from(value)),
            "state_dir" => self.state_dir = Some(PathBuf::from(value)),
            "transport" => {
                let kind = TransportKind::from_str(value, true).map_err(|_| {
                    anyhow!("invalid transport '{value}' (expected multipart or binary)")
                })?;
                self.transport = Some(kind);
            }
            "batch_size" => self.batch_size = Some(parse_at_least(key, value, 1)?),
            "max_retries" => self.max_retries = Some(parse_at_least(key, value, 1)?),
            "compression_level" => {
                let level: u32 = parse_number(key, value)?;
                if level > 9 {
                    bail!("compression_level must be between 0 and 9");
                }
                self.compression_level = Some(level);
            }
            "interval_minutes" => {
                let minutes = parse_at_least(key, value, 1)?;
                if minutes > MAX_INTERVAL_MINUTES {
                    bail!("interval_minutes must be at most {MAX_INTERVAL_MINUTES}");
                }
                self.interval_minutes = Some(minutes);
            }
            "request_timeout_secs" => {
                self.request_timeout_secs = Some(parse_at_least(key, value, 1)?)
            }
            _ => bail!("unknown config key: {key}"),
        }
        Ok(())
    }

    pub fn unset_field(&mut self, key: &str) -> bool {
        match key {
            "api_url" => self.api_url = None,
            "upload_path" => self.upload_path = None,
            "guest_id" => self.guest_id = None,
            "user_id" => self.user_id = None,
            "source_dir" => self.source_dir = None,
            "state_dir" => self.state_dir = None,
            "transport" => self.transport = None,
            "batch_size" => self.batch_size = None,
            "max_retries" => self.max_retries = None,
            "compression_level" => self.compression_level = None,
            "interval_minutes" => self.interval_minutes = None,
            "request_timeout_secs" => self.request_timeout_secs = None,
            _ => return false,
        }
        true
    }

    pub fn non_empty_fields(&self) -> Vec<(&'static str, String)> {
        KNOWN_KEYS
            .iter()
            .filter_map(|&key| self.get_field(key).map(|v| (key, v)))
            .collect()
    }

    /// Layers `other` on top of `self`.
    pub fn merge(&self, other: &Config) -> Config {
        let mut extra = self.extra.clone();
        extra.extend(other.extra.clone());
        Config {
            api_url: other.api_url.clone().or_else(|| self.api_url.clone()),
            upload_path: other.upload_path.clone().or_else(|| self.upload_path.clone()),
            guest_id: other.guest_id.clone().or_else(|| self.guest_id.clone()),
            user_id: other.user_id.clone().or_else(|| self.user_id.clone()),
            source_dir: other.source_dir.clone().or_else(|| self.source_dir.clone()),
            state_dir: other.state_dir.clone().or_else(|| self.state_dir.clone()),
            transport: other.transport.or(self.transport),
            batch_size: other.batch_size.or(self.batch_size),
            max_retries: other.max_retries.or(self.max_retries),
            compression_level: other.compression_level.or(self.compression_level),
            interval_minutes: other.interval_minutes.or(self.interval_minutes),
            request_timeout_secs: other.request_timeout_secs.or(self.request_timeout_secs),
            extra,
        }
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid value for {key}: '{value}'"))
}

fn parse_at_least<T>(key: &str, value: &str, min: T) -> Result<T>
where
    T: FromStr + PartialOrd + std::fmt::Display,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let parsed: T = parse_number(key, value)?;
    if parsed < min {
        bail!("{key} must be at least {min}");
    }
    Ok(parsed)
}

pub fn global_config_dir() -> Result<PathBuf> {
    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg).join("shotup"));
    }
    dirs::home_dir()
        .map(|path| path.join(".config").join("shotup"))
        .ok_or_else(|| anyhow!("$HOME not configured."))
}

pub fn global_path() -> Result<PathBuf> {
    Ok(global_config_dir()?.join("config.json"))
}

pub fn load_file(path: &Path) -> Config {
    let file_contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Config::default(),
        Err(e) => {
            print_command_status(
                CommandStatus::Error,
                &format!("Warning: could not read {}: {e}", path.display()),
            );
            return Config::default();
        }
    };

    let config: Config = match serde_json::from_str(&file_contents) {
        Ok(c) => c,
        Err(e) => {
            print_command_status(
                CommandStatus::Error,
                &format!("Warning: could not read {}: {e}", path.display()),
            );
            return Config::default();
        }
    };

    for key in config.extra.keys() {
        print_command_status(
            CommandStatus::Warning,
            &format!("Warning: unknown config key {} in {}", key, path.display()),
        );
    }

    config
}

pub fn load_global() -> Result<Config> {
    Ok(load_file(&global_path()?))
}

pub fn load() -> Result<Config> {
    let global = load_global().unwrap_or_default();
    let local = match local_path() {
        Some(p) => load_file(&p),
        None => Config::default(),
    };
    Ok(global.merge(&local))
}

pub fn save_file(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(config)?;
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)?;
    file.write_all(json.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;

    Ok(())
}

pub fn find_local_config_dir() -> Option<PathBuf> {
    let home = dirs::home_dir();
    let mut current_dir = std::env::current_dir().ok()?;

    loop {
        if current_dir.join(LOCAL_DIR).is_dir() {
            return Some(current_dir.join(LOCAL_DIR));
        }
        if current_dir.join(".git").exists() {
            return None;
        }
        if Some(&current_dir) == home.as_ref() {
            return None;
        }
        if !current_dir.pop() {
            return None;
        }
    }
}

pub fn local_path() -> Option<PathBuf> {
    find_local_config_dir().map(|dir| dir.join("config.json"))
}

/// Resolve which config file to write based on --global/--local flags.
/// `--local` without an existing `.shotup` directory starts one in the cwd.
pub fn resolve_write_path(global: bool, local: bool) -> Result<PathBuf> {
    if global {
        return global_path();
    }
    match local_path() {
        Some(p) => Ok(p),
        None if local => Ok(std::env::current_dir()
            .context("failed to read current directory")?
            .join(LOCAL_DIR)
            .join("config.json")),
        None => global_path(),
    }
}

// --- CLI commands ---

#[derive(Debug, Clone, Args)]
pub struct ScopeArgs {
    /// Apply to global config (~/.config/shotup/config.json)
    #[arg(long, short = 'g', conflicts_with = "local")]
    global: bool,

    /// Apply to local config (.shotup/config.json)
    #[arg(long, short = 'l')]
    local: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommands>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommands {
    /// List config values
    List {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Show config values grouped by source
        #[arg(long)]
        verbose: bool,
    },
    /// Get a config value
    Get {
        /// Config key (api_url, guest_id, source_dir, batch_size, ...)
        key: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Set a config value
    Set {
        /// Config key (api_url, guest_id, source_dir, batch_size, ...)
        key: String,
        /// Value to set
        value: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Remove a config value
    Unset {
        /// Config key (api_url, guest_id, source_dir, batch_size, ...)
        key: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
}

fn validate_key(key: &str) -> Result<()> {
    if !KNOWN_KEYS.contains(&key) {
        bail!(
            "Unknown config key: {key}\nValid keys: {}",
            KNOWN_KEYS.join(", ")
        );
    }
    Ok(())
}

pub fn run(base: BaseArgs, args: ConfigArgs) -> Result<()> {
    match args.command {
        None => list::run(base, false, false, false),
        Some(ConfigCommands::List { scope, verbose }) => {
            list::run(base, scope.global, scope.local, verbose)
        }
        Some(ConfigCommands::Get { key, scope }) => {
            validate_key(&key)?;
            get::run(base, &key, scope.global, scope.local)
        }
        Some(ConfigCommands::Set { key, value, scope }) => {
            validate_key(&key)?;
            set::run(&key, &value, scope.global, scope.local)
        }
        Some(ConfigCommands::Unset { key, scope }) => {
            validate_key(&key)?;
            set::unset(&key, scope.global, scope.local)
        }
    }
}
