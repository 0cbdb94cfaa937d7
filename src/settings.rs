use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tracing::debug;

use crate::args::BaseArgs;
use crate::compress::{GzipCompressor, DEFAULT_COMPRESSION_LEVEL};
use crate::config::{self, Config};
use crate::engine::{Collaborators, EngineOptions, Orchestrator, DEFAULT_BATCH_SIZE};
use crate::scheduler::{interval_from_minutes, DEFAULT_INTERVAL_MINUTES};
use crate::source::{default_source_dir, DirectorySource};
use crate::store::{self, ProgressTracker, RecordStore, DEFAULT_MAX_RETRIES};
use crate::transport::{
    build_transport, Endpoint, TransportKind, DEFAULT_AUTH_HEADER, DEFAULT_FIELD_NAME,
    DEFAULT_MIME_TYPE, DEFAULT_UPLOAD_PATH,
};

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Everything a run needs, resolved as flag > env > local config > global
/// config > default. Env vars reach us through clap, so they arrive in
/// `BaseArgs` already.
#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub api_url: Option<String>,
    pub upload_path: String,
    pub guest_id: String,
    pub user_id: String,
    pub source_dir: Option<PathBuf>,
    pub state_dir: PathBuf,
    pub transport: TransportKind,
    pub batch_size: usize,
    pub max_retries: u32,
    pub compression_level: u32,
    pub interval: Duration,
    pub request_timeout: Duration,
}

impl UploadSettings {
    pub fn resolve(base: &BaseArgs) -> Result<Self> {
        let config = config::load()?;
        Self::from_sources(base, &config)
    }

    pub fn from_sources(base: &BaseArgs, config: &Config) -> Result<Self> {
        let layered = config.merge(&command_line_layer(base));
        let state_dir = match layered.state_dir.clone() {
            Some(dir) => dir,
            None => default_state_dir()?,
        };
        let batch_size = layered.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            bail!("batch size must be at least 1");
        }

        let settings = Self {
            api_url: layered.api_url,
            upload_path: layered
                .upload_path
                .unwrap_or_else(|| DEFAULT_UPLOAD_PATH.to_string()),
            guest_id: layered.guest_id.unwrap_or_default(),
            user_id: layered.user_id.unwrap_or_default(),
            source_dir: layered.source_dir.or_else(default_source_dir),
            state_dir,
            transport: layered.transport.unwrap_or_default(),
            batch_size,
            max_retries: layered.max_retries.unwrap_or(DEFAULT_MAX_RETRIES).max(1),
            compression_level: layered
                .compression_level
                .unwrap_or(DEFAULT_COMPRESSION_LEVEL)
                .min(9),
            interval: interval_from_minutes(
                layered.interval_minutes.unwrap_or(DEFAULT_INTERVAL_MINUTES),
            ),
            request_timeout: Duration::from_secs(
                layered
                    .request_timeout_secs
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS)
                    .max(1),
            ),
        };
        debug!(
            state_dir = %settings.state_dir.display(),
            transport = settings.transport.as_str(),
            batch_size = settings.batch_size,
            max_retries = settings.max_retries,
            "settings resolved"
        );
        Ok(settings)
    }

    /// The effective value of a config key, rendered the way `config set`
    /// accepts it. `None` means the setting has no value at all.
    pub fn field(&self, key: &str) -> Option<String> {
        let non_empty = |value: &str| (!value.is_empty()).then(|| value.to_string());
        match key {
            "api_url" => self.api_url.clone(),
            "upload_path" => Some(self.upload_path.clone()),
            "guest_id" => non_empty(&self.guest_id),
            "user_id" => non_empty(&self.user_id),
            "source_dir" => self.source_dir.as_ref().map(|dir| dir.display().to_string()),
            "state_dir" => Some(self.state_dir.display().to_string()),
            "transport" => Some(self.transport.as_str().to_string()),
            "batch_size" => Some(self.batch_size.to_string()),
            "max_retries" => Some(self.max_retries.to_string()),
            "compression_level" => Some(self.compression_level.to_string()),
            "interval_minutes" => Some((self.interval.as_secs() / 60).to_string()),
            "request_timeout_secs" => Some(self.request_timeout.as_secs().to_string()),
            _ => None,
        }
    }

    pub fn endpoint(&self) -> Result<Endpoint> {
        let base_url = self.api_url.clone().ok_or_else(|| {
            anyhow!(
                "no upload server configured. Set one with `shotup config set api_url <url>` or SHOTUP_API_URL."
            )
        })?;
        Ok(Endpoint {
            base_url,
            path: self.upload_path.clone(),
            auth_header: DEFAULT_AUTH_HEADER.to_string(),
            credential: self.guest_id.clone(),
            field_name: DEFAULT_FIELD_NAME.to_string(),
            mime_type: DEFAULT_MIME_TYPE.to_string(),
        })
    }

    pub fn source_dir(&self) -> Result<PathBuf> {
        self.source_dir.clone().ok_or_else(|| {
            anyhow!("no screenshot directory found. Pass --source-dir or set source_dir.")
        })
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.state_dir.join("staging")
    }

    pub fn open_store(&self) -> (Arc<RecordStore>, Arc<ProgressTracker>) {
        let (records, progress) = store::open(&self.state_dir, self.max_retries);
        (Arc::new(records), Arc::new(progress))
    }

    /// Wires the directory source, gzip compressor and configured transport
    /// into an orchestrator. Must be called inside the runtime.
    pub fn build_orchestrator(&self) -> Result<Orchestrator> {
        let source = DirectorySource::new(self.source_dir()?);
        let transport = build_transport(self.transport, self.endpoint()?, self.request_timeout)?;
        let (records, progress) = self.open_store();
        Ok(Orchestrator::new(
            Collaborators {
                source: Arc::new(source),
                compressor: Arc::new(GzipCompressor::new(
                    self.staging_dir(),
                    self.compression_level,
                )),
                transport,
            },
            records,
            progress,
            EngineOptions {
                batch_size: self.batch_size,
                user_id: self.user_id.clone(),
            },
        ))
    }
}

/// Flags and `SHOTUP_*` variables as one config layer. The interval is a
/// daemon flag and never comes from here.
pub fn command_line_layer(base: &BaseArgs) -> Config {
    Config {
        api_url: base.api_url.clone(),
        upload_path: base.upload_path.clone(),
        guest_id: base.guest_id.clone(),
        user_id: base.user_id.clone(),
        source_dir: base.source_dir.clone(),
        state_dir: base.state_dir.clone(),
        transport: base.transport,
        batch_size: base.batch_size,
        max_retries: base.max_retries,
        compression_level: base.compression_level,
        request_timeout_secs: base.request_timeout_secs,
        ..Default::default()
    }
}

pub fn default_state_dir() -> Result<PathBuf> {
    dirs::data_local_dir()
        .map(|dir| dir.join("shotup"))
        .ok_or_else(|| anyhow!("could not determine a data directory; pass --state-dir"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::testing::base_args as base;

    #[test]
    fn flags_beat_config_and_config_beats_defaults() {
        let config = Config {
            api_url: Some("https://config.example".into()),
            batch_size: Some(7),
            max_retries: Some(5),
            transport: Some(TransportKind::Binary),
            state_dir: Some(PathBuf::from("/var/lib/shotup")),
            ..Default::default()
        };
        let settings = UploadSettings::from_sources(
            &base(&["--api-url", "https://flag.example", "--batch-size", "3"]),
            &config,
        )
        .unwrap();

        assert_eq!(settings.api_url.as_deref(), Some("https://flag.example"));
        assert_eq!(settings.batch_size, 3);
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.transport, TransportKind::Binary);
        assert_eq!(settings.state_dir, PathBuf::from("/var/lib/shotup"));
        assert_eq!(settings.upload_path, DEFAULT_UPLOAD_PATH);
        assert_eq!(settings.compression_level, DEFAULT_COMPRESSION_LEVEL);
        assert_eq!(
            settings.request_timeout,
            Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)
        );
        assert_eq!(settings.interval, Duration::from_secs(15 * 60));
    }

    #[test]
    fn endpoint_requires_api_url() {
        let mut settings = UploadSettings::from_sources(
            &base(&["--state-dir", "/tmp/shotup-test"]),
            &Config::default(),
        )
        .unwrap();
        settings.api_url = None;
        let err = settings.endpoint().unwrap_err();
        assert!(err.to_string().contains("no upload server configured"));
    }

    #[test]
    fn endpoint_carries_guest_credential() {
        let config = Config {
            api_url: Some("https://api.example".into()),
            guest_id: Some("guest-42".into()),
            upload_path: Some("/v2/upload".into()),
            ..Default::default()
        };
        let settings =
            UploadSettings::from_sources(&base(&["--state-dir", "/tmp/s"]), &config).unwrap();
        let endpoint = settings.endpoint().unwrap();

        assert_eq!(endpoint.url(), "https://api.example/v2/upload");
        assert_eq!(endpoint.auth_header, DEFAULT_AUTH_HEADER);
        assert_eq!(endpoint.credential, "guest-42");
        assert_eq!(settings.staging_dir(), PathBuf::from("/tmp/s/staging"));
    }

    #[test]
    fn upload_path_flag_beats_config() {
        let config = Config {
            upload_path: Some("/from/config".into()),
            ..Default::default()
        };
        let settings = UploadSettings::from_sources(
            &base(&["--state-dir", "/tmp/s", "--upload-path", "/from/flag"]),
            &config,
        )
        .unwrap();
        assert_eq!(settings.upload_path, "/from/flag");
        assert_eq!(settings.field("upload_path").as_deref(), Some("/from/flag"));
    }

    #[test]
    fn field_renders_defaults_and_hides_empty_credentials() {
        let settings = UploadSettings::from_sources(
            &base(&["--state-dir", "/tmp/s", "--guest-id", ""]),
            &Config {
                interval_minutes: Some(30),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(settings.field("batch_size").as_deref(), Some("20"));
        assert_eq!(settings.field("max_retries").as_deref(), Some("3"));
        assert_eq!(settings.field("transport").as_deref(), Some("multipart"));
        assert_eq!(settings.field("interval_minutes").as_deref(), Some("30"));
        assert_eq!(settings.field("state_dir").as_deref(), Some("/tmp/s"));
        assert_eq!(settings.field("guest_id"), None);
        assert_eq!(settings.field("nope"), None);
    }

    #[test]
    fn huge_interval_does_not_overflow() {
        let config = Config {
            interval_minutes: Some(u64::MAX),
            state_dir: Some(PathBuf::from("/tmp/s")),
            ..Default::default()
        };
        let settings = UploadSettings::from_sources(&base(&[]), &config).unwrap();
        assert_eq!(
            settings.interval,
            interval_from_minutes(crate::scheduler::MAX_INTERVAL_MINUTES)
        );
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = Config {
            batch_size: Some(0),
            state_dir: Some(PathBuf::from("/tmp/s")),
            ..Default::default()
        };
        assert!(UploadSettings::from_sources(&base(&[]), &config).is_err());
    }
}
