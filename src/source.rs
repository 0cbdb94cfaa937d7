use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use glob::MatchOptions;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::store::AssetKey;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "heic", "webp"];
const SCREENSHOT_DIR_NAMES: &[&str] = &[
    "screenshots",
    "screenshot",
    "screen shots",
    "screen captures",
];

/// One asset offered for upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub locator: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

impl AssetKey for Candidate {
    fn asset_id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Granted,
    Denied(String),
}

#[async_trait]
pub trait AssetSource: Send + Sync {
    /// Whether the library can be read at all right now.
    async fn check_access(&self) -> Access;

    async fn list_candidates(&self) -> Result<Vec<Candidate>>;

    /// Maps a candidate to a path that can be read directly.
    async fn resolve(&self, candidate: &Candidate) -> Result<PathBuf>;
}

/// Image files sitting directly inside one directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl AssetSource for DirectorySource {
    async fn check_access(&self) -> Access {
        match tokio::fs::read_dir(&self.root).await {
            Ok(_) => Access::Granted,
            Err(err) => Access::Denied(format!("{}: {err}", self.root.display())),
        }
    }

    async fn list_candidates(&self) -> Result<Vec<Candidate>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || scan_directory(&root))
            .await
            .context("directory scan task failed")?
    }

    async fn resolve(&self, candidate: &Candidate) -> Result<PathBuf> {
        let path = tokio::fs::canonicalize(&candidate.locator)
            .await
            .with_context(|| {
                format!(
                    "{} is no longer available at {}",
                    candidate.filename, candidate.locator
                )
            })?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?;
        if !metadata.is_file() {
            bail!("{} is not a regular file", path.display());
        }
        Ok(path)
    }
}

fn scan_directory(root: &Path) -> Result<Vec<Candidate>> {
    let root_str = root
        .to_str()
        .ok_or_else(|| anyhow!("source directory is not valid UTF-8: {}", root.display()))?;
    let options = MatchOptions {
        case_sensitive: false,
        require_literal_separator: true,
        require_literal_leading_dot: true,
    };

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for ext in IMAGE_EXTENSIONS {
        let pattern = format!("{}/*.{ext}", glob::Pattern::escape(root_str));
        let entries = glob::glob_with(&pattern, options)
            .with_context(|| format!("invalid scan pattern {pattern}"))?;
        for entry in entries {
            let path = match entry {
                Ok(path) => path,
                Err(err) => {
                    warn!(error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if !seen.insert(path.clone()) {
                continue;
            }
            match describe_file(&path) {
                Ok(Some(candidate)) => candidates.push(candidate),
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %format!("{err:#}"), "skipping file")
                }
            }
        }
    }

    candidates.sort_by(|a, b| {
        b.modified
            .cmp(&a.modified)
            .then_with(|| a.filename.cmp(&b.filename))
    });
    debug!(root = %root.display(), count = candidates.len(), "scanned source directory");
    Ok(candidates)
}

fn describe_file(path: &Path) -> Result<Option<Candidate>> {
    let metadata =
        fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
    if !metadata.is_file() {
        return Ok(None);
    }
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let modified = metadata.modified().ok().map(DateTime::<Utc>::from);

    Ok(Some(Candidate {
        id: content_id(path)?,
        locator: path.to_string_lossy().to_string(),
        filename,
        modified,
    }))
}

/// Hex SHA-256 of the file contents; survives renames and moves.
pub fn content_id(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Keeps candidates modified strictly after `since`. Unknown times are kept.
pub fn modified_after(candidates: Vec<Candidate>, since: DateTime<Utc>) -> Vec<Candidate> {
    candidates
        .into_iter()
        .filter(|candidate| candidate.modified.is_none_or(|modified| modified > since))
        .collect()
}

/// Best guess at where the OS drops screenshots.
pub fn default_source_dir() -> Option<PathBuf> {
    let pictures =
        dirs::picture_dir().or_else(|| dirs::home_dir().map(|home| home.join("Pictures")))?;
    if let Ok(entries) = fs::read_dir(&pictures) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_lowercase();
            if entry.path().is_dir() && SCREENSHOT_DIR_NAMES.contains(&name.as_str()) {
                return Some(entry.path());
            }
        }
    }
    Some(pictures.join("Screenshots"))
}
