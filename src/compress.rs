use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;

pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

#[async_trait]
pub trait Compressor: Send + Sync {
    /// Writes a compressed copy of `input` and returns where it landed.
    async fn compress(&self, asset_id: &str, input: &Path) -> Result<PathBuf>;

    /// Drops whatever `compress` staged for `asset_id`, if anything.
    fn discard(&self, asset_id: &str);
}

/// Gzips assets into a staging directory.
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    staging_dir: PathBuf,
    level: u32,
}

impl GzipCompressor {
    pub fn new(staging_dir: impl Into<PathBuf>, level: u32) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            level: level.min(9),
        }
    }

    fn staged_path(&self, asset_id: &str) -> PathBuf {
        self.staging_dir.join(format!("{asset_id}.gz"))
    }
}

#[async_trait]
impl Compressor for GzipCompressor {
    async fn compress(&self, asset_id: &str, input: &Path) -> Result<PathBuf> {
        let output = self.staged_path(asset_id);
        let input = input.to_path_buf();
        let level = Compression::new(self.level);
        let staged = output.clone();
        tokio::task::spawn_blocking(move || gzip_file(&input, &staged, level))
            .await
            .context("compression task failed")??;
        Ok(output)
    }

    fn discard(&self, asset_id: &str) {
        discard_staged(&self.staged_path(asset_id));
    }
}

fn gzip_file(input: &Path, output: &Path, level: Compression) -> Result<()> {
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let source = File::open(input).with_context(|| format!("failed to open {}", input.display()))?;
    let target =
        File::create(output).with_context(|| format!("failed to create {}", output.display()))?;

    let mut encoder = GzEncoder::new(BufWriter::new(target), level);
    io::copy(&mut BufReader::new(source), &mut encoder)
        .with_context(|| format!("failed to compress {}", input.display()))?;
    encoder
        .finish()
        .and_then(|mut writer| writer.flush())
        .with_context(|| format!("failed to finish {}", output.display()))?;
    Ok(())
}

/// Deletes a staged payload; a missing file is fine.
pub fn discard_staged(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::debug!(path = %path.display(), error = %err, "failed to remove staged payload");
        }
    }
}
