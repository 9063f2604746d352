//! Model weight downloader
//!
//! Streams a weight file into `MODEL_DIR` through a `.part` file, then
//! renames it into place. A failed download leaves nothing behind.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::{ManagerError, ManagerResult};
use crate::model_runtime::FormatDetector;

const PROGRESS_STEP_BYTES: u64 = 100 * 1024 * 1024;
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(3600);

/// Makes a client-supplied name safe to use as a single file under the
/// model directory.
pub fn sanitize_local_filename(filename: &str) -> Result<String, String> {
    let trimmed = filename.trim();
    let no_query = trimmed.split('?').next().unwrap_or(trimmed);
    let no_fragment = no_query.split('#').next().unwrap_or(no_query);
    let flattened = no_fragment
        .trim_start_matches(|c: char| c == '/' || c == '.')
        .replace('\\', "/")
        .replace('/', "__");

    let mut sanitized: String = flattened
        .chars()
        .map(|ch| {
            if matches!(ch, '<' | '>' | ':' | '"' | '|' | '?' | '*') || ch.is_control() {
                '_'
            } else {
                ch
            }
        })
        .collect();
    while sanitized.ends_with('.') || sanitized.ends_with(' ') {
        sanitized.pop();
    }

    if sanitized.is_empty() {
        return Err(format!("Invalid model filename: {:?}", filename));
    }
    Ok(sanitized)
}

pub struct ModelDownloader {
    client: reqwest::Client,
    model_dir: PathBuf,
}

impl ModelDownloader {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(DOWNLOAD_TIMEOUT)
                .build()
                .unwrap_or_default(),
            model_dir: model_dir.into(),
        }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// Explicit name if given, else the last URL segment, else
    /// `{model_id}.gguf` when the segment is empty or carries a query.
    pub fn resolve_file_name(model_id: &str, url: &str, file_name: Option<&str>) -> ManagerResult<String> {
        let candidate = match file_name.map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) => name.to_string(),
            None => {
                let segment = url.rsplit('/').next().unwrap_or_default();
                if segment.is_empty() || segment.contains('?') || segment.contains(':') {
                    format!("{}.gguf", model_id)
                } else {
                    segment.to_string()
                }
            }
        };
        sanitize_local_filename(&candidate).map_err(ManagerError::InvalidRequest)
    }

    /// Downloads `url` to `file_name` under the model directory.
    pub async fn download(&self, url: &str, file_name: &str) -> ManagerResult<PathBuf> {
        let file_name = sanitize_local_filename(file_name).map_err(ManagerError::InvalidRequest)?;
        fs::create_dir_all(&self.model_dir)
            .await
            .with_context(|| format!("Failed to create model dir {}", self.model_dir.display()))?;

        let target = self.model_dir.join(&file_name);
        let part = self.model_dir.join(format!("{}.part", file_name));

        info!("Downloading model from {} to {}", url, target.display());
        let result = self.fetch_to(url, &part).await.and_then(|bytes| {
            if file_name.to_lowercase().ends_with(".gguf") && !FormatDetector::has_gguf_magic(&part)? {
                anyhow::bail!("downloaded file is not a valid GGUF file (missing GGUF magic)");
            }
            Ok(bytes)
        });

        match result {
            Ok(bytes) => {
                fs::rename(&part, &target)
                    .await
                    .with_context(|| format!("Failed to move download into {}", target.display()))?;
                info!(
                    "Model download complete: {} ({:.2} MB)",
                    target.display(),
                    bytes as f64 / (1024.0 * 1024.0)
                );
                Ok(target)
            }
            Err(e) => {
                if let Err(rm) = fs::remove_file(&part).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove partial download {}: {}", part.display(), rm);
                    }
                }
                Err(ManagerError::Download(format!("{:#}", e)))
            }
        }
    }

    async fn fetch_to(&self, url: &str, part: &Path) -> anyhow::Result<u64> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        if !response.status().is_success() {
            anyhow::bail!("Download failed with status: {}", response.status());
        }

        let total_size = response.content_length();
        if let Some(total) = total_size {
            info!("Total size: {:.2} MB", total as f64 / (1024.0 * 1024.0));
        }

        let mut file = File::create(part)
            .await
            .with_context(|| format!("Failed to create {}", part.display()))?;

        let mut downloaded: u64 = 0;
        let mut next_report = PROGRESS_STEP_BYTES;
        while let Some(chunk) = response.chunk().await.context("Download stream error")? {
            file.write_all(&chunk).await.context("Write error")?;
            downloaded += chunk.len() as u64;

            if downloaded >= next_report {
                match total_size {
                    Some(total) if total > 0 => info!(
                        "Downloaded: {:.2} MB ({:.2}%)",
                        downloaded as f64 / (1024.0 * 1024.0),
                        downloaded as f64 * 100.0 / total as f64
                    ),
                    _ => info!("Downloaded: {:.2} MB", downloaded as f64 / (1024.0 * 1024.0)),
                }
                next_report += PROGRESS_STEP_BYTES;
            }
        }
        file.flush().await.context("Write error")?;

        if let Some(total) = total_size {
            if downloaded != total {
                anyhow::bail!("Download incomplete: got {} bytes, expected {}", downloaded, total);
            }
        }
        Ok(downloaded)
    }
}
