//! Staged asset downloader.
//!
//! Streams a release asset into `<destination>.part` with progress
//! reporting, then renames it onto the destination once every byte has
//! arrived (and matched the published checksum, if any). A failed or
//! cancelled download removes the `.part` file and never touches an existing
//! file at the destination.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::{DownloadError, UpdateError};

/// Default timeout for HTTP requests in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default read timeout for streaming downloads in seconds.
const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;

/// Extension appended to the destination while a download is in flight.
pub const PARTIAL_EXTENSION: &str = "part";

/// Configuration for the downloader.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Connection timeout in seconds.
    pub timeout_secs: u64,
    /// Read timeout for streaming in seconds.
    pub read_timeout_secs: u64,
    /// User agent string.
    pub user_agent: String,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            user_agent: format!("zrc-selfupdate/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl From<&NetworkConfig> for DownloaderConfig {
    fn from(network: &NetworkConfig) -> Self {
        Self {
            timeout_secs: network.connect_timeout_seconds,
            read_timeout_secs: network.read_timeout_seconds,
            user_agent: network.user_agent(),
        }
    }
}

/// Download progress information.
///
/// `total` is `None` when the server did not send a content length and the
/// feed did not report a size; progress is then indeterminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes downloaded so far.
    pub downloaded: u64,
    /// Total bytes to download, if known.
    pub total: Option<u64>,
}

impl DownloadProgress {
    /// Create a new progress instance.
    pub fn new(downloaded: u64, total: Option<u64>) -> Self {
        Self { downloaded, total }
    }

    /// Download progress as a percentage (0.0 to 100.0), if the total is known.
    pub fn percentage(&self) -> Option<f64> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some((self.downloaded as f64 / total as f64 * 100.0).min(100.0)),
        }
    }
}

impl std::fmt::Display for DownloadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.total, self.percentage()) {
            (Some(total), Some(pct)) => {
                write!(f, "{}/{} bytes ({:.1}%)", self.downloaded, total, pct)
            }
            _ => write!(f, "{} bytes", self.downloaded),
        }
    }
}

/// Result of a completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Final path of the downloaded file
    pub path: PathBuf,
    /// Number of bytes written
    pub bytes: u64,
    /// Hex SHA-256 of the content
    pub sha256: String,
}

/// Path of the in-flight file for `dest`.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(PARTIAL_EXTENSION);
    dest.with_file_name(name)
}

/// HTTP downloader for release assets.
pub struct Downloader {
    /// HTTP client configured with timeouts.
    client: reqwest::Client,
}

impl Downloader {
    /// Create a new downloader with default settings.
    pub fn new() -> Result<Self, UpdateError> {
        Self::with_config(DownloaderConfig::default())
    }

    /// Create a new downloader with custom configuration.
    pub fn with_config(config: DownloaderConfig) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| UpdateError::HttpClient(e.to_string()))?;

        Ok(Self { client })
    }

    /// Fetch a small text resource, such as a checksum file.
    pub async fn fetch_text(&self, url: &str) -> Result<String, DownloadError> {
        debug!("Fetching URL: {}", url);

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::Network(format!(
                "unexpected status {} for {}",
                response.status().as_u16(),
                url
            )));
        }

        Ok(response.text().await?)
    }

    /// Fetch the published SHA-256 for an asset.
    ///
    /// Accepts the `sha256sum` format (`<hex>  <file name>`) as well as a bare
    /// digest.
    pub async fn fetch_checksum(&self, url: &str) -> Result<[u8; 32], DownloadError> {
        let text = self.fetch_text(url).await?;
        parse_checksum(&text).ok_or_else(|| {
            DownloadError::Network(format!("malformed checksum file at {}", url))
        })
    }

    /// Download `url` to `dest`.
    ///
    /// `on_progress` is invoked after every received chunk. `expected_size`
    /// is used as the total when the server omits a content length, and
    /// `expected_sha256` is checked before the file is moved into place.
    /// Cancelling `cancel` stops the transfer at the next chunk boundary.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::Network`] on transport failure or non-success status
    /// - [`DownloadError::Io`] if the file cannot be written
    /// - [`DownloadError::Cancelled`] if `cancel` fires
    /// - [`DownloadError::Incomplete`] if fewer bytes arrive than advertised
    /// - [`DownloadError::ChecksumMismatch`] if the content hash differs
    ///
    /// On any error the `.part` file is removed and `dest` is left as it was.
    pub async fn download<F>(
        &self,
        url: &str,
        dest: &Path,
        expected_size: Option<u64>,
        expected_sha256: Option<[u8; 32]>,
        on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, DownloadError>
    where
        F: Fn(DownloadProgress) + Send + Sync,
    {
        info!("Starting download: {} -> {:?}", url, dest);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let part = partial_path(dest);
        let result = self
            .stream_to(url, &part, expected_size, expected_sha256, &on_progress, cancel)
            .await;

        let (bytes, sha256) = match result {
            Ok(done) => done,
            Err(e) => {
                if let Err(remove_err) = tokio::fs::remove_file(&part).await {
                    if remove_err.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove partial download {:?}: {}", part, remove_err);
                    }
                }
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&part, dest).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e.into());
        }

        info!("Download complete: {} bytes at {:?}", bytes, dest);
        Ok(DownloadOutcome {
            path: dest.to_path_buf(),
            bytes,
            sha256,
        })
    }

    async fn stream_to<F>(
        &self,
        url: &str,
        part: &Path,
        expected_size: Option<u64>,
        expected_sha256: Option<[u8; 32]>,
        on_progress: &F,
        cancel: &CancellationToken,
    ) -> Result<(u64, String), DownloadError>
    where
        F: Fn(DownloadProgress) + Send + Sync,
    {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            response = self.client.get(url).send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Network(format!(
                "download failed with status {}",
                status.as_u16()
            )));
        }

        let total = response.content_length().filter(|&n| n > 0).or(expected_size);

        // Truncates a stale partial file from an earlier run
        let mut file = tokio::fs::File::create(part).await?;
        let mut hasher = Sha256::new();
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        on_progress(DownloadProgress::new(0, total));

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                next = stream.next() => next,
            };

            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| DownloadError::Network(e.to_string()))?;

            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            downloaded += chunk.len() as u64;

            on_progress(DownloadProgress::new(downloaded, total));

            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(expected) = total {
            if downloaded != expected {
                warn!(
                    "Download size mismatch: expected {}, got {}",
                    expected, downloaded
                );
                return Err(DownloadError::Incomplete {
                    expected,
                    actual: downloaded,
                });
            }
        }

        let digest: [u8; 32] = hasher.finalize().into();
        if let Some(expected) = expected_sha256 {
            if digest != expected {
                return Err(DownloadError::ChecksumMismatch {
                    expected: hex::encode(expected),
                    actual: hex::encode(digest),
                });
            }
            debug!("SHA-256 verification passed");
        }

        Ok((downloaded, hex::encode(digest)))
    }
}

/// Parse the first token of a checksum file as a 32-byte hex digest.
pub fn parse_checksum(text: &str) -> Option<[u8; 32]> {
    let token = text.split_whitespace().next()?;
    let bytes = hex::decode(token.to_ascii_lowercase()).ok()?;
    bytes.try_into().ok()
}
