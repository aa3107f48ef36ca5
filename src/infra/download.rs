//! HTTP download functionality
//!
//! Streams an image to local storage with progress reporting, SHA-256
//! hashing and retry with exponential backoff. Only network failures
//! (connect errors, timeouts, dropped bodies) are retried; HTTP error
//! statuses and a full destination disk fail immediately. Every retry starts
//! over from byte zero.

use backoff::ExponentialBackoffBuilder;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::defaults;
use crate::core::global_config::GlobalConfig;
use crate::error::TransferError;
use crate::infra::blockdev::is_no_space;

/// Lifecycle of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Transferring,
    Retrying,
    Complete,
    Failed,
}

/// Snapshot of a download in progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub source: String,
    pub destination: PathBuf,
    pub bytes_total: Option<u64>,
    pub bytes_transferred: u64,
    pub status: DownloadStatus,
}

impl DownloadTask {
    pub fn new(source: &str, destination: &Path) -> Self {
        Self {
            source: source.to_string(),
            destination: destination.to_path_buf(),
            bytes_total: None,
            bytes_transferred: 0,
            status: DownloadStatus::Pending,
        }
    }

    /// Percent complete, or `None` when the server didn't send a length
    pub fn percent(&self) -> Option<f64> {
        match self.bytes_total {
            Some(0) => Some(100.0),
            Some(total) => Some((self.bytes_transferred as f64 / total as f64 * 100.0).min(100.0)),
            None => None,
        }
    }
}

/// Progress callback type for download progress reporting
pub type ProgressCallback = Box<dyn Fn(&DownloadTask) + Send + Sync>;

/// Download result containing file path and metadata
#[derive(Debug)]
pub struct DownloadResult {
    /// Path to the downloaded file
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// SHA256 checksum of the downloaded content
    pub checksum: String,
    /// Attempts used, including the successful one
    pub attempts: u32,
}

/// Download manager for fetching images with retry
#[derive(Debug, Clone)]
pub struct DownloadManager {
    /// HTTP client
    client: reqwest::Client,
    /// Retries after the first attempt
    max_retries: u32,
    /// Base delay for exponential backoff (in milliseconds)
    base_delay_ms: u64,
    /// Bytes between progress reports
    chunk_size: u64,
}

impl DownloadManager {
    /// Create a new download manager with default settings
    pub fn new() -> Self {
        Self::with_config(defaults::MAX_DOWNLOAD_RETRIES, defaults::BASE_RETRY_DELAY_MS)
    }

    /// Create a download manager with custom retry settings
    pub fn with_config(max_retries: u32, base_delay_ms: u64) -> Self {
        Self::with_timeouts(
            max_retries,
            base_delay_ms,
            Duration::from_secs(defaults::DOWNLOAD_TIMEOUT_SECS),
            Duration::from_secs(defaults::CONNECT_TIMEOUT_SECS),
        )
    }

    /// Create a download manager with custom retry settings and timeouts
    pub fn with_timeouts(
        max_retries: u32,
        base_delay_ms: u64,
        read_timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .read_timeout(read_timeout)
                .connect_timeout(connect_timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            max_retries,
            base_delay_ms,
            chunk_size: defaults::FETCH_CHUNK_SIZE as u64,
        }
    }

    /// Create a download manager from the global configuration
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self::with_timeouts(
            config.max_retries(),
            config.base_delay_ms(),
            config.download_timeout(),
            config.connect_timeout(),
        )
    }

    /// Get max retries
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Download a file with retry logic
    ///
    /// # Arguments
    /// * `url` - URL to download from
    /// * `dest` - Destination path
    /// * `progress` - Optional progress callback, called after each chunk
    ///
    /// # Returns
    /// Download result with path, size, and checksum
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<DownloadResult, TransferError> {
        let attempts = AtomicU32::new(0);
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.base_delay_ms))
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(Duration::from_millis(defaults::MAX_RETRY_DELAY_MS))
            .with_max_elapsed_time(None)
            .build();

        let this = self;
        let counter = &attempts;
        let outcome = backoff::future::retry_notify(
            backoff,
            move || async move {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                debug!("Download attempt {} for {}", attempt, url);
                match this.download_once(url, dest, progress).await {
                    Ok(result) => Ok(result),
                    Err(e) if e.is_transient() && attempt <= this.max_retries => {
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            },
            |err: TransferError, delay: Duration| {
                warn!("Download failed ({}), retrying in {:?}", err, delay);
                if let Some(cb) = progress {
                    let mut task = DownloadTask::new(url, dest);
                    task.status = DownloadStatus::Retrying;
                    cb(&task);
                }
            },
        )
        .await;

        let attempts = attempts.load(Ordering::SeqCst);
        match outcome {
            Ok(mut result) => {
                result.attempts = attempts;
                info!("Downloaded {} ({} bytes)", url, result.size);
                Ok(result)
            }
            Err(e) => {
                // Clean up partial download on failure
                if let Err(rm) = tokio::fs::remove_file(dest).await {
                    if rm.kind() != io::ErrorKind::NotFound {
                        warn!("Could not remove partial download {}: {}", dest.display(), rm);
                    }
                }
                if let Some(cb) = progress {
                    let mut task = DownloadTask::new(url, dest);
                    task.status = DownloadStatus::Failed;
                    cb(&task);
                }

                if e.is_transient() {
                    Err(TransferError::RetriesExhausted {
                        url: url.to_string(),
                        attempts,
                        last_error: e.to_string(),
                    })
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Single download attempt without retry
    async fn download_once(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<DownloadResult, TransferError> {
        let network = |e: reqwest::Error| TransferError::Network {
            url: url.to_string(),
            error: e.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(network)?;

        if !response.status().is_success() {
            return Err(TransferError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let mut task = DownloadTask::new(url, dest);
        task.bytes_total = response.content_length();
        task.status = DownloadStatus::Transferring;

        // Create parent directories if needed
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, &e))?;
        }

        let mut file = File::create(dest).await.map_err(|e| io_error(dest, &e))?;

        if let Some(cb) = progress {
            cb(&task);
        }

        let mut hasher = Sha256::new();
        let mut next_report = self.chunk_size;
        let mut stream = response.bytes_stream();

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(network)?;

            file.write_all(&chunk)
                .await
                .map_err(|e| io_error(dest, &e))?;

            hasher.update(&chunk);
            task.bytes_transferred += chunk.len() as u64;

            if task.bytes_transferred >= next_report {
                next_report = (task.bytes_transferred / self.chunk_size + 1) * self.chunk_size;
                if let Some(cb) = progress {
                    cb(&task);
                }
            }
        }

        file.flush().await.map_err(|e| io_error(dest, &e))?;
        file.sync_all().await.map_err(|e| io_error(dest, &e))?;

        task.status = DownloadStatus::Complete;
        if task.bytes_total.is_none() {
            task.bytes_total = Some(task.bytes_transferred);
        }
        if let Some(cb) = progress {
            cb(&task);
        }

        Ok(DownloadResult {
            path: dest.to_path_buf(),
            size: task.bytes_transferred,
            checksum: hex::encode(hasher.finalize()),
            attempts: 1,
        })
    }

    /// Download a file and verify its checksum
    ///
    /// # Returns
    /// Download result if checksum matches, error otherwise
    pub async fn download_verified(
        &self,
        url: &str,
        dest: &Path,
        expected_checksum: &str,
        progress: Option<&ProgressCallback>,
    ) -> Result<DownloadResult, TransferError> {
        let result = self.download(url, dest, progress).await?;

        if !result.checksum.eq_ignore_ascii_case(expected_checksum.trim()) {
            // Delete corrupted download
            let _ = tokio::fs::remove_file(dest).await;

            return Err(TransferError::ChecksumMismatch {
                file: dest.display().to_string(),
                expected: expected_checksum.to_lowercase(),
                actual: result.checksum,
            });
        }

        Ok(result)
    }
}

impl Default for DownloadManager {
    fn default() -> Self {
        Self::new()
    }
}

fn io_error(path: &Path, err: &io::Error) -> TransferError {
    if is_no_space(err) {
        TransferError::DiskFull {
            path: path.to_path_buf(),
        }
    } else {
        TransferError::Io {
            path: path.to_path_buf(),
            error: err.to_string(),
        }
    }
}

/// Compute SHA256 checksum of data
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
