//! Resumable HTTP download into a temporary sibling file.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, HeaderValue, RANGE, USER_AGENT};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::control::{ControlSignal, TaskControl};
use super::hash::ContentHash;
use super::progress::{ProgressSnapshot, ProgressTracker, format_bytes};
use super::retry::RetryPolicy;
use crate::config::DownloadSettings;
use crate::error::{CoreError, Result};
use crate::system;

/// User agent string for download requests.
pub(crate) const USER_AGENT_VALUE: &str = concat!("olm/", env!("CARGO_PKG_VERSION"));

/// One file to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Source URL.
    pub url: String,
    /// Final location. The partial file lives at [`temp_path`] of this.
    pub dest: PathBuf,
    /// Declared size, checked after the transfer.
    pub expected_size: Option<u64>,
    /// Digest checked before the final rename.
    pub expected_hash: Option<ContentHash>,
}

/// How a download ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Verified and renamed into place.
    Completed {
        /// Final size in bytes.
        bytes: u64,
    },
    /// Stopped on request. The partial file is kept for a ranged resume.
    Paused {
        /// Bytes in the partial file.
        downloaded: u64,
    },
    /// Stopped on request. The partial file was removed.
    Cancelled,
}

/// `<dest>.tmp`
#[must_use]
pub fn temp_path(dest: &Path) -> PathBuf {
    let mut name: OsString = dest.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    name.push(".tmp");
    dest.with_file_name(name)
}

enum AttemptEnd {
    Finished(u64),
    Stopped(ControlSignal, u64),
}

/// Chunked, resumable HTTP downloader.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
    chunk_size: usize,
    retry: RetryPolicy,
    progress_interval: Duration,
}

impl HttpDownloader {
    /// Build a downloader from settings.
    pub fn new(settings: &DownloadSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout())
            .read_timeout(settings.read_timeout())
            .build()
            .map_err(|e| CoreError::Network(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            chunk_size: settings.chunk_size(),
            retry: RetryPolicy::from_settings(settings),
            progress_interval: settings.progress_interval(),
        })
    }

    /// Download `request`, reporting snapshots through `on_progress`.
    ///
    /// Transient failures are retried per the [`RetryPolicy`]. Pause and
    /// cancel are honoured between chunks and during back-off.
    pub async fn download<F>(
        &self,
        request: &DownloadRequest,
        control: &TaskControl,
        mut on_progress: F,
    ) -> Result<DownloadOutcome>
    where
        F: FnMut(&ProgressSnapshot) + Send,
    {
        let temp = temp_path(&request.dest);
        if let Some(parent) = temp.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::io("create directory", parent, &e))?;
        }

        let mut tracker = ProgressTracker::new(self.progress_interval);
        let mut attempt = 0;

        let written = loop {
            if let Some(outcome) = stop_outcome(control.signal(), &temp).await? {
                return Ok(outcome);
            }

            match self.attempt(request, &temp, control, &mut tracker, &mut on_progress).await {
                Ok(AttemptEnd::Finished(written)) => break written,
                Ok(AttemptEnd::Stopped(signal, _)) => {
                    if let Some(outcome) = stop_outcome(signal, &temp).await? {
                        return Ok(outcome);
                    }
                }
                Err(err) if err.is_retryable() && self.retry.allows_retry(attempt) => {
                    attempt += 1;
                    warn!(
                        "Download of {} failed ({}), retry {}/{} in {:?}",
                        request.url, err, attempt, self.retry.max_retries, self.retry.backoff
                    );
                    if let Some(signal) = self.retry.wait(control).await
                        && let Some(outcome) = stop_outcome(signal, &temp).await?
                    {
                        return Ok(outcome);
                    }
                }
                Err(err) => return Err(err),
            }
        };

        on_progress(&tracker.snapshot());

        if let Some(expected) = request.expected_size
            && expected != written
        {
            discard(&temp).await;
            return Err(CoreError::SizeMismatch {
                expected,
                actual: written,
            });
        }

        if let Some(hash) = request.expected_hash.clone() {
            let path = temp.clone();
            let verified = tokio::task::spawn_blocking(move || hash.verify_file(&path))
                .await
                .map_err(|e| CoreError::Io(format!("hash task failed: {e}")))?;
            if let Err(err) = verified {
                discard(&temp).await;
                return Err(err);
            }
        }

        fs::rename(&temp, &request.dest)
            .await
            .map_err(|e| CoreError::io("rename", &temp, &e))?;

        info!(
            "Download complete: {} -> {} ({})",
            request.url,
            request.dest.display(),
            format_bytes(written)
        );
        Ok(DownloadOutcome::Completed { bytes: written })
    }

    async fn attempt<F>(
        &self,
        request: &DownloadRequest,
        temp: &Path,
        control: &TaskControl,
        tracker: &mut ProgressTracker,
        on_progress: &mut F,
    ) -> Result<AttemptEnd>
    where
        F: FnMut(&ProgressSnapshot) + Send,
    {
        let mut offset = match fs::metadata(temp).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let (response, mut file, mut written, total) = loop {
            let response = self.send(&request.url, offset).await?;
            match open_target(&response, offset, temp).await? {
                Target::Write { file, written, total } => break (response, file, written, total),
                Target::Complete => {
                    debug!("Partial file already holds all {} bytes", offset);
                    tracker.start(offset, Some(offset), Instant::now());
                    return Ok(AttemptEnd::Finished(offset));
                }
                Target::Restart(reason) => {
                    warn!("{}, restarting {} from zero", reason, request.url);
                    discard(temp).await;
                    offset = 0;
                }
                Target::Refused(status) => {
                    return Err(CoreError::HttpStatus {
                        status: status.as_u16(),
                        url: request.url.clone(),
                    });
                }
            }
        };

        let total = total.or(request.expected_size);
        if let Some(total) = total {
            system::ensure_free_space(temp, total.saturating_sub(written))?;
        }

        tracker.start(written, total, Instant::now());
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                signal = control.stopped() => {
                    file.flush().await.map_err(|e| CoreError::io("flush", temp, &e))?;
                    return Ok(AttemptEnd::Stopped(signal, written));
                }
                next = stream.next() => next,
            };

            let bytes = match next {
                None => break,
                Some(Ok(bytes)) => bytes,
                Some(Err(err)) => {
                    file.flush().await.map_err(|e| CoreError::io("flush", temp, &e))?;
                    return Err(err.into());
                }
            };

            for piece in bytes.chunks(self.chunk_size) {
                file.write_all(piece)
                    .await
                    .map_err(|e| CoreError::io("write", temp, &e))?;
                written += piece.len() as u64;

                let now = Instant::now();
                tracker.record(written, now);
                if tracker.should_emit(now) {
                    on_progress(&tracker.snapshot());
                }

                let signal = control.signal();
                if signal != ControlSignal::Run {
                    file.flush().await.map_err(|e| CoreError::io("flush", temp, &e))?;
                    return Ok(AttemptEnd::Stopped(signal, written));
                }
            }
        }

        file.flush().await.map_err(|e| CoreError::io("flush", temp, &e))?;
        file.sync_all().await.map_err(|e| CoreError::io("sync", temp, &e))?;

        if let Some(total) = total
            && written < total
        {
            return Err(CoreError::Network(format!(
                "connection closed after {written} of {total} bytes"
            )));
        }
        Ok(AttemptEnd::Finished(written))
    }

    async fn send(&self, url: &str, offset: u64) -> Result<reqwest::Response> {
        let mut builder = self
            .client
            .get(url)
            .header(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        if offset > 0 {
            info!("Resuming {} from byte {}", url, offset);
            builder = builder.header(RANGE, format!("bytes={offset}-"));
        } else {
            info!("Starting download from {}", url);
        }
        Ok(builder.send().await?)
    }
}

enum Target {
    /// Append or write the body from `written`.
    Write {
        file: File,
        written: u64,
        total: Option<u64>,
    },
    /// The partial file is already whole.
    Complete,
    /// The partial file is unusable. Drop it and re-request without a range.
    Restart(&'static str),
    Refused(StatusCode),
}

/// Decide how a response relates to the partial file at `offset`.
async fn open_target(response: &reqwest::Response, offset: u64, temp: &Path) -> Result<Target> {
    let status = response.status();
    let content_range = response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok());

    if status == StatusCode::PARTIAL_CONTENT && offset > 0 {
        return match content_range.and_then(parse_content_range) {
            Some((start, total)) if start == offset => {
                let total = total.or_else(|| response.content_length().map(|len| offset + len));
                let file = OpenOptions::new()
                    .append(true)
                    .open(temp)
                    .await
                    .map_err(|e| CoreError::io("open", temp, &e))?;
                Ok(Target::Write {
                    file,
                    written: offset,
                    total,
                })
            }
            _ => Ok(Target::Restart("Server returned an unexpected byte range")),
        };
    }

    if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
        return Ok(
            if content_range.and_then(parse_unsatisfied_range) == Some(offset) {
                Target::Complete
            } else {
                Target::Restart("Requested range not satisfiable")
            },
        );
    }

    if !status.is_success() {
        return Ok(Target::Refused(status));
    }
    if offset > 0 {
        info!("Server ignored the range request, restarting from zero");
    }
    let file = File::create(temp)
        .await
        .map_err(|e| CoreError::io("create", temp, &e))?;
    Ok(Target::Write {
        file,
        written: 0,
        total: response.content_length(),
    })
}

/// Map a stop signal to an outcome, removing the partial file on cancel.
async fn stop_outcome(signal: ControlSignal, temp: &Path) -> Result<Option<DownloadOutcome>> {
    match signal {
        ControlSignal::Run => Ok(None),
        ControlSignal::Pause => {
            let downloaded = fs::metadata(temp).await.map(|m| m.len()).unwrap_or(0);
            info!("Download paused at {} bytes", downloaded);
            Ok(Some(DownloadOutcome::Paused { downloaded }))
        }
        ControlSignal::Cancel => {
            discard(temp).await;
            info!("Download cancelled, removed {}", temp.display());
            Ok(Some(DownloadOutcome::Cancelled))
        }
    }
}

async fn discard(temp: &Path) {
    if let Err(e) = fs::remove_file(temp).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to remove {}: {}", temp.display(), e);
    }
}

/// Parse `bytes START-END/TOTAL` into `(START, Some(TOTAL))`. `*` total is `None`.
fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        total => Some(total.parse().ok()?),
    };
    Some((start, total))
}

/// Parse `bytes */TOTAL` from a 416 response.
fn parse_unsatisfied_range(value: &str) -> Option<u64> {
    value
        .trim()
        .strip_prefix("bytes")?
        .trim_start()
        .strip_prefix("*/")?
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_path() {
        assert_eq!(
            temp_path(Path::new("/data/update.zip")),
            PathBuf::from("/data/update.zip.tmp")
        );
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("bytes 40-99/100"), Some((40, Some(100))));
        assert_eq!(parse_content_range("bytes 40-99/*"), Some((40, None)));
        assert_eq!(parse_content_range("items 1-2/3"), None);
        assert_eq!(parse_unsatisfied_range("bytes */100"), Some(100));
    }

    #[test]
    fn test_user_agent() {
        assert!(USER_AGENT_VALUE.starts_with("olm/"));
    }
}
