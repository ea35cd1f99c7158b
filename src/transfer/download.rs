//! Streaming download of unlocked links into the staging directory.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Client, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{info, instrument, warn};

use super::progress::ProgressObserver;
use super::staged::StagedFile;
use crate::config::TRANSFER_CHUNK_SIZE;
use crate::error::RelayError;
use crate::filename::resolve_filename;

/// Name used when the URL does not yield a usable filename.
pub const FALLBACK_FILENAME: &str = "download.bin";

/// A completed download.
#[derive(Debug)]
pub struct DownloadedFile {
    /// Filename derived from the URL or the provider's name for it.
    pub filename: String,
    /// Bytes on disk.
    pub bytes: u64,
    /// The staged file, removed when dropped.
    pub file: StagedFile,
}

/// Streams direct links to disk.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    dir: PathBuf,
}

impl Downloader {
    /// Creates a downloader writing into `dir` (created on first use).
    #[must_use]
    pub fn new(client: Client, dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            dir: dir.into(),
        }
    }

    /// Downloads `url` into a private directory under the staging root.
    ///
    /// The local name comes from the URL; when the URL gives nothing usable,
    /// `name_hint` (the provider's filename) is tried before the fallback
    /// name. The response status is checked before anything is created on
    /// disk.
    /// The body is written through a 150 KiB buffer and each received chunk
    /// is reported to `observer`. When the server declared a non-zero
    /// content length, the size on disk must match it.
    ///
    /// # Errors
    ///
    /// - `HttpStatus` for any status other than 200
    /// - `Timeout` / `Network` when the request or the body stream fails
    /// - `Integrity` when fewer (or more) bytes than declared end up on disk;
    ///   the partial file is removed first
    /// - `Io` when the directory or file cannot be written
    #[instrument(skip(self, observer), fields(url = %url))]
    pub async fn download(
        &self,
        url: &str,
        name_hint: Option<&str>,
        observer: &dyn ProgressObserver,
    ) -> Result<DownloadedFile, RelayError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RelayError::from_reqwest(url, e))?;

        if response.status() != StatusCode::OK {
            return Err(RelayError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let declared = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|len| *len > 0);

        let filename = local_filename(url, name_hint);
        let staged =
            StagedFile::allocate(&self.dir, &filename).map_err(|e| RelayError::io(&self.dir, e))?;
        let path = staged.path().to_path_buf();
        info!(filename = %filename, path = %path.display(), "Start downloading");

        let file = File::create(&path)
            .await
            .map_err(|e| RelayError::io(&path, e))?;

        let streamed = stream_to_file(file, response, url, &path, declared, observer).await;
        let written = match streamed {
            Ok(written) => written,
            Err((written, error)) => {
                drop(staged);
                let short = !matches!(error, RelayError::Timeout { .. });
                return Err(match declared {
                    Some(expected) if short && written < expected => {
                        warn!(error = %error, "Body stream ended early");
                        RelayError::Integrity {
                            path,
                            expected_bytes: expected,
                            actual_bytes: written,
                        }
                    }
                    _ => error,
                });
            }
        };

        let on_disk = tokio::fs::metadata(&path)
            .await
            .map_err(|e| RelayError::io(&path, e))?
            .len();

        if let Some(expected) = declared {
            if on_disk != expected {
                drop(staged);
                return Err(RelayError::Integrity {
                    path,
                    expected_bytes: expected,
                    actual_bytes: on_disk,
                });
            }
        }

        info!(path = %path.display(), bytes = written, "Download complete");

        Ok(DownloadedFile {
            filename,
            bytes: on_disk,
            file: staged,
        })
    }
}

/// Filename for the staged copy of `url`.
fn local_filename(url: &str, name_hint: Option<&str>) -> String {
    std::iter::once(resolve_filename(url))
        .chain(name_hint.map(resolve_filename))
        .find(|name| !name.trim_matches('.').is_empty())
        .unwrap_or_else(|| FALLBACK_FILENAME.to_string())
}

/// Streams the response body into `file`. On failure returns the number of
/// bytes already written together with the error.
async fn stream_to_file(
    file: File,
    response: reqwest::Response,
    url: &str,
    path: &Path,
    declared: Option<u64>,
    observer: &dyn ProgressObserver,
) -> Result<u64, (u64, RelayError)> {
    let total = declared.unwrap_or(0);
    let mut writer = BufWriter::with_capacity(TRANSFER_CHUNK_SIZE, file);
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| (written, RelayError::from_reqwest(url, e)))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| (written, RelayError::io(path, e)))?;
        written += chunk.len() as u64;
        observer.on_progress(written, total);
    }

    writer
        .flush()
        .await
        .map_err(|e| (written, RelayError::io(path, e)))?;

    Ok(written)
}
