//! Upload of staged files to the public file host.
//!
//! The host exposes a server-selection endpoint and a per-server upload
//! endpoint. Uploads are a multipart body with a single `file` part, streamed
//! from disk so memory use does not grow with the file size.

use std::path::Path;
use std::sync::Arc;

use futures_util::TryStreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, StatusCode};
use serde::Deserialize;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{error, info, instrument, warn};

use super::progress::ProgressObserver;
use crate::config::TRANSFER_CHUNK_SIZE;
use crate::error::RelayError;

/// Placeholder in the upload URL template replaced by the server name.
pub const SERVER_PLACEHOLDER: &str = "{server}";

#[derive(Debug, Deserialize)]
struct ServersResponse {
    status: Option<String>,
    data: Option<ServersData>,
}

#[derive(Debug, Deserialize)]
struct ServersData {
    #[serde(default)]
    servers: Vec<ServerEntry>,
}

#[derive(Debug, Deserialize)]
struct ServerEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    status: String,
    message: Option<String>,
    data: Option<UploadData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadData {
    download_page: String,
}

/// Client for the file host.
#[derive(Debug, Clone)]
pub struct FileHostClient {
    client: Client,
    api_url: String,
    upload_url_template: String,
}

impl FileHostClient {
    /// Creates a client. `upload_url_template` must contain `{server}`.
    #[must_use]
    pub fn new(
        client: Client,
        api_url: impl Into<String>,
        upload_url_template: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            upload_url_template: upload_url_template.into(),
        }
    }

    /// Asks the host which server to upload to and returns the first one.
    ///
    /// # Errors
    ///
    /// `Provider` when the host reports a failure or lists no server,
    /// otherwise the usual transport and decode errors.
    pub async fn select_server(&self) -> Result<String, RelayError> {
        let url = format!("{}/servers", self.api_url.trim_end_matches('/'));
        info!("Finding best server...");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RelayError::from_reqwest(&url, e))?;

        if response.status() != StatusCode::OK {
            return Err(RelayError::HttpStatus {
                url,
                status: response.status().as_u16(),
            });
        }

        let body: ServersResponse = response
            .json()
            .await
            .map_err(|e| RelayError::from_body(&url, e))?;

        if let Some(status) = body.status.as_deref() {
            if status != "ok" {
                return Err(RelayError::provider(format!(
                    "server selection returned status {status}"
                )));
            }
        }

        let server = body
            .data
            .and_then(|data| data.servers.into_iter().next())
            .map(|entry| entry.name)
            .ok_or_else(|| RelayError::provider("no upload server available"))?;

        info!(server = %server, "Using server");
        Ok(server)
    }

    /// Uploads `path` and returns the public download page.
    ///
    /// The local file is deleted after a successful upload. On failure it is
    /// left in place for the caller's [`super::StagedFile`] guard. Every
    /// failure is logged with its cause before it is returned.
    ///
    /// # Errors
    ///
    /// `Io` if the file is missing, `Provider` if the host answers with a
    /// status other than `ok`, `HttpStatus`, `Timeout`, `Network` or `Decode`
    /// for the remaining failure modes.
    #[instrument(skip(self, observer), fields(path = %path.display()))]
    pub async fn upload(
        &self,
        path: &Path,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<String, RelayError> {
        let result = self.upload_inner(path, observer).await;
        match &result {
            Ok(link) => info!(link = %link, "Upload completed successfully"),
            Err(RelayError::Timeout { .. }) => error!("Upload timeout"),
            Err(e @ RelayError::Network { .. }) => error!(error = %e, "Upload network error"),
            Err(e @ RelayError::Provider { .. }) => error!(error = %e, "Upload rejected by file host"),
            Err(e @ RelayError::HttpStatus { .. }) => error!(error = %e, "Upload HTTP error"),
            Err(e) => error!(error = %e, "Unexpected upload error"),
        }
        result
    }

    async fn upload_inner(
        &self,
        path: &Path,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<String, RelayError> {
        let server = self.select_server().await?;

        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| RelayError::io(path, e))?;
        if !metadata.is_file() {
            return Err(RelayError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "not a regular file"),
            ));
        }
        let size = metadata.len();
        let file_name = path
            .file_name()
            .map_or_else(|| "upload.bin".to_string(), |n| n.to_string_lossy().into_owned());

        let file = File::open(path)
            .await
            .map_err(|e| RelayError::io(path, e))?;

        let mut sent: u64 = 0;
        let stream = ReaderStream::with_capacity(file, TRANSFER_CHUNK_SIZE).inspect_ok(
            move |chunk| {
                sent += chunk.len() as u64;
                observer.on_progress(sent, size);
            },
        );

        let url = self.upload_url_template.replace(SERVER_PLACEHOLDER, &server);
        let part = Part::stream_with_length(Body::wrap_stream(stream), size)
            .file_name(file_name)
            .mime_str("application/octet-stream")
            .map_err(|e| RelayError::from_reqwest(&url, e))?;
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| RelayError::from_reqwest(&url, e))?;

        if response.status() != StatusCode::OK {
            return Err(RelayError::HttpStatus {
                url,
                status: response.status().as_u16(),
            });
        }

        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| RelayError::from_body(&url, e))?;

        if body.status != "ok" {
            return Err(RelayError::provider(
                body.message.unwrap_or_else(|| "Unknown error".to_string()),
            ));
        }

        let link = body
            .data
            .map(|data| data.download_page)
            .ok_or_else(|| RelayError::decode(&url, "missing data.downloadPage"))?;

        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(error = %e, "Failed to remove uploaded file");
        }

        Ok(link)
    }
}
