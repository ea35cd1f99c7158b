//! Streaming transfers between the remote services and the local disk.

/// Download of an unlocked link into the staging directory
pub mod download;
/// Progress reporting for both transfer directions
pub mod progress;
/// Scoped ownership of staged local files
pub mod staged;
/// Upload of a staged file to the public file host
pub mod upload;

pub use download::{DownloadedFile, Downloader};
pub use progress::{LogProgress, ProgressObserver};
pub use staged::StagedFile;
pub use upload::FileHostClient;

use std::time::Duration;

/// Builds the HTTP client shared by the unlock, download and upload clients.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialised.
pub fn build_http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("debrid-relay/", env!("CARGO_PKG_VERSION")))
        .build()
}
