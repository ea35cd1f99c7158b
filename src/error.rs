//! Error types for the transfer pipeline.
//!
//! Validation rejections (blocked user, not a link, ...) are not errors; they
//! are reported as [`crate::dispatcher::DispatchOutcome`] variants. This enum
//! covers everything that goes wrong while talking to the remote services or
//! the local disk.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the unlock, download and upload clients.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Request timed out before completion.
    #[error("timeout requesting {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Connection-level failure (DNS, refused connection, TLS, broken body stream).
    #[error("network error requesting {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The remote answered with a status other than 200.
    #[error("request to {url} failed, status={status}")]
    HttpStatus {
        /// The URL that returned the status.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// Local file system failure.
    #[error("IO error on {path}: {source}")]
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Bytes on disk do not match the declared content length.
    #[error("download incomplete for {path}: expected {expected_bytes} bytes, got {actual_bytes}")]
    Integrity {
        /// Destination that was removed.
        path: PathBuf,
        /// Declared content length.
        expected_bytes: u64,
        /// Bytes actually written.
        actual_bytes: u64,
    },

    /// The provider answered 200 but reported a failure status.
    #[error("provider error: {message}")]
    Provider {
        /// Provider supplied message.
        message: String,
    },

    /// The provider response body could not be decoded.
    #[error("unexpected response from {url}: {reason}")]
    Decode {
        /// URL of the response.
        url: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl RelayError {
    /// Maps a reqwest send/stream error onto `Timeout` or `Network`.
    pub fn from_reqwest(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network { url, source }
        }
    }

    /// Maps an error raised while reading or decoding a JSON body. Decoding
    /// failures become `Decode`, everything else goes through
    /// [`RelayError::from_reqwest`].
    pub fn from_body(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_decode() {
            Self::decode(url, source.to_string())
        } else {
            Self::from_reqwest(url, source)
        }
    }

    /// Creates an IO error for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a provider error.
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
        }
    }

    /// Creates a decode error.
    pub fn decode(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// True for timeouts and connection failures, as opposed to answers the
    /// remote side actually gave.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Network { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_message_carries_code() {
        let err = RelayError::HttpStatus {
            url: "http://direct/file.bin".to_string(),
            status: 404,
        };
        assert!(err.to_string().contains("status=404"));
        assert!(!err.is_transport());
    }

    #[test]
    fn test_timeout_is_transport() {
        let err = RelayError::Timeout {
            url: "http://direct/file.bin".to_string(),
        };
        assert!(err.is_transport());
    }

    #[test]
    fn test_integrity_message() {
        let err = RelayError::Integrity {
            path: PathBuf::from("files/a.bin"),
            expected_bytes: 1000,
            actual_bytes: 900,
        };
        let text = err.to_string();
        assert!(text.contains("download incomplete"));
        assert!(text.contains("1000"));
        assert!(text.contains("900"));
    }
}
