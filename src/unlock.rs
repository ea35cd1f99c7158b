//! Client for the link unlocking provider.
//!
//! A dead link or an unsupported host is an everyday answer from the
//! provider, so `unlock` never fails: it returns an [`UnlockOutcome`] that
//! keeps provider rejections apart from transport failures.

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{error, info, instrument, warn};

use crate::error::RelayError;

/// A link the provider turned into a direct download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockedLink {
    /// Direct download URL.
    pub link: String,
    /// Declared size in bytes.
    pub filesize: u64,
    /// Provider supplied filename, if any.
    pub filename: Option<String>,
}

/// Result of an unlock request.
#[derive(Debug)]
pub enum UnlockOutcome {
    /// The provider returned a direct link.
    Resolved(UnlockedLink),
    /// The provider answered but did not produce a link.
    Rejected {
        /// Why, as far as the provider said.
        reason: String,
    },
    /// The provider could not be reached.
    Transport(RelayError),
}

#[derive(Debug, Deserialize)]
struct UnlockResponse {
    status: String,
    data: Option<UnlockData>,
    error: Option<ProviderError>,
}

#[derive(Debug, Deserialize)]
struct UnlockData {
    link: Option<String>,
    #[serde(default)]
    filesize: u64,
    filename: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    code: Option<String>,
    message: Option<String>,
}

impl ProviderError {
    fn describe(&self) -> String {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => format!("{code}: {message}"),
            (None, Some(message)) => message.clone(),
            (Some(code), None) => code.clone(),
            (None, None) => "unknown error".to_string(),
        }
    }
}

/// Client for the unlock endpoint.
#[derive(Debug, Clone)]
pub struct UnlockClient {
    client: Client,
    base_url: String,
    api_key: String,
    agent: String,
}

impl UnlockClient {
    /// Creates a client against `base_url` (e.g. `https://api.alldebrid.com`).
    #[must_use]
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        agent: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            agent: agent.into(),
        }
    }

    /// Resolves `link` into a direct download.
    #[instrument(skip(self), fields(link = %link))]
    pub async fn unlock(&self, link: &str) -> UnlockOutcome {
        let url = format!("{}/v4/link/unlock", self.base_url.trim_end_matches('/'));

        let response = match self
            .client
            .get(&url)
            .query(&[
                ("apikey", self.api_key.as_str()),
                ("agent", self.agent.as_str()),
                ("link", link),
            ])
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let err = RelayError::from_reqwest(&url, e);
                error!(error = %err, "Unlock request failed");
                return UnlockOutcome::Transport(err);
            }
        };

        if response.status() != StatusCode::OK {
            let status = response.status().as_u16();
            warn!(status, "Unlock HTTP error");
            return UnlockOutcome::Rejected {
                reason: format!("HTTP {status}"),
            };
        }

        let body: UnlockResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                let err = RelayError::from_body(&url, e);
                if err.is_transport() {
                    error!(error = %err, "Unlock response body failed");
                    return UnlockOutcome::Transport(err);
                }
                warn!(error = %err, "Unlock response could not be decoded");
                return UnlockOutcome::Rejected {
                    reason: "malformed response".to_string(),
                };
            }
        };

        if body.status != "success" {
            let reason = body
                .error
                .as_ref()
                .map_or_else(|| format!("status {}", body.status), ProviderError::describe);
            warn!(reason = %reason, "Unlock API error");
            return UnlockOutcome::Rejected { reason };
        }

        match body.data {
            Some(UnlockData {
                link: Some(direct),
                filesize,
                filename,
            }) => {
                info!(filesize, "Link unlocked");
                UnlockOutcome::Resolved(UnlockedLink {
                    link: direct,
                    filesize,
                    filename,
                })
            }
            _ => {
                warn!("Unlock API reported success without a link");
                UnlockOutcome::Rejected {
                    reason: "no link in response".to_string(),
                }
            }
        }
    }
}
