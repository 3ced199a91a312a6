// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Protocol clients of the agent fabric: the entry-point HTTP API, the UDP
//! heartbeat engine, the signalling websocket transport and the group server
//! API.

use std::time::Duration;

use reqwest::{Client, ClientBuilder};
use thiserror::Error;
use url::Url;

use acpcommon::{ACCEPTED_API_VERSIONS, ACCEPTED_API_VERSIONS_HEADER};

pub mod auth_api;
mod backoff;
pub mod group_api;
pub mod heartbeat;
pub mod signalling;

pub(crate) use backoff::ExponentialBackoff;

/// Connect timeout applied to every HTTP call.
pub const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// Overall request timeout applied to every HTTP call.
pub const HTTP_READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ApiClientInitError {
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),
    #[error("Malformed base URL: {0}")]
    UrlError(#[from] url::ParseError),
}

// ApiClient is a wrapper around a reqwest client bound to one server base
// URL. The per-plane endpoint functions live in the `*_api` modules.
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Creates a new API client that connects to the given base URL.
    pub fn initialize(base_url: impl AsRef<str>) -> Result<Self, ApiClientInitError> {
        let base_url = Url::parse(base_url.as_ref())?;
        let client = ClientBuilder::new()
            .user_agent("AcpClient/0.1")
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .timeout(HTTP_READ_TIMEOUT)
            .build()?;
        Ok(Self { client, base_url })
    }

    /// Builds a URL for a given endpoint.
    fn build_url(&self, endpoint: &str) -> Result<Url, url::ParseError> {
        self.base_url.join(endpoint)
    }

    /// A POST request builder with the version negotiation header set.
    fn post(&self, url: Url) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header(ACCEPTED_API_VERSIONS_HEADER, ACCEPTED_API_VERSIONS)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}
