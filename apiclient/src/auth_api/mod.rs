// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Entry-point endpoints: sign-in, sign-out and server certificate
//! verification.

use std::time::Duration;

use rand::RngCore as _;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, warn};

use acpcommon::{
    crypto::{CertificatePemError, signatures::AgentSigningKey, validate_certificate_pem},
    identifiers::AgentId,
    messages::auth::{CsrRequest, CsrResponse, SignInRequest, SignInResponse, SignOutRequest, Ticket},
    time::TimeStamp,
};

use crate::ApiClient;

pub const ENDPOINT_SIGNIN: &str = "/signin";
pub const ENDPOINT_SIGNOUT: &str = "/signout";
pub const ENDPOINT_SERVER_CERT: &str = "/cert";
pub const ENDPOINT_CSR: &str = "/csr";

/// Bounded retry schedule for [`ApiClient::sign_in`]. The counter is local
/// to one invocation; nothing is carried over between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthApiError {
    #[error("The authority rejected the credentials")]
    AuthenticationFailed,
    #[error("The authority rejected the request: {status}")]
    RequestRejected { status: StatusCode },
    #[error("Malformed response from the authority")]
    MalformedResponse(#[source] reqwest::Error),
    #[error("Could not build the request URL")]
    Url(#[from] url::ParseError),
    #[error("Network failure after {attempts} sign-in attempts: {last_failure}")]
    RetriesExhausted { attempts: u32, last_failure: String },
    #[error(transparent)]
    Network(#[from] reqwest::Error),
    #[error("The published server certificate is not valid PEM")]
    MalformedCertificate(#[from] CertificatePemError),
    #[error("The published server certificate does not match the local expectation")]
    CertificateMismatch,
}

impl ApiClient {
    /// Sign the given agent in and obtain a presence ticket.
    ///
    /// Transient network failures and server errors are retried with
    /// exponential backoff according to `retry_policy`, with a fresh counter
    /// for this invocation. Authentication failures are final and returned
    /// immediately. On exhaustion the typed failure carries the attempt
    /// count; there is no partial success.
    pub async fn sign_in(
        &self,
        aid: &AgentId,
        signing_key: &AgentSigningKey,
        retry_policy: RetryPolicy,
    ) -> Result<Ticket, AuthApiError> {
        let url = self.build_url(ENDPOINT_SIGNIN)?;
        let mut backoff =
            crate::ExponentialBackoff::new(retry_policy.backoff_initial, retry_policy.backoff_max);
        let mut attempts = 0;
        loop {
            attempts += 1;
            let body = sign_in_request(aid, signing_key);
            let result = self.post(url.clone()).json(&body).send().await;
            let last_failure = match result {
                Ok(response) => match response.status() {
                    status if status.is_success() => {
                        let response: SignInResponse = response
                            .json()
                            .await
                            .map_err(AuthApiError::MalformedResponse)?;
                        debug!(%aid, "sign-in succeeded");
                        return Ok(Ticket::from_response(aid.clone(), response));
                    }
                    StatusCode::UNAUTHORIZED => return Err(AuthApiError::AuthenticationFailed),
                    status if status.is_client_error() => {
                        return Err(AuthApiError::RequestRejected { status });
                    }
                    // Server errors are treated like network failures and
                    // retried.
                    status => {
                        warn!(%aid, %status, attempt = attempts, "sign-in rejected, retrying");
                        status.to_string()
                    }
                },
                Err(error) => {
                    warn!(%aid, %error, attempt = attempts, "sign-in failed, retrying");
                    error.to_string()
                }
            };
            if attempts >= retry_policy.max_attempts {
                return Err(AuthApiError::RetriesExhausted {
                    attempts,
                    last_failure,
                });
            }
            tokio::time::sleep(backoff.next_backoff()).await;
        }
    }

    /// Submit a certificate signing request for a fresh identity and return
    /// the signed certificate chain.
    pub async fn submit_csr(
        &self,
        aid: &AgentId,
        requested_name: &str,
        signing_key: &AgentSigningKey,
    ) -> Result<String, AuthApiError> {
        let url = self.build_url(ENDPOINT_CSR)?;
        let public_key = signing_key.verifying_key().to_base64();
        let payload = CsrRequest::signature_payload(aid, requested_name, &public_key);
        let body = CsrRequest {
            aid: aid.clone(),
            requested_name: requested_name.to_owned(),
            public_key,
            signature: signing_key.sign(&payload),
        };
        let response = self.post(url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuthApiError::RequestRejected { status });
        }
        let response: CsrResponse = response
            .json()
            .await
            .map_err(AuthApiError::MalformedResponse)?;
        validate_certificate_pem(&response.cert_chain_pem)?;
        Ok(response.cert_chain_pem)
    }

    /// Sign the given agent out, invalidating its presence ticket.
    pub async fn sign_out(
        &self,
        aid: &AgentId,
        signing_key: &AgentSigningKey,
    ) -> Result<(), AuthApiError> {
        let url = self.build_url(ENDPOINT_SIGNOUT)?;
        let payload = SignOutRequest::signature_payload(aid);
        let body = SignOutRequest {
            aid: aid.clone(),
            signature: signing_key.sign(&payload),
        };
        let response = self.post(url).json(&body).send().await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => Err(AuthApiError::AuthenticationFailed),
            status => Err(AuthApiError::RequestRejected { status }),
        }
    }

    /// Fetch the authority's published certificate and match it against the
    /// local expectation.
    pub async fn verify_server_cert(&self, expected_pem: &str) -> Result<(), AuthApiError> {
        let url = self.build_url(ENDPOINT_SERVER_CERT)?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuthApiError::RequestRejected { status });
        }
        let published = response.text().await?;
        validate_certificate_pem(&published)?;
        if published.trim() != expected_pem.trim() {
            return Err(AuthApiError::CertificateMismatch);
        }
        Ok(())
    }
}

fn sign_in_request(aid: &AgentId, signing_key: &AgentSigningKey) -> SignInRequest {
    let timestamp = TimeStamp::now();
    let mut nonce_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = hex::encode(nonce_bytes);
    let payload = SignInRequest::signature_payload(aid, timestamp, &nonce);
    SignInRequest {
        aid: aid.clone(),
        timestamp,
        nonce,
        signature: signing_key.sign(&payload),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;

    fn test_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
        }
    }

    fn alice() -> AgentId {
        "alice.example.com".parse().unwrap()
    }

    fn ticket_body() -> serde_json::Value {
        json!({
            "server_ip": "127.0.0.1",
            "port": 9478,
            "interval": 10,
            "ws_url": "ws://127.0.0.1:9479/ws",
            "sign_cookie": "cookie",
        })
    }

    #[tokio::test]
    async fn sign_in_returns_a_ticket() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(ENDPOINT_SIGNIN))
            .respond_with(ResponseTemplate::new(200).set_body_json(ticket_body()))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::initialize(server.uri()).unwrap();
        let key = AgentSigningKey::generate().unwrap();
        let ticket = client
            .sign_in(&alice(), &key, test_policy())
            .await
            .unwrap();
        assert_eq!(ticket.aid, alice());
        assert_eq!(ticket.heartbeat_port, 9478);
        assert_eq!(ticket.interval, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn sign_in_retries_transient_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(ENDPOINT_SIGNIN))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(ENDPOINT_SIGNIN))
            .respond_with(ResponseTemplate::new(200).set_body_json(ticket_body()))
            .mount(&server)
            .await;

        let client = ApiClient::initialize(server.uri()).unwrap();
        let key = AgentSigningKey::generate().unwrap();
        let ticket = client
            .sign_in(&alice(), &key, test_policy())
            .await
            .unwrap();
        assert_eq!(ticket.aid, alice());
    }

    #[tokio::test]
    async fn sign_in_gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(ENDPOINT_SIGNIN))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let client = ApiClient::initialize(server.uri()).unwrap();
        let key = AgentSigningKey::generate().unwrap();
        let error = client
            .sign_in(&alice(), &key, test_policy())
            .await
            .unwrap_err();
        match error {
            AuthApiError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sign_in_does_not_retry_auth_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(ENDPOINT_SIGNIN))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::initialize(server.uri()).unwrap();
        let key = AgentSigningKey::generate().unwrap();
        let error = client
            .sign_in(&alice(), &key, test_policy())
            .await
            .unwrap_err();
        assert!(matches!(error, AuthApiError::AuthenticationFailed));
    }

    #[tokio::test]
    async fn verify_server_cert_matches_expectation() {
        let pem_text = pem_block();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(ENDPOINT_SERVER_CERT))
            .respond_with(ResponseTemplate::new(200).set_body_string(pem_text.clone()))
            .mount(&server)
            .await;

        let client = ApiClient::initialize(server.uri()).unwrap();
        client.verify_server_cert(&pem_text).await.unwrap();

        let other = pem::encode(&pem::Pem::new("CERTIFICATE", vec![9, 9, 9]));
        let error = client.verify_server_cert(&other).await.unwrap_err();
        assert!(matches!(error, AuthApiError::CertificateMismatch));
    }

    fn pem_block() -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE", vec![1, 2, 3]))
    }
}
