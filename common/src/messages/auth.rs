// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bodies of the entry-point endpoints and the presence ticket they yield.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    crypto::signatures::Signature,
    identifiers::AgentId,
    time::TimeStamp,
};

/// Signed proof-of-possession posted to `/signin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignInRequest {
    pub aid: AgentId,
    pub timestamp: TimeStamp,
    pub nonce: String,
    pub signature: Signature,
}

impl SignInRequest {
    /// The byte string covered by the request signature.
    pub fn signature_payload(aid: &AgentId, timestamp: TimeStamp, nonce: &str) -> Vec<u8> {
        format!("signin|{aid}|{}|{nonce}", timestamp.as_millis()).into_bytes()
    }
}

/// Successful `/signin` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignInResponse {
    pub server_ip: String,
    pub port: u16,
    /// Suggested heartbeat interval in seconds.
    pub interval: u32,
    pub ws_url: Url,
    pub sign_cookie: String,
}

/// Body of `/signout`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignOutRequest {
    pub aid: AgentId,
    pub signature: Signature,
}

impl SignOutRequest {
    pub fn signature_payload(aid: &AgentId) -> Vec<u8> {
        format!("signout|{aid}").into_bytes()
    }
}

/// Certificate signing request posted to the authority during identity
/// creation. Self-signed with the fresh key so the authority can check
/// possession.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrRequest {
    pub aid: AgentId,
    pub requested_name: String,
    /// Base64 of the raw Ed25519 public key.
    pub public_key: String,
    pub signature: Signature,
}

impl CsrRequest {
    pub fn signature_payload(aid: &AgentId, requested_name: &str, public_key: &str) -> Vec<u8> {
        format!("csr|{aid}|{requested_name}|{public_key}").into_bytes()
    }
}

/// Response to a CSR: the signed certificate chain in PEM form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrResponse {
    pub cert_chain_pem: String,
}

/// A presence ticket, bound to the agent id that signed in. Using it from a
/// different id is a protocol error, so the binding is part of the type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub aid: AgentId,
    pub signalling_url: Url,
    pub heartbeat_host: String,
    pub heartbeat_port: u16,
    pub sign_cookie: String,
    /// Server-suggested heartbeat interval.
    pub interval: Duration,
}

impl Ticket {
    pub fn from_response(aid: AgentId, response: SignInResponse) -> Self {
        Self {
            aid,
            signalling_url: response.ws_url,
            heartbeat_host: response.server_ip,
            heartbeat_port: response.port,
            sign_cookie: response.sign_cookie,
            interval: Duration::from_secs(response.interval.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_binds_the_signed_in_aid() {
        let response = SignInResponse {
            server_ip: "203.0.113.7".into(),
            port: 9478,
            interval: 10,
            ws_url: "wss://ap.example.com/ws".parse().unwrap(),
            sign_cookie: "cookie".into(),
        };
        let aid: AgentId = "alice.example.com".parse().unwrap();
        let ticket = Ticket::from_response(aid.clone(), response);
        assert_eq!(ticket.aid, aid);
        assert_eq!(ticket.interval, Duration::from_secs(10));
    }
}
