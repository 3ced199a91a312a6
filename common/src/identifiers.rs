// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Identifiers of the agent fabric: authorities, agent ids, sessions, groups
//! and messages.

use std::{fmt, str::FromStr};

use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize, de};
use thiserror::Error;
use url::Host;
use uuid::Uuid;

/// The domain of the authority an agent is registered with. Authorities are
/// addressed by domain name, never by IP address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Authority {
    domain: Host<String>,
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.domain)
    }
}

#[derive(Debug, Clone, Error)]
pub enum AuthorityError {
    #[error("The given string does not represent a valid domain name.")]
    NotADomainName,
    #[error(transparent)]
    UrlError(#[from] url::ParseError),
}

impl FromStr for Authority {
    type Err = AuthorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Arbitrary upper limit so ids stay short enough for the heartbeat
        // datagram's one-byte length prefix.
        if s.len() > 100 {
            return Err(AuthorityError::NotADomainName);
        }
        match Host::parse(s)? {
            domain @ Host::Domain(_) => Ok(Self { domain }),
            Host::Ipv4(_) | Host::Ipv6(_) => Err(AuthorityError::NotADomainName),
        }
    }
}

impl Serialize for Authority {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Authority {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A fully qualified agent id of the form `<local>.<authority>`.
///
/// The local part is chosen at identity creation; the authority is the domain
/// of the entry point that signed the identity's certificate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId {
    local: String,
    authority: Authority,
}

/// Local name prefix of ephemeral guest identities.
pub const GUEST_PREFIX: &str = "guest";

impl AgentId {
    pub fn new(local: String, authority: Authority) -> Result<Self, AgentIdError> {
        if local.is_empty()
            || !local
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(AgentIdError::InvalidLocalPart);
        }
        Ok(Self { local, authority })
    }

    /// Create a fresh guest id under the given authority. The local part is
    /// random and prefixed with `guest`.
    pub fn random_guest(authority: Authority) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(|c| (c as char).to_ascii_lowercase())
            .collect();
        Self {
            local: format!("{GUEST_PREFIX}{suffix}"),
            authority,
        }
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn is_guest(&self) -> bool {
        self.local.starts_with(GUEST_PREFIX)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.local, self.authority)
    }
}

#[derive(Debug, Clone, Error)]
pub enum AgentIdError {
    #[error("An agent id must have the form <local>.<authority>.")]
    MissingSeparator,
    #[error("The local part of an agent id must be non-empty and alphanumeric.")]
    InvalidLocalPart,
    #[error(transparent)]
    Authority(#[from] AuthorityError),
}

impl FromStr for AgentId {
    type Err = AgentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The authority itself contains dots, so only the first one separates.
        let (local, authority) = s.split_once('.').ok_or(AgentIdError::MissingSeparator)?;
        Self::new(local.to_owned(), authority.parse()?)
    }
}

impl Serialize for AgentId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AgentId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Server-issued id of a session on the signalling plane.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id of a group on the group server.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-sender unique message id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_round_trip() {
        let aid: AgentId = "alice.example.com".parse().unwrap();
        assert_eq!(aid.local(), "alice");
        assert_eq!(aid.authority().to_string(), "example.com");
        assert_eq!(aid.to_string(), "alice.example.com");
    }

    #[test]
    fn agent_id_rejects_malformed() {
        assert!("alice".parse::<AgentId>().is_err());
        assert!(".example.com".parse::<AgentId>().is_err());
        assert!("alice.127.0.0.1".parse::<AgentId>().is_err());
        assert!("al ice.example.com".parse::<AgentId>().is_err());
    }

    #[test]
    fn guest_ids_are_marked() {
        let authority: Authority = "example.com".parse().unwrap();
        let guest = AgentId::random_guest(authority);
        assert!(guest.is_guest());
        assert!(guest.local().starts_with(GUEST_PREFIX));
        // Round-trips through its string form like any other id.
        let reparsed: AgentId = guest.to_string().parse().unwrap();
        assert_eq!(guest, reparsed);
    }

    #[test]
    fn agent_id_serde_is_a_string() {
        let aid: AgentId = "bob.example.com".parse().unwrap();
        let json = serde_json::to_string(&aid).unwrap();
        assert_eq!(json, "\"bob.example.com\"");
        let back: AgentId = serde_json::from_str(&json).unwrap();
        assert_eq!(aid, back);
    }
}
