// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Binary layout of the UDP heartbeat plane.
//!
//! Request datagram:
//! `[ver:u8][aid_len:u8][aid][ts:u64 be][sig_len:u16 be][signature]`
//!
//! Response datagram:
//! `[ver:u8][code:i32 be][next_beat:u32 be]`

use thiserror::Error;

use crate::{crypto::signatures::Signature, identifiers::AgentId, time::TimeStamp};

pub const HEARTBEAT_VERSION: u8 = 1;

/// Response code signalling that the presence ticket is no longer accepted
/// and the client must sign in again.
pub const HEARTBEAT_CODE_REAUTHENTICATE: i32 = 401;
pub const HEARTBEAT_CODE_OK: i32 = 200;

const RESPONSE_SIZE: usize = 1 + 4 + 4;

/// A signed heartbeat datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRecord {
    pub aid: AgentId,
    /// Unix epoch milliseconds at send time.
    pub timestamp: u64,
    pub signature: Signature,
}

impl HeartbeatRecord {
    /// The byte string covered by the heartbeat signature: the id, the
    /// timestamp, and the sign cookie from the ticket.
    pub fn signature_payload(aid: &AgentId, timestamp: u64, sign_cookie: &str) -> Vec<u8> {
        format!("beat|{aid}|{timestamp}|{sign_cookie}").into_bytes()
    }

    pub fn new_signed(
        aid: AgentId,
        sign_cookie: &str,
        sign: impl FnOnce(&[u8]) -> Signature,
    ) -> Self {
        let timestamp = TimeStamp::now().as_millis() as u64;
        let payload = Self::signature_payload(&aid, timestamp, sign_cookie);
        let signature = sign(&payload);
        Self {
            aid,
            timestamp,
            signature,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, HeartbeatCodecError> {
        let aid = self.aid.to_string();
        let aid_len: u8 = aid
            .len()
            .try_into()
            .map_err(|_| HeartbeatCodecError::AidTooLong)?;
        let sig = self.signature.as_slice();
        let sig_len: u16 = sig
            .len()
            .try_into()
            .map_err(|_| HeartbeatCodecError::SignatureTooLong)?;

        let mut buf = Vec::with_capacity(1 + 1 + aid.len() + 8 + 2 + sig.len());
        buf.push(HEARTBEAT_VERSION);
        buf.push(aid_len);
        buf.extend_from_slice(aid.as_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&sig_len.to_be_bytes());
        buf.extend_from_slice(sig);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HeartbeatCodecError> {
        let (&version, rest) = bytes
            .split_first()
            .ok_or(HeartbeatCodecError::Truncated)?;
        if version != HEARTBEAT_VERSION {
            return Err(HeartbeatCodecError::UnknownVersion(version));
        }
        let (&aid_len, rest) = rest.split_first().ok_or(HeartbeatCodecError::Truncated)?;
        let aid_len = aid_len as usize;
        if rest.len() < aid_len + 8 + 2 {
            return Err(HeartbeatCodecError::Truncated);
        }
        let (aid_bytes, rest) = rest.split_at(aid_len);
        let aid: AgentId = std::str::from_utf8(aid_bytes)
            .map_err(|_| HeartbeatCodecError::MalformedAid)?
            .parse()
            .map_err(|_| HeartbeatCodecError::MalformedAid)?;
        let (ts_bytes, rest) = rest.split_at(8);
        let timestamp = u64::from_be_bytes(ts_bytes.try_into().unwrap());
        let (sig_len_bytes, rest) = rest.split_at(2);
        let sig_len = u16::from_be_bytes(sig_len_bytes.try_into().unwrap()) as usize;
        if rest.len() != sig_len {
            return Err(HeartbeatCodecError::Truncated);
        }
        Ok(Self {
            aid,
            timestamp,
            signature: Signature::from_bytes(rest.to_vec()),
        })
    }
}

/// A heartbeat response datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatResponse {
    pub code: i32,
    /// Server-suggested seconds until the next beat.
    pub next_beat: u32,
}

impl HeartbeatResponse {
    pub fn is_reauthenticate(&self) -> bool {
        self.code == HEARTBEAT_CODE_REAUTHENTICATE
    }

    pub fn encode(&self) -> [u8; RESPONSE_SIZE] {
        let mut buf = [0u8; RESPONSE_SIZE];
        buf[0] = HEARTBEAT_VERSION;
        buf[1..5].copy_from_slice(&self.code.to_be_bytes());
        buf[5..9].copy_from_slice(&self.next_beat.to_be_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HeartbeatCodecError> {
        if bytes.len() != RESPONSE_SIZE {
            return Err(HeartbeatCodecError::Truncated);
        }
        if bytes[0] != HEARTBEAT_VERSION {
            return Err(HeartbeatCodecError::UnknownVersion(bytes[0]));
        }
        Ok(Self {
            code: i32::from_be_bytes(bytes[1..5].try_into().unwrap()),
            next_beat: u32::from_be_bytes(bytes[5..9].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Error)]
pub enum HeartbeatCodecError {
    #[error("Datagram is truncated")]
    Truncated,
    #[error("Unknown heartbeat version {0}")]
    UnknownVersion(u8),
    #[error("Agent id exceeds the one-byte length prefix")]
    AidTooLong,
    #[error("Signature exceeds the two-byte length prefix")]
    SignatureTooLong,
    #[error("Agent id is not valid UTF-8 or not a valid id")]
    MalformedAid,
}
