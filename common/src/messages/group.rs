// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Request, response and push shapes of the group server, plus the domain
//! types of the group plane (roles, membership, invite codes, broadcast
//! leases, log checksums).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    crypto::signatures::Signature,
    identifiers::{AgentId, GroupId},
    time::TimeStamp,
};

/// Every group server call is a signed request naming the operation, the
/// group, the actor and a nonce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRequest {
    pub op: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub actor: AgentId,
    pub nonce: String,
    pub sig: Signature,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl GroupRequest {
    /// The byte string covered by the request signature.
    pub fn signature_payload(
        op: &str,
        group_id: Option<&GroupId>,
        actor: &AgentId,
        nonce: &str,
        params: &Value,
    ) -> Vec<u8> {
        let group = group_id.map(|g| g.as_str()).unwrap_or("");
        format!("{op}|{group}|{actor}|{nonce}|{params}").into_bytes()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<GroupErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupErrorBody {
    pub code: String,
    pub message: String,
}

/// Well-known error codes of the group server.
pub mod error_codes {
    pub const NOT_FOUND: &str = "not_found";
    pub const FORBIDDEN: &str = "forbidden";
    pub const CONFLICT: &str = "conflict";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const EXPIRED: &str = "expired";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushKind {
    Batch,
    Event,
}

/// A push notification from the group server. Batches carry message log
/// entries; events carry a single event log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupPush {
    pub push: PushKind,
    pub group_id: GroupId,
    pub payload: Value,
}

/// One entry of a group's message log. Ids are strictly increasing per
/// group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupLogMessage {
    pub msg_id: u64,
    pub sender: AgentId,
    pub ts: TimeStamp,
    pub content: Value,
    /// Set on re-delivery during backfill so consumers can dedupe.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replay: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupEventKind {
    MemberJoined,
    MemberLeft,
    MemberKicked,
    MemberBanned,
    MemberUnbanned,
    JoinRequested,
    JoinApproved,
    JoinRejected,
    RoleChanged,
    AdminPromoted,
    AdminDemoted,
    OwnershipTransferred,
    RulesChanged,
    AnnouncementChanged,
    GroupSuspended,
    GroupResumed,
}

/// One entry of a group's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupLogEvent {
    pub event_id: u64,
    pub kind: GroupEventKind,
    pub actor: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<AgentId>,
    pub ts: TimeStamp,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replay: bool,
}

/// Role of a member inside a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupRole {
    Member,
    Admin,
    Owner,
}

/// Membership state of an agent with respect to a group, including the
/// back-edges out of membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipState {
    NonMember,
    Pending,
    Member,
    Admin,
    Owner,
    Banned,
    Left,
}

impl MembershipState {
    pub fn role(&self) -> Option<GroupRole> {
        match self {
            MembershipState::Member => Some(GroupRole::Member),
            MembershipState::Admin => Some(GroupRole::Admin),
            MembershipState::Owner => Some(GroupRole::Owner),
            _ => None,
        }
    }

    pub fn is_member(&self) -> bool {
        self.role().is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupVisibility {
    Public,
    Private,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub aid: AgentId,
    pub role: GroupRole,
    pub joined_at: TimeStamp,
}

/// Server-side view of a group, as returned by the info operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group_id: GroupId,
    pub owner: AgentId,
    pub visibility: GroupVisibility,
    #[serde(default)]
    pub rules: BTreeMap<String, String>,
    #[serde(default)]
    pub announcement: String,
    #[serde(default)]
    pub admins: Vec<AgentId>,
    #[serde(default)]
    pub member_count: u64,
    #[serde(default)]
    pub suspended: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InviteCodeInfo {
    pub code: String,
    pub group_id: GroupId,
    #[serde(default)]
    pub label: String,
    pub max_uses: u32,
    pub uses: u32,
    pub expires_at: TimeStamp,
}

impl InviteCodeInfo {
    pub fn is_exhausted(&self) -> bool {
        self.uses >= self.max_uses
    }
}

/// A broadcast lock lease. At most one holder per group at a time; the
/// server expires the lease if the holder disappears.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastLease {
    pub group_id: GroupId,
    pub holder: AgentId,
    pub lease_until: TimeStamp,
}

/// Daily checksums over a group's two logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogChecksums {
    pub date: String,
    pub message_checksum: String,
    pub event_checksum: String,
}

/// Batch shape returned by the pull operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBatch {
    pub group_id: GroupId,
    pub messages: Vec<GroupLogMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatch {
    pub group_id: GroupId,
    pub events: Vec<GroupLogEvent>,
}

#[derive(Debug, Error)]
pub enum GroupWireError {
    #[error("Push payload does not match its push kind")]
    PayloadMismatch(#[source] serde_json::Error),
}

impl GroupPush {
    /// Decode the payload of a batch push.
    pub fn message_batch(&self) -> Result<MessageBatch, GroupWireError> {
        serde_json::from_value(self.payload.clone()).map_err(GroupWireError::PayloadMismatch)
    }

    /// Decode the payload of an event push.
    pub fn event(&self) -> Result<GroupLogEvent, GroupWireError> {
        serde_json::from_value(self.payload.clone()).map_err(GroupWireError::PayloadMismatch)
    }
}
