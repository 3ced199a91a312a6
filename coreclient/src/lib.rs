// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Client-side protocol logic of the agent fabric: the identity store, the
//! session manager, the group client with its sync engine, and the
//! [`AgentCp`] facade composing them.

pub mod clients;
pub mod errors;
pub mod groups;
pub mod identities;
pub(crate) mod logging;
pub mod sessions;

pub use clients::AgentCp;
pub use errors::{CoreError, ErrorCode};

// Re-exports of the data model user code interacts with.
pub use acpcommon::{
    identifiers::{AgentId, Authority, GroupId, MessageId, SessionId},
    messages::{
        auth::Ticket,
        group::{
            BroadcastLease, GroupInfo, GroupLogEvent, GroupLogMessage, GroupRole,
            InviteCodeInfo, LogChecksums, MembershipState,
        },
        signalling::{Block, BlockType, Envelope, FrameType},
    },
};
pub use acpapiclient::{heartbeat::HeartbeatState, signalling::ConnectionStatus};
