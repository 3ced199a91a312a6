// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The signalling transport: a long-lived websocket carrying JSON text
//! frames between the agent and the presence server named in its ticket.

mod ws;

pub use ws::{SignallingConnection, SignallingConnectError, SignallingSendError};

use acpcommon::messages::signalling::Envelope;

/// Connection status of the signalling transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Error,
}

/// Events emitted by the transport: status changes interleaved with decoded
/// frames.
#[derive(Debug, Clone, PartialEq)]
pub enum SignallingEvent {
    StatusChange(ConnectionStatus),
    Frame(Envelope),
}

/// Header carrying the agent id during the websocket handshake.
pub const AID_HEADER: &str = "x-acp-aid";
/// Header carrying the ticket's sign cookie during the handshake.
pub const COOKIE_HEADER: &str = "x-acp-cookie";
