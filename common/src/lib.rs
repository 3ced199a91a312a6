// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Common data model used by the AgentCP client crates.

pub mod codec;
pub mod crypto;
pub mod identifiers;
pub mod messages;
pub mod time;

pub const DEFAULT_PORT_HTTP: u16 = 8080;
pub const DEFAULT_PORT_HTTPS: u16 = 443;
pub const DEFAULT_PORT_HEARTBEAT: u16 = 9478;

pub const ACCEPTED_API_VERSIONS_HEADER: &str = "x-accepted-api-versions";
pub const ACCEPTED_API_VERSIONS: &str = "1";

/// Ceiling for a serialized envelope on the signalling transport.
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;
