// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire messages of the three protocol planes: entry-point HTTP, UDP
//! heartbeat, and the signalling / group streams.

pub mod auth;
pub mod group;
pub mod heartbeat;
pub mod signalling;
