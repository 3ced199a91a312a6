// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wall-clock timestamps as they appear on the wire.
//!
//! All protocol timestamps are unix epoch milliseconds. Server-side ingest
//! overwrites the timestamp of routed envelopes, so client clocks only matter
//! for signature freshness windows.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TimeStamp {
    millis: i64,
}

impl TimeStamp {
    pub fn now() -> Self {
        Self {
            millis: Utc::now().timestamp_millis(),
        }
    }

    pub fn from_millis(millis: i64) -> Self {
        Self { millis }
    }

    pub fn as_millis(&self) -> i64 {
        self.millis
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.millis)
    }

    /// The `YYYY-MM-DD` day boundary this timestamp falls into, used as the
    /// key for group log checksums.
    pub fn checksum_date(&self) -> Option<String> {
        self.as_datetime()
            .map(|dt| dt.format("%Y-%m-%d").to_string())
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_datetime() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}ms", self.millis),
        }
    }
}
