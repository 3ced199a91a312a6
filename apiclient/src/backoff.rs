// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::time::Duration;

/// Exponential backoff between an initial delay and a cap. Used by sign-in
/// retries and the reconnect paths of the heartbeat and signalling loops.
pub(crate) struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The delay to sleep before the next attempt. Doubles on each call up
    /// to the cap.
    #[must_use]
    pub(crate) fn next_backoff(&mut self) -> Duration {
        let backoff = self.current;
        self.current = (self.current * 2).min(self.max);
        backoff
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_the_cap() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let expected = [1, 2, 4, 8, 16, 30, 30];
        for secs in expected {
            assert_eq!(backoff.next_backoff(), Duration::from_secs(secs));
        }
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let _ = backoff.next_backoff();
        let _ = backoff.next_backoff();
        backoff.reset();
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
    }
}
