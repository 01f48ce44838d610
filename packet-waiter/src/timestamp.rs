//! Receive-timestamp monotonicity tracking.
//!
//! Sockets stamp every datagram with a receive time.  Within one socket
//! those stamps must never go backwards, and a missing stamp is a bug in the
//! socket under test.  [`TimestampTracker`] checks each timestamp against
//! the previous one, in the order packets are handed to the caller.

/// Remembers the last checked timestamp.
#[derive(Debug, Clone, Default)]
pub struct TimestampTracker {
    prev: Option<i64>,
}

impl TimestampTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check `timestamp` and record it as the new previous value.
    ///
    /// Rejects an unset timestamp, and one earlier than the previous.  Equal
    /// consecutive timestamps are accepted.  The value is recorded whether or
    /// not it passes, so an unset timestamp clears the history.
    pub fn check(&mut self, timestamp: Option<i64>) -> bool {
        let ok = match (timestamp, self.prev) {
            (None, _) => false,
            (Some(ts), Some(prev)) => ts >= prev,
            (Some(_), None) => true,
        };
        self.prev = timestamp;
        ok
    }

    /// Timestamp recorded by the most recent [`check`](Self::check).
    pub fn previous(&self) -> Option<i64> {
        self.prev
    }
}
