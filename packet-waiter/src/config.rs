//! Wait bounds used by [`crate::waiter::PacketWaiter`].

use std::time::Duration;

/// Timeouts and polling granularity for a waiter.
///
/// The defaults suit loopback tests: a packet that is coming shows up well
/// inside `timeout`, and `no_packet_timeout` is long enough that a stray one
/// would have landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterConfig {
    /// Bound for [`check_next_packet`](crate::waiter::PacketWaiter::check_next_packet)
    /// and [`wait_for_conn_state`](crate::waiter::PacketWaiter::wait_for_conn_state).
    pub timeout: Duration,
    /// Window for [`check_no_packet`](crate::waiter::PacketWaiter::check_no_packet).
    pub no_packet_timeout: Duration,
    /// How far time advances per polling step.
    pub tick: Duration,
}

impl Default for WaiterConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            no_packet_timeout: Duration::from_secs(1),
            tick: Duration::from_millis(1),
        }
    }
}

impl WaiterConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_no_packet_timeout(mut self, timeout: Duration) -> Self {
        self.no_packet_timeout = timeout;
        self
    }

    /// Set the polling step.  A zero step is raised to 1 µs so waits always
    /// make progress.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_micros(1));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = WaiterConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.no_packet_timeout, Duration::from_secs(1));
        assert_eq!(config.tick, Duration::from_millis(1));
    }

    #[test]
    fn zero_tick_is_raised() {
        let config = WaiterConfig::default().with_tick(Duration::ZERO);
        assert_eq!(config.tick, Duration::from_micros(1));
    }
}
