//! Connection-state types for the wrapped packet socket.
//!
//! A [`crate::socket::PacketSocket`] reports one of these states through
//! [`crate::socket::PacketSocket::state`].  The waiter never drives
//! transitions itself; it only polls for them in
//! [`crate::waiter::PacketWaiter::check_conn_state`].
//!
//! ```text
//!  CLOSED ──bind──▶ BINDING ──▶ BOUND ──connect──▶ CONNECTING ──▶ CONNECTED
//!    ▲                                                                │
//!    └──────────────────────────── close ─────────────────────────────┘
//! ```

/// Lifecycle state of a packet socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SocketState {
    /// Not bound, or closed after use.
    #[default]
    Closed,
    /// Bind requested; local address not yet assigned.
    Binding,
    /// Bound to a local address; datagrams may be sent to any peer.
    Bound,
    /// Connect requested; peer not yet confirmed.
    Connecting,
    /// Associated with a single remote peer.
    Connected,
}

impl std::fmt::Display for SocketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Binding => "binding",
            Self::Bound => "bound",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_closed() {
        assert_eq!(SocketState::default(), SocketState::Closed);
    }

    #[test]
    fn display_is_lowercase() {
        assert_eq!(SocketState::Connected.to_string(), "connected");
        assert_eq!(SocketState::Binding.to_string(), "binding");
    }
}
