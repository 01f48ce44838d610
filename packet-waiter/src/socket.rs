//! Packet-socket collaborator contract.
//!
//! [`PacketSocket`] is the narrow interface the waiter needs from a datagram
//! socket: send, report errors, get/set options, report its connection
//! state, and deliver inbound notifications to a registered
//! [`SocketListener`].  Return codes follow `sendto(2)`: a non-negative byte
//! count on success, a negative value on failure with the cause available
//! from [`PacketSocket::error`].  The waiter passes these codes through
//! untouched.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::packet::{PacketOptions, PacketTime};
use crate::state::SocketState;

/// `EBADF`: the socket has been closed.
pub const EBADF: i32 = 9;
/// `EINVAL`: an option value out of range.
pub const EINVAL: i32 = 22;
/// `ENOPROTOOPT`: the option is not supported by this socket.
pub const ENOPROTOOPT: i32 = 92;
/// `ENOTCONN`: a connected-mode send on an unconnected socket.
pub const ENOTCONN: i32 = 107;

/// Socket-level options passed through to the implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOption {
    /// IP time-to-live for unicast datagrams.
    Ttl,
    /// Permit sending to broadcast addresses (0 or 1).
    Broadcast,
    /// Loop IPv4 multicast back to the local host (0 or 1).
    MulticastLoopV4,
    /// IP time-to-live for IPv4 multicast datagrams.
    MulticastTtlV4,
    /// Receive buffer size in bytes.
    RecvBuffer,
    /// Send buffer size in bytes.
    SendBuffer,
    /// DSCP marking applied to every outbound datagram.
    Dscp,
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Receiver of asynchronous socket notifications.
///
/// Implementations must tolerate being called from whatever thread the
/// socket delivers on, including concurrently with the consumer.
pub trait SocketListener: Send + Sync {
    /// A datagram of `data` arrived from `remote`.
    ///
    /// `data` is only borrowed for the duration of the call.
    fn on_packet(&self, data: &[u8], remote: SocketAddr, packet_time: PacketTime);

    /// The socket became writable again after a send would have blocked.
    fn on_ready_to_send(&self);
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// A datagram socket the waiter can wrap.
pub trait PacketSocket: Send {
    /// Send `buf` to the connected peer.
    fn send(&self, buf: &[u8], options: &PacketOptions) -> i32;

    /// Send `buf` to `dest`.
    fn send_to(&self, buf: &[u8], dest: SocketAddr, options: &PacketOptions) -> i32;

    /// Error code recorded by the most recent failing call, or 0.
    fn error(&self) -> i32;

    /// Read an option.  `Err` carries the raw error code.
    fn option(&self, opt: SocketOption) -> Result<i32, i32>;

    /// Set an option.  Returns 0 on success, negative on failure.
    fn set_option(&self, opt: SocketOption, value: i32) -> i32;

    /// Current connection state.
    fn state(&self) -> SocketState;

    /// Local address, once bound.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Connected peer, if any.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Register the receiver of inbound notifications, replacing any
    /// previous one.
    fn set_listener(&mut self, listener: Arc<dyn SocketListener>);
}
