//! Value types for datagrams crossing the socket boundary.
//!
//! Every datagram handed to the waiter by a socket becomes a
//! [`ReceivedPacket`].  This module is responsible for:
//! - Owning the received bytes (the socket's buffer is copied on arrival).
//! - Carrying the sender address and receive time alongside the payload.
//! - Describing the per-send options passed back down to the socket.
//!
//! No I/O happens here; this is pure data.

use std::net::SocketAddr;

/// Receive-time metadata attached to a datagram by the socket layer.
///
/// Times are microseconds on the socket's own monotonic clock.  `None` means
/// the socket did not stamp the packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketTime {
    /// When the packet was received.
    pub timestamp: Option<i64>,
    /// Earliest time the packet could have been received.
    pub not_before: Option<i64>,
}

impl PacketTime {
    /// A packet time with a receive timestamp and no lower bound.
    pub fn at(timestamp: i64) -> Self {
        Self {
            timestamp: Some(timestamp),
            not_before: None,
        }
    }

    /// A packet time with no timestamp at all.
    pub fn unset() -> Self {
        Self::default()
    }
}

/// Options for a single outbound datagram.
///
/// The waiter always sends with the defaults; sockets may honour or ignore
/// individual fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketOptions {
    /// Differentiated-services code point to mark the datagram with.
    pub dscp: Option<u8>,
    /// Caller-chosen identifier echoed back by sockets that track sends.
    pub packet_id: Option<i32>,
}

/// One datagram received from the wrapped socket.
///
/// Constructed by copying the socket's buffer, so a packet never aliases
/// memory owned by the socket.  `Clone` performs a full copy of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    addr: SocketAddr,
    data: Vec<u8>,
    packet_time: PacketTime,
}

impl ReceivedPacket {
    /// Copy `data` into a new packet from `addr`.
    pub fn new(addr: SocketAddr, data: &[u8], packet_time: PacketTime) -> Self {
        Self {
            addr,
            data: data.to_vec(),
            packet_time,
        }
    }

    /// Address the datagram came from.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Payload bytes, exactly as received.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload length in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn packet_time(&self) -> PacketTime {
        self.packet_time
    }

    /// Consume the packet and return its payload without copying.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn new_copies_buffer() {
        let mut buf = *b"hello";
        let pkt = ReceivedPacket::new(addr(), &buf, PacketTime::at(10));
        buf[0] = b'j';
        assert_eq!(pkt.data(), b"hello");
        assert_eq!(pkt.size(), 5);
    }

    #[test]
    fn clone_is_independent() {
        let pkt = ReceivedPacket::new(addr(), b"abc", PacketTime::at(1));
        let copy = pkt.clone();
        let mut owned = pkt.into_data();
        owned[0] = b'z';
        assert_eq!(copy.data(), b"abc");
        assert_eq!(owned, b"zbc");
    }

    #[test]
    fn size_matches_empty_payload() {
        let pkt = ReceivedPacket::new(addr(), &[], PacketTime::unset());
        assert_eq!(pkt.size(), 0);
        assert_eq!(pkt.packet_time().timestamp, None);
    }

    #[test]
    fn at_sets_only_timestamp() {
        let t = PacketTime::at(42);
        assert_eq!(t.timestamp, Some(42));
        assert_eq!(t.not_before, None);
    }

    #[test]
    fn default_options_are_empty() {
        let opts = PacketOptions::default();
        assert_eq!(opts.dscp, None);
        assert_eq!(opts.packet_id, None);
    }
}
