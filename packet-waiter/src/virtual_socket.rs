//! In-memory packet socket for deterministic testing.
//!
//! [`VirtualSocket`] implements [`PacketSocket`] without touching the OS.
//! Test code holds a clone of the socket and plays the part of the network:
//!
//! | Call                     | Effect                                          |
//! |--------------------------|-------------------------------------------------|
//! | `deliver`                | Hand a datagram to the registered listener.     |
//! | `signal_ready_to_send`   | Fire the listener's ready-to-send notification. |
//! | `set_state`              | Change the reported connection state.           |
//! | `fail_sends`             | Make every send fail with the given error code. |
//! | `sent`                   | Inspect the datagrams the waiter sent.          |
//!
//! Notifications are delivered synchronously on the calling thread.  To
//! model a socket that delivers on another thread, call `deliver` from that
//! thread; to model delivery through an event loop, post the call to an
//! [`crate::scheduler::EventQueue`] or a [`crate::clock::SimulatedClock`]
//! timer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::packet::{PacketOptions, PacketTime};
use crate::socket::{PacketSocket, SocketListener, SocketOption, ENOPROTOOPT, ENOTCONN};
use crate::state::SocketState;

/// One datagram handed to the socket by a send call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    /// `None` for a connected-mode send.
    pub dest: Option<SocketAddr>,
    pub data: Vec<u8>,
    pub options: PacketOptions,
}

struct VirtualInner {
    local: SocketAddr,
    remote: Option<SocketAddr>,
    state: SocketState,
    listener: Option<Arc<dyn SocketListener>>,
    sent: Vec<SentDatagram>,
    options: HashMap<SocketOption, i32>,
    error: i32,
    send_failure: Option<i32>,
}

/// A scriptable, cloneable in-memory socket.
///
/// All clones share one socket, so a test can keep a handle after moving
/// another into a [`crate::waiter::PacketWaiter`].
#[derive(Clone)]
pub struct VirtualSocket {
    inner: Arc<Mutex<VirtualInner>>,
}

impl VirtualSocket {
    /// A socket bound to `local`.
    pub fn new(local: SocketAddr) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VirtualInner {
                local,
                remote: None,
                state: SocketState::Bound,
                listener: None,
                sent: Vec::new(),
                options: HashMap::new(),
                error: 0,
                send_failure: None,
            })),
        }
    }

    /// Deliver a datagram to the listener.
    ///
    /// Returns `false` (and drops the datagram) if no listener is registered.
    pub fn deliver(&self, data: &[u8], from: SocketAddr, packet_time: PacketTime) -> bool {
        // Call out with the socket unlocked; the listener may call back in.
        let listener = self.lock().listener.clone();
        match listener {
            Some(listener) => {
                log::trace!("[vsock] deliver {} bytes from {from}", data.len());
                listener.on_packet(data, from, packet_time);
                true
            }
            None => {
                log::debug!("[vsock] no listener; dropped {} bytes from {from}", data.len());
                false
            }
        }
    }

    /// Fire the ready-to-send notification.
    pub fn signal_ready_to_send(&self) -> bool {
        let listener = self.lock().listener.clone();
        match listener {
            Some(listener) => {
                listener.on_ready_to_send();
                true
            }
            None => false,
        }
    }

    pub fn set_state(&self, state: SocketState) {
        let mut inner = self.lock();
        log::trace!("[vsock] state {} -> {state}", inner.state);
        inner.state = state;
    }

    /// Associate with `remote` and report [`SocketState::Connected`].
    pub fn connect(&self, remote: SocketAddr) {
        let mut inner = self.lock();
        inner.remote = Some(remote);
        inner.state = SocketState::Connected;
    }

    /// Make every subsequent send fail with `code`; `None` restores success.
    pub fn fail_sends(&self, code: Option<i32>) {
        self.lock().send_failure = code;
    }

    /// Datagrams sent so far, oldest first.
    pub fn sent(&self) -> Vec<SentDatagram> {
        self.lock().sent.clone()
    }

    fn record_send(&self, data: &[u8], dest: Option<SocketAddr>, options: &PacketOptions) -> i32 {
        let mut inner = self.lock();
        if let Some(code) = inner.send_failure {
            inner.error = code;
            return -1;
        }
        if dest.is_none() && inner.remote.is_none() {
            inner.error = ENOTCONN;
            return -1;
        }
        inner.sent.push(SentDatagram {
            dest,
            data: data.to_vec(),
            options: *options,
        });
        i32::try_from(data.len()).unwrap_or(i32::MAX)
    }

    fn lock(&self) -> MutexGuard<'_, VirtualInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for VirtualSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("VirtualSocket")
            .field("local", &inner.local)
            .field("remote", &inner.remote)
            .field("state", &inner.state)
            .field("sent", &inner.sent.len())
            .finish()
    }
}

impl PacketSocket for VirtualSocket {
    fn send(&self, buf: &[u8], options: &PacketOptions) -> i32 {
        self.record_send(buf, None, options)
    }

    fn send_to(&self, buf: &[u8], dest: SocketAddr, options: &PacketOptions) -> i32 {
        self.record_send(buf, Some(dest), options)
    }

    fn error(&self) -> i32 {
        self.lock().error
    }

    fn option(&self, opt: SocketOption) -> Result<i32, i32> {
        let mut inner = self.lock();
        match inner.options.get(&opt) {
            Some(&value) => Ok(value),
            None => {
                inner.error = ENOPROTOOPT;
                Err(ENOPROTOOPT)
            }
        }
    }

    fn set_option(&self, opt: SocketOption, value: i32) -> i32 {
        self.lock().options.insert(opt, value);
        0
    }

    fn state(&self) -> SocketState {
        self.lock().state
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.lock().local)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.lock().remote
    }

    fn set_listener(&mut self, listener: Arc<dyn SocketListener>) {
        self.lock().listener = Some(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        packets: Mutex<Vec<(Vec<u8>, SocketAddr, PacketTime)>>,
        ready: AtomicUsize,
    }

    impl SocketListener for Recorder {
        fn on_packet(&self, data: &[u8], remote: SocketAddr, packet_time: PacketTime) {
            self.packets
                .lock()
                .unwrap()
                .push((data.to_vec(), remote, packet_time));
        }

        fn on_ready_to_send(&self) {
            self.ready.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn deliver_without_listener_drops() {
        let sock = VirtualSocket::new(addr(1));
        assert!(!sock.deliver(b"x", addr(2), PacketTime::at(1)));
        assert!(!sock.signal_ready_to_send());
    }

    #[test]
    fn deliver_reaches_listener() {
        let mut sock = VirtualSocket::new(addr(1));
        let recorder = Arc::new(Recorder::default());
        sock.set_listener(recorder.clone());

        assert!(sock.deliver(b"abc", addr(2), PacketTime::at(7)));
        assert!(sock.signal_ready_to_send());

        let packets = recorder.packets.lock().unwrap();
        assert_eq!(packets.as_slice(), &[(b"abc".to_vec(), addr(2), PacketTime::at(7))]);
        assert_eq!(recorder.ready.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn connected_send_requires_remote() {
        let sock = VirtualSocket::new(addr(1));
        assert_eq!(sock.send(b"hi", &PacketOptions::default()), -1);
        assert_eq!(sock.error(), ENOTCONN);

        sock.connect(addr(9));
        assert_eq!(sock.state(), SocketState::Connected);
        assert_eq!(sock.send(b"hi", &PacketOptions::default()), 2);
        assert_eq!(sock.sent()[0].dest, None);
    }

    #[test]
    fn send_failure_is_reported_verbatim() {
        let sock = VirtualSocket::new(addr(1));
        sock.fail_sends(Some(11));
        assert_eq!(sock.send_to(b"x", addr(2), &PacketOptions::default()), -1);
        assert_eq!(sock.error(), 11);
        assert!(sock.sent().is_empty());

        sock.fail_sends(None);
        assert_eq!(sock.send_to(b"xy", addr(2), &PacketOptions::default()), 2);
    }

    #[test]
    fn unset_option_fails() {
        let sock = VirtualSocket::new(addr(1));
        assert_eq!(sock.option(SocketOption::Dscp), Err(ENOPROTOOPT));
        assert_eq!(sock.set_option(SocketOption::Dscp, 46), 0);
        assert_eq!(sock.option(SocketOption::Dscp), Ok(46));
    }
}
