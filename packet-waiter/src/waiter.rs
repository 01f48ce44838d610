//! Bounded-wait packet retrieval over a wrapped socket.
//!
//! A [`PacketWaiter`] owns one [`PacketSocket`] for the duration of a test.
//! At construction it registers an inbox with the socket; every datagram the
//! socket reports is copied into a FIFO queue, from whatever thread the
//! socket delivers on.  Test code then pulls packets with a timeout:
//!
//! ```text
//!   socket thread(s)                 consumer (test) thread
//!   ────────────────                 ──────────────────────
//!   on_packet ──lock──▶ [ queue ] ◀──lock── next_packet(timeout)
//!                                             │  empty?
//!                                             ▼
//!                                       time.advance(tick)   (unlocked)
//! ```
//!
//! The queue lock covers one push, one emptiness check or one pop, and is
//! never held while time advances: advancing may run the very callback that
//! pushes onto the queue.
//!
//! "No packet arrived" is an ordinary outcome here, not an error; half of
//! all network tests assert that something did *not* happen.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;

use crate::clock::{RealTimeSource, SimulatedClock, SimulatedTimeSource, TimeSource};
use crate::config::WaiterConfig;
use crate::packet::{PacketOptions, PacketTime, ReceivedPacket};
use crate::scheduler::Scheduler;
use crate::socket::{PacketSocket, SocketListener, SocketOption};
use crate::state::SocketState;
use crate::timestamp::TimestampTracker;

/// Smallest step a wait loop advances by, so a zero tick cannot stall it.
const MIN_STEP: Duration = Duration::from_micros(1);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Why [`PacketWaiter::verify_next_packet`] rejected the next packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("no packet arrived within {0:?}")]
    NoPacket(Duration),
    #[error("expected {expected} bytes, received {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("payload differs from expected at byte {offset}")]
    ContentMismatch { offset: usize },
    #[error("timestamp {timestamp:?} is unset or earlier than previous {previous:?}")]
    BadTimestamp {
        timestamp: Option<i64>,
        previous: Option<i64>,
    },
}

// ---------------------------------------------------------------------------
// Inbox
// ---------------------------------------------------------------------------

/// State shared between the socket's notifications and the consumer.
#[derive(Default)]
struct Inbox {
    packets: Mutex<VecDeque<ReceivedPacket>>,
    ready_to_send: AtomicUsize,
}

impl Inbox {
    fn queue(&self) -> MutexGuard<'_, VecDeque<ReceivedPacket>> {
        self.packets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SocketListener for Inbox {
    fn on_packet(&self, data: &[u8], remote: SocketAddr, packet_time: PacketTime) {
        let packet = ReceivedPacket::new(remote, data, packet_time);
        let depth = {
            let mut queue = self.queue();
            queue.push_back(packet);
            queue.len()
        };
        log::trace!(
            "[waiter] ← {} bytes from {remote} ts={:?} queued={depth}",
            data.len(),
            packet_time.timestamp
        );
    }

    fn on_ready_to_send(&self) {
        let n = self.ready_to_send.fetch_add(1, Ordering::Relaxed) + 1;
        log::trace!("[waiter] ready to send (#{n})");
    }
}

// ---------------------------------------------------------------------------
// PacketWaiter
// ---------------------------------------------------------------------------

/// Test-side wrapper around a packet socket.
///
/// Obtain one via [`PacketWaiter::with_scheduler`] for wall-clock tests or
/// [`PacketWaiter::with_simulated_clock`] for deterministic ones; both run
/// the same wait loop.
pub struct PacketWaiter<S: PacketSocket> {
    socket: S,
    time: Box<dyn TimeSource>,
    inbox: Arc<Inbox>,
    timestamps: TimestampTracker,
    config: WaiterConfig,
}

impl<S: PacketSocket> PacketWaiter<S> {
    // -----------------------------------------------------------------------
    // Constructors
    // -----------------------------------------------------------------------

    /// Wrap `socket`, measuring and advancing time through `time`.
    pub fn new(mut socket: S, time: impl TimeSource + 'static) -> Self {
        let inbox = Arc::new(Inbox::default());
        socket.set_listener(Arc::clone(&inbox) as Arc<dyn SocketListener>);
        Self {
            socket,
            time: Box::new(time),
            inbox,
            timestamps: TimestampTracker::new(),
            config: WaiterConfig::default(),
        }
    }

    /// Wall-clock waiter that pumps `scheduler` while it waits.
    pub fn with_scheduler(socket: S, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::new(socket, RealTimeSource::new(scheduler))
    }

    /// Waiter whose waits advance `clock` instead of sleeping.
    pub fn with_simulated_clock(socket: S, clock: SimulatedClock) -> Self {
        Self::new(socket, SimulatedTimeSource::new(clock))
    }

    /// Replace the default timeouts.
    pub fn with_config(mut self, config: WaiterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &WaiterConfig {
        &self.config
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    // -----------------------------------------------------------------------
    // Retrieval
    // -----------------------------------------------------------------------

    /// Return the oldest received packet, waiting up to `timeout` for one.
    ///
    /// A zero `timeout` checks once without advancing time.  Returns `None`
    /// if nothing arrived before the deadline.
    pub fn next_packet(&self, timeout: Duration) -> Option<ReceivedPacket> {
        self.wait_until(timeout, || !self.inbox.queue().is_empty());
        let packet = self.inbox.queue().pop_front();
        if packet.is_none() {
            log::debug!("[waiter] no packet within {timeout:?}");
        }
        packet
    }

    /// `true` if no packet arrives within `config.no_packet_timeout`.
    pub fn check_no_packet(&self) -> bool {
        self.next_packet(self.config.no_packet_timeout).is_none()
    }

    /// `true` if the next packet (within `config.timeout`) carries exactly
    /// `expected` and a valid, non-decreasing timestamp.
    ///
    /// When a packet is retrieved its sender is written to `addr`, whether
    /// or not it matched.
    pub fn check_next_packet(&mut self, expected: &[u8], addr: Option<&mut SocketAddr>) -> bool {
        let Some(packet) = self.next_packet(self.config.timeout) else {
            return false;
        };
        if let Some(addr) = addr {
            *addr = packet.addr();
        }
        match self.verify(&packet, expected) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("[waiter] packet from {} rejected: {e}", packet.addr());
                false
            }
        }
    }

    /// Like [`check_next_packet`](Self::check_next_packet), but returns the
    /// matching packet or the reason it was rejected.
    pub fn verify_next_packet(&mut self, expected: &[u8]) -> Result<ReceivedPacket, VerifyError> {
        let timeout = self.config.timeout;
        let packet = self
            .next_packet(timeout)
            .ok_or(VerifyError::NoPacket(timeout))?;
        self.verify(&packet, expected)?;
        Ok(packet)
    }

    /// Size, then content, then timestamp.  The timestamp is only checked
    /// (and recorded) once the payload matches.
    fn verify(&mut self, packet: &ReceivedPacket, expected: &[u8]) -> Result<(), VerifyError> {
        if packet.size() != expected.len() {
            return Err(VerifyError::SizeMismatch {
                expected: expected.len(),
                actual: packet.size(),
            });
        }
        if let Some(offset) = packet.data().iter().zip(expected).position(|(a, b)| a != b) {
            return Err(VerifyError::ContentMismatch { offset });
        }
        let previous = self.timestamps.previous();
        let timestamp = packet.packet_time().timestamp;
        if !self.timestamps.check(timestamp) {
            return Err(VerifyError::BadTimestamp {
                timestamp,
                previous,
            });
        }
        Ok(())
    }

    /// Check a receive timestamp against the previous one and record it.
    pub fn check_timestamp(&mut self, timestamp: Option<i64>) -> bool {
        self.timestamps.check(timestamp)
    }

    /// Packets received but not yet retrieved.
    pub fn queued(&self) -> usize {
        self.inbox.queue().len()
    }

    /// Ready-to-send notifications received since construction.
    pub fn ready_to_send_count(&self) -> usize {
        self.inbox.ready_to_send.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Connection state
    // -----------------------------------------------------------------------

    /// `true` if the socket reaches `state` within `timeout`.
    pub fn check_conn_state(&self, state: SocketState, timeout: Duration) -> bool {
        let reached = self.wait_until(timeout, || self.socket.state() == state);
        if !reached {
            log::debug!(
                "[waiter] socket still {} after {timeout:?}, wanted {state}",
                self.socket.state()
            );
        }
        reached
    }

    /// [`check_conn_state`](Self::check_conn_state) bounded by `config.timeout`.
    pub fn wait_for_conn_state(&self, state: SocketState) -> bool {
        self.check_conn_state(state, self.config.timeout)
    }

    // -----------------------------------------------------------------------
    // Socket pass-through
    // -----------------------------------------------------------------------

    /// Send to the connected peer.  Returns the socket's raw result.
    pub fn send(&self, buf: &[u8]) -> i32 {
        self.socket.send(buf, &PacketOptions::default())
    }

    /// Send to `dest`.  Returns the socket's raw result.
    pub fn send_to(&self, buf: &[u8], dest: SocketAddr) -> i32 {
        self.socket.send_to(buf, dest, &PacketOptions::default())
    }

    pub fn error(&self) -> i32 {
        self.socket.error()
    }

    pub fn option(&self, opt: SocketOption) -> Result<i32, i32> {
        self.socket.option(opt)
    }

    pub fn set_option(&self, opt: SocketOption, value: i32) -> i32 {
        self.socket.set_option(opt, value)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.socket.remote_addr()
    }

    // -----------------------------------------------------------------------
    // Wait loop
    // -----------------------------------------------------------------------

    /// Advance time one tick at a time until `done` holds or `timeout`
    /// elapses.  Returns the last value of `done`.
    fn wait_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = self.time.now().saturating_add(timeout);
        loop {
            if done() {
                return true;
            }
            let now = self.time.now();
            if now >= deadline {
                return false;
            }
            let step = self.config.tick.max(MIN_STEP).min(deadline - now);
            self.time.advance(step);
        }
    }
}

impl<S: PacketSocket + std::fmt::Debug> std::fmt::Debug for PacketWaiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketWaiter")
            .field("socket", &self.socket)
            .field("queued", &self.queued())
            .field("config", &self.config)
            .finish()
    }
}
