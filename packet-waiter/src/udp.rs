//! UDP packet socket driven by a [`TokioScheduler`].
//!
//! [`UdpPacketSocket`] is a [`PacketSocket`] over a real OS datagram socket.
//! The socket is registered with the scheduler's current-thread runtime:
//! - **sending** uses the registration's non-blocking `try_send`/`try_send_to`,
//!   so the synchronous `send`/`send_to` calls never need the runtime;
//! - **receiving** is a tokio task that hands every datagram to the
//!   registered listener.  The task only runs while the scheduler is ticked,
//!   so arrivals are dispatched on the consumer's thread.
//!
//! A send that would block returns -1 with `EAGAIN` recorded, and arms a
//! task that fires `on_ready_to_send` once the socket is writable again.
//! At most one such task is pending at a time.

use std::future::Future;
use std::io;
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::packet::{PacketOptions, PacketTime};
use crate::scheduler::TokioScheduler;
use crate::socket::{
    PacketSocket, SocketListener, SocketOption, EBADF, EINVAL, ENOPROTOOPT, ENOTCONN,
};
use crate::state::SocketState;

/// Maximum UDP payload size.
const MAX_DATAGRAM: usize = 65_535;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from setting up a [`UdpPacketSocket`].
///
/// Per-datagram failures are not reported here; they surface as negative
/// return codes and [`PacketSocket::error`].
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("socket is closed")]
    Closed,
}

/// Receive errors the loop keeps going after.
///
/// A connected UDP socket reports ICMP port-unreachable from an earlier
/// send as a receive error; the socket is still usable.
fn is_transient_io_error(e: &io::Error) -> bool {
    use io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

// ---------------------------------------------------------------------------
// WriteWatch
// ---------------------------------------------------------------------------

/// Holds the single pending "wait until writable" task.
#[derive(Default)]
struct WriteWatch {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WriteWatch {
    /// Spawn `wait` on `handle` unless an earlier one is still pending.
    /// Returns whether `wait` was spawned.
    fn arm<F>(&self, handle: &Handle, wait: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut task = self.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return false;
        }
        *task = Some(handle.spawn(wait));
        true
    }

    fn cancel(&self) {
        if let Some(task) = self.lock().take() {
            task.abort();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// UdpPacketSocket
// ---------------------------------------------------------------------------

/// A real UDP socket reporting arrivals through a tokio task.
pub struct UdpPacketSocket {
    /// Same OS socket as `io`; used for `connect` and socket options.
    std_socket: StdUdpSocket,
    io: Arc<UdpSocket>,
    handle: Handle,
    /// Zero point for receive timestamps.
    epoch: Instant,
    state: SocketState,
    remote: Option<SocketAddr>,
    error: AtomicI32,
    listener: Option<Arc<dyn SocketListener>>,
    recv_task: Option<JoinHandle<()>>,
    write_watch: WriteWatch,
}

impl UdpPacketSocket {
    /// Bind to `local_addr`, registering the socket with `scheduler`'s runtime.
    ///
    /// Passing port 0 lets the OS choose an ephemeral port.
    pub fn bind(local_addr: SocketAddr, scheduler: &TokioScheduler) -> Result<Self, SocketError> {
        let std_socket = StdUdpSocket::bind(local_addr)?;
        std_socket.set_nonblocking(true)?;
        let handle = scheduler.handle().clone();
        let io = {
            let _guard = handle.enter();
            UdpSocket::from_std(std_socket.try_clone()?)?
        };
        log::debug!("[udp] bound {}", std_socket.local_addr()?);
        Ok(Self {
            std_socket,
            io: Arc::new(io),
            handle,
            epoch: Instant::now(),
            state: SocketState::Bound,
            remote: None,
            error: AtomicI32::new(0),
            listener: None,
            recv_task: None,
            write_watch: WriteWatch::default(),
        })
    }

    /// Associate the socket with `remote`; later `send` calls go there and
    /// only datagrams from `remote` are received.
    pub fn connect(&mut self, remote: SocketAddr) -> Result<(), SocketError> {
        if self.state == SocketState::Closed {
            return Err(SocketError::Closed);
        }
        self.state = SocketState::Connecting;
        self.std_socket.connect(remote)?;
        self.remote = Some(remote);
        self.state = SocketState::Connected;
        log::debug!("[udp] connected to {remote}");
        Ok(())
    }

    /// Stop receiving and refuse further sends.
    pub fn close(&mut self) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
        self.write_watch.cancel();
        self.remote = None;
        self.state = SocketState::Closed;
        log::debug!("[udp] closed");
    }

    /// Record `e` as the socket error and return the failure code.
    fn fail(&self, e: &io::Error) -> i32 {
        let code = e.raw_os_error().unwrap_or(-1);
        self.error.store(code, Ordering::Relaxed);
        -1
    }

    fn fail_with(&self, code: i32) -> i32 {
        self.error.store(code, Ordering::Relaxed);
        -1
    }

    fn sent(&self, result: io::Result<usize>) -> i32 {
        match result {
            Ok(n) => i32::try_from(n).unwrap_or(i32::MAX),
            Err(e) => {
                log::debug!("[udp] send failed: {e}");
                if e.kind() == io::ErrorKind::WouldBlock {
                    self.notify_when_writable();
                }
                self.fail(&e)
            }
        }
    }

    fn notify_when_writable(&self) {
        let Some(listener) = self.listener.clone() else {
            return;
        };
        let io = Arc::clone(&self.io);
        let armed = self.write_watch.arm(&self.handle, async move {
            if io.writable().await.is_ok() {
                listener.on_ready_to_send();
            }
        });
        if !armed {
            log::trace!("[udp] writable watch already pending");
        }
    }

    fn spawn_receiver(&mut self, listener: Arc<dyn SocketListener>) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
        let io = Arc::clone(&self.io);
        let epoch = self.epoch;
        self.recv_task = Some(self.handle.spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match io.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        let micros = i64::try_from(epoch.elapsed().as_micros()).unwrap_or(i64::MAX);
                        listener.on_packet(&buf[..n], from, PacketTime::at(micros));
                    }
                    Err(e) if is_transient_io_error(&e) => {
                        log::trace!("[udp] ignoring receive error: {e}");
                    }
                    Err(e) => {
                        log::warn!("[udp] receive loop stopped: {e}");
                        break;
                    }
                }
            }
        }));
    }
}

impl std::fmt::Debug for UdpPacketSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpPacketSocket")
            .field("local", &self.local_addr())
            .field("remote", &self.remote)
            .field("state", &self.state)
            .field("error", &self.error())
            .finish()
    }
}

impl Drop for UdpPacketSocket {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
        self.write_watch.cancel();
    }
}

impl PacketSocket for UdpPacketSocket {
    /// DSCP and packet ids in `options` are not applied.
    fn send(&self, buf: &[u8], _options: &PacketOptions) -> i32 {
        if self.state == SocketState::Closed {
            return self.fail_with(EBADF);
        }
        if self.remote.is_none() {
            return self.fail_with(ENOTCONN);
        }
        self.sent(self.io.try_send(buf))
    }

    fn send_to(&self, buf: &[u8], dest: SocketAddr, _options: &PacketOptions) -> i32 {
        if self.state == SocketState::Closed {
            return self.fail_with(EBADF);
        }
        self.sent(self.io.try_send_to(buf, dest))
    }

    fn error(&self) -> i32 {
        self.error.load(Ordering::Relaxed)
    }

    fn option(&self, opt: SocketOption) -> Result<i32, i32> {
        let value = match opt {
            SocketOption::Ttl => self.std_socket.ttl().map(|v| v as i32),
            SocketOption::Broadcast => self.std_socket.broadcast().map(i32::from),
            SocketOption::MulticastLoopV4 => self.std_socket.multicast_loop_v4().map(i32::from),
            SocketOption::MulticastTtlV4 => self.std_socket.multicast_ttl_v4().map(|v| v as i32),
            _ => {
                self.fail_with(ENOPROTOOPT);
                return Err(ENOPROTOOPT);
            }
        };
        value.map_err(|e| {
            self.fail(&e);
            self.error()
        })
    }

    fn set_option(&self, opt: SocketOption, value: i32) -> i32 {
        let Ok(unsigned) = u32::try_from(value) else {
            return self.fail_with(EINVAL);
        };
        let result = match opt {
            SocketOption::Ttl => self.std_socket.set_ttl(unsigned),
            SocketOption::Broadcast => self.std_socket.set_broadcast(value != 0),
            SocketOption::MulticastLoopV4 => self.std_socket.set_multicast_loop_v4(value != 0),
            SocketOption::MulticastTtlV4 => self.std_socket.set_multicast_ttl_v4(unsigned),
            _ => return self.fail_with(ENOPROTOOPT),
        };
        match result {
            Ok(()) => 0,
            Err(e) => self.fail(&e),
        }
    }

    fn state(&self) -> SocketState {
        self.state
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.std_socket.local_addr().ok()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn set_listener(&mut self, listener: Arc<dyn SocketListener>) {
        if self.state != SocketState::Closed {
            self.spawn_receiver(Arc::clone(&listener));
        }
        self.listener = Some(listener);
    }
}
