//! `packet-waiter`: bounded-wait packet retrieval for socket tests.
//!
//! # Architecture
//!
//! ```text
//!                  test code
//!                      │ next_packet / check_next_packet / check_no_packet
//!  ┌───────────────────▼────────────────────┐
//!  │              PacketWaiter              │
//!  │  FIFO inbox · timestamp tracker        │
//!  └────┬───────────────────────────┬───────┘
//!       │ SocketListener            │ TimeSource::advance
//!  ┌────▼─────────────┐      ┌──────▼──────────────────────────┐
//!  │   PacketSocket   │      │ RealTimeSource ─▶ Scheduler     │
//!  │ UdpPacketSocket  │      │ SimulatedTimeSource ─▶ clock    │
//!  │ VirtualSocket    │      └─────────────────────────────────┘
//!  └──────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`waiter`]          the inbox and the timeout-bounded wait loop
//! - [`packet`]          received-datagram value types
//! - [`timestamp`]       receive-timestamp monotonicity check
//! - [`socket`]          packet-socket collaborator traits
//! - [`state`]           socket connection states
//! - [`scheduler`]       cooperative event loops pumped while waiting
//! - [`clock`]           real and simulated time sources
//! - [`config`]          timeouts and polling step
//! - [`udp`]             real UDP socket on a tokio current-thread runtime
//! - [`virtual_socket`]  in-memory socket for deterministic tests

pub mod clock;
pub mod config;
pub mod packet;
pub mod scheduler;
pub mod socket;
pub mod state;
pub mod timestamp;
pub mod udp;
pub mod virtual_socket;
pub mod waiter;

pub use clock::{RealTimeSource, SimulatedClock, SimulatedTimeSource, TimeSource};
pub use config::WaiterConfig;
pub use packet::{PacketOptions, PacketTime, ReceivedPacket};
pub use scheduler::{EventQueue, Scheduler, TokioScheduler};
pub use socket::{PacketSocket, SocketListener, SocketOption};
pub use state::SocketState;
pub use udp::{SocketError, UdpPacketSocket};
pub use virtual_socket::VirtualSocket;
pub use waiter::{PacketWaiter, VerifyError};
