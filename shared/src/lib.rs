//! # Shared Networking Library
//!
//! This crate contains everything the game server and client have in common:
//! the multi-threaded readiness reactor, the index-stable slot tables backing
//! both reaction dispatch and the player roster, the non-blocking socket
//! wrapper with its framed read/write helpers, and the wire codec.
//!
//! ## Core Components
//!
//! - [`reactor`]: a fixed pool of event-loop threads, each polling its own
//!   readiness set. Registrations are spread over the pool round-robin and
//!   dispatched as callbacks.
//! - [`holey`]: slot allocators whose indices stay valid until removal.
//!   The server derives player ids from them, so iteration order and index
//!   reuse are part of the protocol, not an implementation detail.
//! - [`socket`]: a non-blocking TCP socket with a frame decoder on the read
//!   side and an opportunistic write scheduler that only arms writability
//!   notifications when the kernel buffer pushes back.
//! - [`codec`]: the byte-exact message layer: one type byte followed by
//!   little-endian unpadded fields.
//!
//! ## Design Philosophy
//!
//! Callbacks never block and never suspend; the only blocking call on a
//! reactor thread is the poll itself. Shared state crossing thread
//! boundaries (the player table, each socket's write buffer) is guarded by
//! its own mutex rather than by the reactor.

pub mod codec;
pub mod error;
pub mod holey;
pub mod reactor;
pub mod socket;

pub use codec::Position;
pub use error::NetError;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Address the server binds to and the client dials by default.
pub const SERVER_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// TCP port used by both sides by default.
pub const PORT: u16 = 9333;

/// Cadence of the server's position broadcast and of the client's own
/// position upload. Both timers run at this interval independently.
pub const POSITION_UPDATE_INTERVAL: Duration = Duration::from_millis(10);

/// Reactor pool size for the server process.
pub const SERVER_REACTOR_THREADS: usize = 4;

/// Reactor pool size for the client process.
pub const CLIENT_REACTOR_THREADS: usize = 3;

/// Pending-connection queue length passed to `listen(2)`.
pub const TCP_LISTEN_BACKLOG: i32 = 5;

/// Upper bound on whole messages consumed from one socket per readable
/// event. Sizes the stack scratch buffer of the frame reader.
pub const MAX_MESSAGES_PER_READ: usize = 10;
