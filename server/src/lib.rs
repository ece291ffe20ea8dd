//! # Game Server Library
//!
//! Authoritative session host for the multiplayer position sync. The server
//! accepts TCP connections, assigns each player a canonical id from the
//! roster's slot table, relays joins and departures to everyone affected,
//! and broadcasts all player positions on a fixed timer.
//!
//! ## Module Organization
//!
//! - [`players`]: the roster: one record per connected player behind a
//!   single mutex that also guards the positions inside.
//! - [`session`]: the protocol: accept handling, the per-player socket
//!   reaction, departure cleanup, and the periodic position broadcast.
//!
//! All I/O runs on the reactor pool from the `shared` crate; there is no
//! dedicated game loop thread. Timers and socket readiness both dispatch as
//! reactions, and cross-thread access to the roster serializes on its own
//! mutex rather than on any reactor state.

pub mod players;
pub mod session;
