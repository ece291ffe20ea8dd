//! Error type shared by the networking layers.
//!
//! Transient conditions (a read or write that would block) are not errors;
//! they are ordinary outcomes of the non-blocking socket helpers. What is
//! left splits into I/O failures reported by the OS and violations of the
//! wire protocol by a peer. Peer disconnects surface as
//! [`crate::socket::ReadOutcome::Closed`], not as an error, because they
//! are an expected part of a session's life.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    /// The OS reported a failure other than would-block/interrupted.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent bytes that cannot be part of a valid message stream.
    /// Connection-local: the offending connection is torn down, the
    /// process keeps running.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}
