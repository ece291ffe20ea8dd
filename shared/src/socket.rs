//! Non-blocking TCP socket with framed reads and scheduled writes.
//!
//! An [`AsyncSocket`] owns its stream for the socket's whole lifetime (the
//! fd closes when the last reference drops) and keeps the two pieces of
//! state a half-duplex message stream needs:
//!
//! - read side: the trailing bytes of a message that arrived split across
//!   reads, carried over to the next readable event;
//! - write side: bytes the kernel would not take inline, flushed when the
//!   reactor reports writability. Writability interest is armed only while
//!   this buffer is non-empty, so an idle socket costs no wakeups.
//!
//! [`drive_read`] is the frame decoder: it pulls bytes into a caller-owned
//! scratch buffer and hands complete messages to a handler that knows the
//! per-type payload layout.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, OnceLock};

use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Interest, Token};
use parking_lot::Mutex;

use crate::error::NetError;
use crate::reactor::{FdCallback, Handle, ReactionHandle};

/// Interest a quiescent socket keeps registered. Peer hangups are always
/// delivered alongside readable interest.
pub const DEFAULT_INTEREST: Interest = Interest::READABLE;

#[derive(Default)]
struct ReadState {
    /// Leftover prefix of a message whose tail has not arrived yet.
    pending: Vec<u8>,
}

#[derive(Default)]
struct WriteState {
    /// Bytes accepted by `schedule_write` but not yet by the kernel.
    buf: Vec<u8>,
    /// True while WRITABLE interest is registered for this socket.
    armed: bool,
}

/// A non-blocking TCP stream registered with a reactor.
pub struct AsyncSocket {
    stream: TcpStream,
    read: Mutex<ReadState>,
    write: Mutex<WriteState>,
    handle: OnceLock<ReactionHandle>,
}

impl AsyncSocket {
    /// Wraps `stream` (which must already be non-blocking) and registers a
    /// reaction for it. `make_callback` receives the socket being built so
    /// the reaction can capture its own socket without a cycle of owners.
    pub fn register_with(
        reactor: &Handle,
        stream: TcpStream,
        interest: Interest,
        make_callback: impl FnOnce(&Arc<AsyncSocket>) -> FdCallback,
    ) -> io::Result<Arc<AsyncSocket>> {
        let socket = Arc::new(AsyncSocket {
            stream,
            read: Mutex::new(ReadState::default()),
            write: Mutex::new(WriteState::default()),
            handle: OnceLock::new(),
        });
        let callback = make_callback(&socket);
        let handle = reactor.add_fd(socket.stream.as_raw_fd(), interest, callback)?;
        let _ = socket.handle.set(handle);
        Ok(socket)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Where this socket's reaction lives.
    pub fn reaction_handle(&self) -> ReactionHandle {
        *self
            .handle
            .get()
            .expect("AsyncSocket is registered on construction")
    }

    /// Bytes waiting for the kernel to accept them.
    pub fn queued_bytes(&self) -> usize {
        self.write.lock().buf.len()
    }

    /// Whether WRITABLE interest is currently registered.
    pub fn writable_armed(&self) -> bool {
        self.write.lock().armed
    }

    /// Queues `bytes` for delivery. If nothing is already queued the write
    /// is attempted inline; only the part the kernel refuses is buffered,
    /// and writability interest is armed for it. Either way the bytes are
    /// fully copied out of `bytes` before returning, so the caller may reuse
    /// its buffer immediately.
    ///
    /// Writes to one socket land on the wire in `schedule_write` order; the
    /// write mutex serializes callers.
    pub fn schedule_write(&self, reactor: &Handle, bytes: &[u8]) -> io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut write = self.write.lock();
        let written = if write.buf.is_empty() {
            write_as_much_as_possible(&self.stream, bytes)?
        } else {
            0
        };
        if written == bytes.len() {
            return Ok(());
        }
        write.buf.extend_from_slice(&bytes[written..]);
        if !write.armed {
            self.rearm(reactor, DEFAULT_INTEREST | Interest::WRITABLE)?;
            write.armed = true;
        }
        Ok(())
    }

    /// Reaction half of the write side: flush what the kernel will take and
    /// disarm writability once the buffer is empty.
    pub fn handle_writable(&self, reactor: &Handle) -> io::Result<()> {
        let mut write = self.write.lock();
        let written = write_as_much_as_possible(&self.stream, &write.buf)?;
        write.buf.drain(..written);
        if write.buf.is_empty() && write.armed {
            self.rearm(reactor, DEFAULT_INTEREST)?;
            write.armed = false;
        }
        Ok(())
    }

    fn rearm(&self, reactor: &Handle, interest: Interest) -> io::Result<()> {
        let handle = self.reaction_handle();
        reactor.registry(handle.thread).reregister(
            &mut SourceFd(&self.stream.as_raw_fd()),
            Token(handle.slot),
            interest,
        )
    }

    #[cfg(test)]
    fn unregistered_for_tests(stream: TcpStream) -> AsyncSocket {
        AsyncSocket {
            stream,
            read: Mutex::new(ReadState::default()),
            write: Mutex::new(WriteState::default()),
            handle: OnceLock::new(),
        }
    }
}

/// Writes until `bytes` is exhausted or the kernel pushes back; returns the
/// count accepted. A peer that vanished mid-write surfaces as an error for
/// the caller's disconnect handling.
fn write_as_much_as_possible(mut stream: &TcpStream, bytes: &[u8]) -> io::Result<usize> {
    let mut pos = 0;
    while pos < bytes.len() {
        match stream.write(&bytes[pos..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "peer stopped accepting bytes",
                ))
            }
            Ok(n) => pos += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(pos)
}

/// What the frame handler decided about the bytes it was shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStep {
    /// A whole message was processed; carries the count of payload bytes
    /// consumed beyond the type byte.
    Consumed(usize),
    /// Not enough bytes yet; re-present the same message once more arrive.
    Incomplete,
}

/// Why [`drive_read`] stopped consuming the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The kernel has no more bytes; any incomplete suffix was saved for the
    /// next readable event.
    WouldBlock,
    /// End of stream (orderly close or connection reset).
    Closed,
}

/// Pulls bytes from `socket` and delivers every complete message to
/// `handle_message(msg_type, rest_of_buffer)`. The handler is authoritative
/// over payload length: it returns how many payload bytes it consumed, or
/// [`FrameStep::Incomplete`] when the message's tail is still in flight.
///
/// `scratch` must be the same size across calls for one socket, and large
/// enough for the longest legal message plus one byte; a message that could
/// never fit is reported as a protocol violation rather than stalling the
/// stream forever.
pub fn drive_read(
    socket: &AsyncSocket,
    scratch: &mut [u8],
    mut handle_message: impl FnMut(u8, &[u8]) -> Result<FrameStep, NetError>,
) -> Result<ReadOutcome, NetError> {
    let mut read = socket.read.lock();
    let mut pending = read.pending.len();
    debug_assert!(pending < scratch.len());
    scratch[..pending].copy_from_slice(&read.pending);
    loop {
        let count = match (&socket.stream).read(&mut scratch[pending..]) {
            Ok(0) => {
                read.pending.clear();
                return Ok(ReadOutcome::Closed);
            }
            Ok(count) => count,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                read.pending.clear();
                read.pending.extend_from_slice(&scratch[..pending]);
                return Ok(ReadOutcome::WouldBlock);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                read.pending.clear();
                return Ok(ReadOutcome::Closed);
            }
            Err(e) => return Err(NetError::Io(e)),
        };
        let filled = pending + count;
        let mut cursor = 0;
        while cursor < filled {
            let msg_type = scratch[cursor];
            match handle_message(msg_type, &scratch[cursor + 1..filled])? {
                FrameStep::Consumed(payload) => cursor += 1 + payload,
                FrameStep::Incomplete => break,
            }
        }
        // Carry the incomplete suffix (type byte included) to the front.
        scratch.copy_within(cursor..filled, 0);
        pending = filled - cursor;
        if pending == scratch.len() {
            return Err(NetError::Protocol("message larger than read buffer"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{Context, EventSet, Reactor};
    use std::net::TcpListener;
    use std::time::Duration;

    /// Connected (mio, std) stream pair over localhost.
    fn stream_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let ours = std::net::TcpStream::connect(addr).unwrap();
        ours.set_nonblocking(true).unwrap();
        let (theirs, _) = listener.accept().unwrap();
        (TcpStream::from_std(ours), theirs)
    }

    /// Handler for messages with fixed 4-byte payloads; records what it saw.
    fn fixed_payload_handler(
        seen: &mut Vec<(u8, Vec<u8>)>,
    ) -> impl FnMut(u8, &[u8]) -> Result<FrameStep, NetError> + '_ {
        move |msg_type, rest| {
            if rest.len() < 4 {
                return Ok(FrameStep::Incomplete);
            }
            seen.push((msg_type, rest[..4].to_vec()));
            Ok(FrameStep::Consumed(4))
        }
    }

    #[test]
    fn test_drive_read_delivers_back_to_back_messages() {
        let (ours, mut theirs) = stream_pair();
        let socket = AsyncSocket::unregistered_for_tests(ours);
        theirs.write_all(&[7, 1, 2, 3, 4, 9, 5, 6, 7, 8]).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let mut seen = Vec::new();
        let mut scratch = [0u8; 64];
        let outcome = drive_read(&socket, &mut scratch, fixed_payload_handler(&mut seen)).unwrap();
        assert_eq!(outcome, ReadOutcome::WouldBlock);
        assert_eq!(
            seen,
            vec![(7, vec![1, 2, 3, 4]), (9, vec![5, 6, 7, 8])]
        );
    }

    #[test]
    fn test_drive_read_preserves_split_message() {
        let (ours, mut theirs) = stream_pair();
        let socket = AsyncSocket::unregistered_for_tests(ours);
        let mut scratch = [0u8; 64];

        // First fragment: type byte plus half the payload.
        theirs.write_all(&[7, 1, 2]).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let mut seen = Vec::new();
        let outcome = drive_read(&socket, &mut scratch, fixed_payload_handler(&mut seen)).unwrap();
        assert_eq!(outcome, ReadOutcome::WouldBlock);
        assert!(seen.is_empty());

        // Rest of the payload; the handler must see the message exactly once.
        theirs.write_all(&[3, 4]).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let outcome = drive_read(&socket, &mut scratch, fixed_payload_handler(&mut seen)).unwrap();
        assert_eq!(outcome, ReadOutcome::WouldBlock);
        assert_eq!(seen, vec![(7, vec![1, 2, 3, 4])]);
    }

    #[test]
    fn test_drive_read_reports_end_of_stream() {
        let (ours, theirs) = stream_pair();
        let socket = AsyncSocket::unregistered_for_tests(ours);
        drop(theirs);
        std::thread::sleep(Duration::from_millis(20));

        let mut scratch = [0u8; 64];
        let outcome = drive_read(&socket, &mut scratch, |_, _| {
            panic!("no messages were sent")
        })
        .unwrap();
        assert_eq!(outcome, ReadOutcome::Closed);
    }

    #[test]
    fn test_drive_read_rejects_oversized_message() {
        let (ours, mut theirs) = stream_pair();
        let socket = AsyncSocket::unregistered_for_tests(ours);
        theirs.write_all(&[0u8; 8]).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        // A handler that never gets enough bytes fills the scratch buffer.
        let mut scratch = [0u8; 8];
        let result = drive_read(&socket, &mut scratch, |_, _| Ok(FrameStep::Incomplete));
        assert!(matches!(result, Err(NetError::Protocol(_))));
    }

    #[test]
    fn test_zero_length_write_is_a_noop() {
        let reactor = Reactor::new(1).unwrap();
        let (ours, _theirs) = stream_pair();
        let socket =
            AsyncSocket::register_with(&reactor.handle(), ours, DEFAULT_INTEREST, |_socket| {
                Box::new(|_events: EventSet, _ctx: &Context| {})
            })
            .unwrap();
        socket.schedule_write(&reactor.handle(), &[]).unwrap();
        assert_eq!(socket.queued_bytes(), 0);
        assert!(!socket.writable_armed());
    }

    #[test]
    fn test_oversized_write_arms_then_drains_then_disarms() {
        let reactor = Reactor::new(1).unwrap();
        let (ours, mut theirs) = stream_pair();
        let socket =
            AsyncSocket::register_with(&reactor.handle(), ours, DEFAULT_INTEREST, |socket| {
                let socket = Arc::clone(socket);
                Box::new(move |events: EventSet, ctx: &Context| {
                    if events.writable {
                        let _ = socket.handle_writable(ctx.reactor());
                    }
                })
            })
            .unwrap();

        // Far more than a loopback socket buffer accepts inline.
        let payload: Vec<u8> = (0..16 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        socket.schedule_write(&reactor.handle(), &payload).unwrap();
        assert!(socket.queued_bytes() > 0);
        assert!(socket.writable_armed());

        // Drain the peer side; the reactor flushes as space frees up.
        let mut received = Vec::with_capacity(payload.len());
        let mut chunk = [0u8; 64 * 1024];
        while received.len() < payload.len() {
            let count = theirs.read(&mut chunk).unwrap();
            assert!(count > 0, "peer closed early");
            received.extend_from_slice(&chunk[..count]);
        }
        assert_eq!(received, payload);

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(socket.queued_bytes(), 0);
        assert!(!socket.writable_armed());
    }
}
