//! Client-side network session.
//!
//! The client dials the server synchronously, then hands the socket to the
//! reactor: a read reaction keeps the [`PeerMirror`] in sync with the
//! server's membership and position messages, and a periodic timer uploads
//! the camera position as an UPDATE_POS.
//!
//! End of stream is fatal to the session: the reaction removes itself and
//! reports through a channel that [`ClientSession::run_until_disconnect`]
//! is blocked on.

use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use log::{debug, info, warn};
use mio::net::TcpStream;

use shared::codec::{self, read_u32_le, server_msg, ID_LEN};
use shared::reactor::{Context, EventSet, Handle};
use shared::socket::{drive_read, AsyncSocket, FrameStep, ReadOutcome, DEFAULT_INTEREST};
use shared::{NetError, Position};

use crate::camera::Camera;
use crate::mirror::PeerMirror;

/// Read scratch size. SNAPSHOT and POSITIONS scale with the number of
/// players, so the client reads through a much larger buffer than the
/// 13-byte-message server side; this bounds the supported peer count per
/// message at well over 300.
pub const READ_BUFFER_LEN: usize = 4096;

pub struct ClientConfig {
    pub server_addr: SocketAddr,
    pub reactor_threads: usize,
    pub update_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::new(shared::SERVER_ADDR, shared::PORT),
            reactor_threads: shared::CLIENT_REACTOR_THREADS,
            update_interval: shared::POSITION_UPDATE_INTERVAL,
        }
    }
}

/// A connected client session.
pub struct ClientSession {
    socket: Arc<AsyncSocket>,
    mirror: Arc<PeerMirror>,
    disconnected: Receiver<NetError>,
}

impl ClientSession {
    /// Dials the server (synchronously), switches the socket to
    /// non-blocking, and registers the read reaction and the position
    /// upload timer on `reactor`.
    pub fn connect(
        reactor: &Handle,
        camera: Arc<Camera>,
        config: &ClientConfig,
    ) -> io::Result<ClientSession> {
        let stream = std::net::TcpStream::connect(config.server_addr)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let stream = TcpStream::from_std(stream);
        info!("connected to {}", config.server_addr);

        let mirror = Arc::new(PeerMirror::new());
        let (report_tx, report_rx) = mpsc::channel();

        let reaction_mirror = Arc::clone(&mirror);
        let socket = AsyncSocket::register_with(reactor, stream, DEFAULT_INTEREST, |socket| {
            let socket = Arc::clone(socket);
            Box::new(move |events: EventSet, ctx: &Context| {
                server_socket_ready(&socket, &reaction_mirror, &report_tx, events, ctx)
            })
        })?;

        let timer_socket = Arc::clone(&socket);
        reactor.add_timer(
            config.update_interval,
            Box::new(move |ctx: &Context| {
                let update = codec::encode_update_pos(camera.position());
                if let Err(e) = timer_socket.schedule_write(ctx.reactor(), &update) {
                    warn!("position update not sent: {e}");
                }
            }),
        )?;

        Ok(ClientSession {
            socket,
            mirror,
            disconnected: report_rx,
        })
    }

    /// The other players as this client knows them.
    pub fn mirror(&self) -> &Arc<PeerMirror> {
        &self.mirror
    }

    pub fn socket(&self) -> &Arc<AsyncSocket> {
        &self.socket
    }

    /// Blocks until the session dies (server gone or protocol violation)
    /// and returns the reason.
    pub fn run_until_disconnect(&self) -> NetError {
        match self.disconnected.recv() {
            Ok(err) => err,
            Err(_) => NetError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "session reaction went away without a report",
            )),
        }
    }
}

/// Read reaction for the server socket.
fn server_socket_ready(
    socket: &Arc<AsyncSocket>,
    mirror: &Arc<PeerMirror>,
    report: &Sender<NetError>,
    events: EventSet,
    ctx: &Context,
) {
    if events.hangup {
        fail_session(socket, report, ctx, end_of_stream());
        return;
    }
    if events.readable {
        let mut scratch = [0u8; READ_BUFFER_LEN];
        let outcome = drive_read(socket, &mut scratch, |msg_type, rest| {
            handle_server_message(mirror, msg_type, rest)
        });
        match outcome {
            Ok(ReadOutcome::WouldBlock) => {}
            Ok(ReadOutcome::Closed) => {
                fail_session(socket, report, ctx, end_of_stream());
                return;
            }
            Err(err) => {
                fail_session(socket, report, ctx, err);
                return;
            }
        }
    }
    if events.writable {
        if let Err(e) = socket.handle_writable(ctx.reactor()) {
            fail_session(socket, report, ctx, NetError::Io(e));
        }
    }
}

fn end_of_stream() -> NetError {
    NetError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "server closed the connection",
    ))
}

/// Tears the session down: the reaction removes itself (legal as its last
/// act) and the error is delivered to whoever is waiting on the session.
fn fail_session(socket: &Arc<AsyncSocket>, report: &Sender<NetError>, ctx: &Context, err: NetError) {
    ctx.remove_fd(socket.reaction_handle(), socket.raw_fd());
    let _ = report.send(err);
}

/// Applies one server message to the mirror. Returns how many payload bytes
/// the message occupied, or `Incomplete` when its tail has not arrived.
pub fn handle_server_message(
    mirror: &PeerMirror,
    msg_type: u8,
    rest: &[u8],
) -> Result<FrameStep, NetError> {
    match msg_type {
        server_msg::SNAPSHOT => {
            let Some(count) = read_u32_le(rest) else {
                return Ok(FrameStep::Incomplete);
            };
            let count = count as usize;
            let needed = ID_LEN + ID_LEN * count;
            if rest.len() < needed {
                return Ok(FrameStep::Incomplete);
            }
            let mut ids = Vec::with_capacity(count);
            for chunk in rest[ID_LEN..needed].chunks_exact(ID_LEN) {
                if let Some(id) = read_u32_le(chunk) {
                    ids.push(id);
                }
            }
            info!("snapshot: {count} players already connected: {ids:?}");
            mirror.apply_snapshot(&ids);
            Ok(FrameStep::Consumed(needed))
        }
        server_msg::JOINED => {
            let Some(id) = read_u32_le(rest) else {
                return Ok(FrameStep::Incomplete);
            };
            info!("player joined with id {id}");
            mirror.apply_joined(id);
            Ok(FrameStep::Consumed(ID_LEN))
        }
        server_msg::LEFT => {
            let Some(id) = read_u32_le(rest) else {
                return Ok(FrameStep::Incomplete);
            };
            info!("player with id {id} disconnected");
            mirror.apply_left(id);
            Ok(FrameStep::Consumed(ID_LEN))
        }
        server_msg::POSITIONS => {
            let needed = Position::ENCODED_LEN * mirror.len();
            if rest.len() < needed {
                return Ok(FrameStep::Incomplete);
            }
            debug!("applying positions for {} peers", mirror.len());
            mirror.apply_positions(&rest[..needed]);
            Ok(FrameStep::Consumed(needed))
        }
        _ => Err(NetError::Protocol("unknown message type from server")),
    }
}
