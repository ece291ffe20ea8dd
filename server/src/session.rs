//! Session core: listener, per-player reactions, broadcast timer.
//!
//! The protocol sequence for one player:
//!
//! 1. accept → a [`PlayerRecord`] is inserted, its slot becoming the
//!    canonical id; the newcomer gets a SNAPSHOT of everyone else and every
//!    existing player gets a JOINED, all inside one roster critical
//!    section, so no broadcast tick can observe the join halfway.
//! 2. readable → UPDATE_POS messages overwrite the player's position.
//! 3. every broadcast tick → each recipient gets the other players'
//!    positions, rebased into its own dense id space.
//! 4. hangup / EOF / error → the reaction deregisters itself, the record is
//!    removed and every survivor gets a LEFT.
//!
//! Ids on the wire (SNAPSHOT, JOINED, LEFT, POSITIONS ordering) are always
//! rebased for their recipient; see [`shared::codec::rebase_id`].

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use socket2::{Domain, Protocol, Socket, Type};

use shared::codec::{self, rebase_id, server_msg, TYPE_LEN};
use shared::reactor::{Context, EventSet, Reactor};
use shared::socket::{drive_read, AsyncSocket, FrameStep, ReadOutcome, DEFAULT_INTEREST};
use shared::{NetError, Position};

use crate::players::{PlayerId, PlayerRecord, PlayerTable};

pub struct ServerConfig {
    pub addr: SocketAddr,
    pub reactor_threads: usize,
    pub broadcast_interval: Duration,
    pub listen_backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(shared::SERVER_ADDR, shared::PORT),
            reactor_threads: shared::SERVER_REACTOR_THREADS,
            broadcast_interval: shared::POSITION_UPDATE_INTERVAL,
            listen_backlog: shared::TCP_LISTEN_BACKLOG,
        }
    }
}

/// A running server. Dropping it stops the reactor pool and closes every
/// socket; peers observe end of stream.
pub struct Server {
    players: Arc<PlayerTable>,
    local_addr: SocketAddr,
    _reactor: Reactor,
}

impl Server {
    /// Binds the listener, spins up the reactor pool, and registers the
    /// accept reaction and the broadcast timer.
    pub fn start(config: ServerConfig) -> io::Result<Server> {
        let listener = bind_listener(&config)?;
        let local_addr = listener.local_addr()?;
        let listener_fd = listener.as_raw_fd();

        let reactor = Reactor::new(config.reactor_threads)?;
        let players = Arc::new(PlayerTable::new());

        let handle = reactor.handle();
        let accept_players = Arc::clone(&players);
        handle.add_fd(
            listener_fd,
            Interest::READABLE,
            Box::new(move |events: EventSet, ctx: &Context| {
                if events.readable {
                    accept_connections(&listener, &accept_players, ctx);
                }
            }),
        )?;

        let broadcast_players = Arc::clone(&players);
        handle.add_timer(
            config.broadcast_interval,
            Box::new(move |ctx: &Context| broadcast_positions(&broadcast_players, ctx)),
        )?;

        info!(
            "server listening on {local_addr} ({} reactor threads, broadcast every {:?})",
            config.reactor_threads, config.broadcast_interval
        );
        Ok(Server {
            players,
            local_addr,
            _reactor: reactor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }
}

/// Non-blocking listener with address reuse and the configured backlog.
fn bind_listener(config: &ServerConfig) -> io::Result<TcpListener> {
    let socket = Socket::new(
        Domain::for_address(config.addr),
        Type::STREAM,
        Some(Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&config.addr.into())?;
    socket.listen(config.listen_backlog)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Drains the accept queue. The readiness set is edge-triggered, so every
/// pending connection must be taken before returning.
fn accept_connections(listener: &TcpListener, players: &Arc<PlayerTable>, ctx: &Context) {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                debug!("accept interrupted, retrying");
                continue;
            }
            Err(e) => {
                error!("accept failed: {e}");
                return;
            }
        };
        if let Err(e) = admit_player(stream, peer, players, ctx) {
            warn!("could not admit connection from {peer}: {e}");
        }
    }
}

/// Inserts the new player and performs the join handshake: SNAPSHOT to the
/// newcomer, JOINED to everyone else. One roster critical section covers
/// insertion and both sends, keeping them ordered ahead of any broadcast.
fn admit_player(
    stream: TcpStream,
    peer: SocketAddr,
    players: &Arc<PlayerTable>,
    ctx: &Context,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let reactor = ctx.reactor();

    let mut table = players.lock();
    let slot = table.try_insert_with(|slot| {
        let id = slot as PlayerId;
        let reaction_players = Arc::clone(players);
        let socket = AsyncSocket::register_with(reactor, stream, DEFAULT_INTEREST, |_socket| {
            Box::new(move |events: EventSet, ctx: &Context| {
                player_socket_ready(&reaction_players, id, events, ctx)
            })
        })?;
        Ok::<_, io::Error>(PlayerRecord {
            socket,
            position: Position::default(),
        })
    })?;
    let new_id = slot as PlayerId;

    // Everyone already here, in the newcomer's id space.
    let mut others = Vec::with_capacity(table.len() - 1);
    table.for_each(|_dense, other_slot, _record| {
        if other_slot != slot {
            others.push(rebase_id(other_slot as PlayerId, new_id));
        }
    });
    let snapshot = codec::encode_snapshot(&others);
    if let Some(record) = table.get(slot) {
        record.socket.schedule_write(reactor, &snapshot)?;
    }

    table.for_each(|_dense, other_slot, record| {
        if other_slot == slot {
            return;
        }
        let joined = codec::encode_joined(rebase_id(new_id, other_slot as PlayerId));
        if let Err(e) = record.socket.schedule_write(reactor, &joined) {
            warn!("could not notify player {other_slot} of the join: {e}");
        }
    });

    info!("player {new_id} joined from {peer}");
    Ok(())
}

/// Per-player reaction: position updates in, writability flushes, and
/// teardown on any sign the peer is gone.
fn player_socket_ready(players: &Arc<PlayerTable>, id: PlayerId, events: EventSet, ctx: &Context) {
    let socket = match players.socket(id) {
        Some(socket) => socket,
        // Already torn down; the event raced the removal.
        None => return,
    };
    if events.hangup {
        debug!("player {id} hung up");
        drop_player(players, id, &socket, ctx);
        return;
    }
    if events.readable {
        let mut scratch = [0u8; codec::MAX_CLIENT_MESSAGE_LEN * shared::MAX_MESSAGES_PER_READ];
        let outcome = drive_read(&socket, &mut scratch, |msg_type, rest| {
            if msg_type != codec::client_msg::UPDATE_POS {
                return Err(NetError::Protocol("unexpected message type from client"));
            }
            match Position::decode(rest) {
                Some(position) => {
                    players.set_position(id, position);
                    Ok(FrameStep::Consumed(Position::ENCODED_LEN))
                }
                None => Ok(FrameStep::Incomplete),
            }
        });
        match outcome {
            Ok(ReadOutcome::WouldBlock) => {}
            Ok(ReadOutcome::Closed) => {
                drop_player(players, id, &socket, ctx);
                return;
            }
            Err(e) => {
                warn!("player {id}: {e}; dropping the connection");
                drop_player(players, id, &socket, ctx);
                return;
            }
        }
    }
    if events.writable {
        if let Err(e) = socket.handle_writable(ctx.reactor()) {
            warn!("player {id}: flush failed: {e}; dropping the connection");
            drop_player(players, id, &socket, ctx);
        }
    }
}

/// Removes the player's reaction and record, then tells every survivor.
/// The socket closes once the last reference drops.
fn drop_player(players: &Arc<PlayerTable>, id: PlayerId, socket: &Arc<AsyncSocket>, ctx: &Context) {
    ctx.remove_fd(socket.reaction_handle(), socket.raw_fd());
    let mut table = players.lock();
    if table.remove(id as usize).is_none() {
        return;
    }
    info!("player {id} disconnected");
    table.for_each(|_dense, survivor_slot, record| {
        let left = codec::encode_left(rebase_id(id, survivor_slot as PlayerId));
        if let Err(e) = record.socket.schedule_write(ctx.reactor(), &left) {
            warn!("could not notify player {survivor_slot} of the departure: {e}");
        }
    });
}

/// One broadcast tick: every recipient gets the positions of all other
/// players in its rebased id order. The payload buffer is rewritten per
/// recipient; `schedule_write` copies it out before the next overwrite.
fn broadcast_positions(players: &Arc<PlayerTable>, ctx: &Context) {
    let table = players.lock();
    let count = table.len();
    if count == 0 {
        return;
    }
    let mut buf = vec![0u8; TYPE_LEN + Position::ENCODED_LEN * (count - 1)];
    buf[0] = server_msg::POSITIONS;
    table.for_each(|_dense, recipient_slot, recipient| {
        let mut filled = 0;
        table.for_each(|_peer_dense, peer_slot, peer| {
            if peer_slot == recipient_slot {
                return;
            }
            let at = TYPE_LEN + filled * Position::ENCODED_LEN;
            peer.position.encode_into(&mut buf[at..]);
            filled += 1;
        });
        if let Err(e) = recipient.socket.schedule_write(ctx.reactor(), &buf) {
            warn!("broadcast to player {recipient_slot} failed: {e}");
        }
    });
}
