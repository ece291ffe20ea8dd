//! Wire format for client/server messages.
//!
//! Every message is a one-byte type discriminator followed by a
//! type-specific payload. All multi-byte integers are little-endian with no
//! padding; the encoding is byte-exact, so the functions here are the only
//! place that knows per-type layout.
//!
//! Server → client:
//!
//! | type | payload |
//! |------|---------|
//! | 0 `SNAPSHOT`  | `u32` count N, then N × `u32` peer id |
//! | 1 `JOINED`    | `u32` rebased id of the newcomer |
//! | 2 `LEFT`      | `u32` rebased id of the departed |
//! | 3 `POSITIONS` | one 12-byte position per mirrored peer, id order |
//!
//! Client → server:
//!
//! | type | payload |
//! |------|---------|
//! | 0 `UPDATE_POS` | `i32` x, `i32` y, `i32` z |

/// Message types the server sends.
pub mod server_msg {
    /// Ids of all players already connected, sent once right after accept.
    pub const SNAPSHOT: u8 = 0;
    /// A peer joined.
    pub const JOINED: u8 = 1;
    /// A peer disconnected.
    pub const LEFT: u8 = 2;
    /// Positions of every mirrored peer, broadcast periodically.
    pub const POSITIONS: u8 = 3;
}

/// Message types the client sends.
pub mod client_msg {
    /// The client's own position.
    pub const UPDATE_POS: u8 = 0;
}

/// Bytes occupied by a message type discriminator.
pub const TYPE_LEN: usize = 1;

/// Bytes occupied by a player id on the wire.
pub const ID_LEN: usize = 4;

/// Longest message the server can receive: a type byte plus one position.
pub const MAX_CLIENT_MESSAGE_LEN: usize = TYPE_LEN + Position::ENCODED_LEN;

/// A point in world space, fixed to signed 32-bit components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Position {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Position {
    /// Encoded size: three unpadded little-endian `i32`s.
    pub const ENCODED_LEN: usize = 12;

    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Writes the position into `out[..12]`.
    ///
    /// # Panics
    /// If `out` is shorter than [`Self::ENCODED_LEN`].
    pub fn encode_into(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.x.to_le_bytes());
        out[4..8].copy_from_slice(&self.y.to_le_bytes());
        out[8..12].copy_from_slice(&self.z.to_le_bytes());
    }

    /// Reads a position from the front of `buf`, or `None` if fewer than
    /// 12 bytes are available.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        Some(Self {
            x: read_i32_le(buf)?,
            y: read_i32_le(&buf[4..])?,
            z: read_i32_le(&buf[8..])?,
        })
    }
}

/// Reads a little-endian `u32` from the front of `buf`.
pub fn read_u32_le(buf: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = buf.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Reads a little-endian `i32` from the front of `buf`.
pub fn read_i32_le(buf: &[u8]) -> Option<i32> {
    let bytes: [u8; 4] = buf.get(..4)?.try_into().ok()?;
    Some(i32::from_le_bytes(bytes))
}

/// Maps a canonical player id into a recipient's dense id space.
///
/// Each recipient sees the other players numbered as if its own id were
/// removed from the sequence: ids above the recipient's shift down by one,
/// ids below pass through. Applied to JOINED and LEFT payloads and to the
/// ordering of POSITIONS.
pub fn rebase_id(id: u32, recipient: u32) -> u32 {
    id - u32::from(recipient < id)
}

/// SNAPSHOT naming the already-connected peers. With no peers the payload
/// is a lone zero count.
pub fn encode_snapshot(peer_ids: &[u32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(TYPE_LEN + ID_LEN + ID_LEN * peer_ids.len());
    buf.push(server_msg::SNAPSHOT);
    buf.extend_from_slice(&(peer_ids.len() as u32).to_le_bytes());
    for id in peer_ids {
        buf.extend_from_slice(&id.to_le_bytes());
    }
    buf
}

pub fn encode_joined(rebased_id: u32) -> [u8; 5] {
    encode_id_message(server_msg::JOINED, rebased_id)
}

pub fn encode_left(rebased_id: u32) -> [u8; 5] {
    encode_id_message(server_msg::LEFT, rebased_id)
}

fn encode_id_message(kind: u8, id: u32) -> [u8; 5] {
    let mut buf = [0u8; 5];
    buf[0] = kind;
    buf[1..5].copy_from_slice(&id.to_le_bytes());
    buf
}

pub fn encode_update_pos(position: Position) -> [u8; MAX_CLIENT_MESSAGE_LEN] {
    let mut buf = [0u8; MAX_CLIENT_MESSAGE_LEN];
    buf[0] = client_msg::UPDATE_POS;
    position.encode_into(&mut buf[TYPE_LEN..]);
    buf
}
