//! Local mirror of the other players.
//!
//! Indices in the mirror are the ids the server put on the wire for *this*
//! client (its rebased id space), so inserts land exactly where SNAPSHOT and
//! JOINED say and POSITIONS payloads apply in ascending id order. One mutex
//! guards membership and positions together; the read reaction and the
//! renderer's per-frame read both take it.

use log::warn;
use parking_lot::Mutex;
use shared::holey::ReplicaTable;
use shared::Position;

pub struct PeerMirror {
    table: Mutex<ReplicaTable<Position>>,
}

impl PeerMirror {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(ReplicaTable::new()),
        }
    }

    /// Number of mirrored peers. POSITIONS payload length is derived from
    /// this, so it must track every SNAPSHOT/JOINED/LEFT exactly.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resets the mirror from the join-time SNAPSHOT. Every listed peer
    /// starts at the origin until the first POSITIONS arrives.
    pub fn apply_snapshot(&self, ids: &[u32]) {
        let mut table = self.table.lock();
        *table = ReplicaTable::with_capacity(ids.len().max(8));
        for &id in ids {
            table.insert(id as usize, Position::default());
        }
    }

    pub fn apply_joined(&self, id: u32) {
        let mut table = self.table.lock();
        if table.insert(id as usize, Position::default()).is_some() {
            warn!("join for id {id} which was already mirrored");
        }
    }

    pub fn apply_left(&self, id: u32) {
        if self.table.lock().remove(id as usize).is_none() {
            warn!("departure for id {id} which was not mirrored");
        }
    }

    /// Applies one POSITIONS payload: the i-th triple goes to the i-th live
    /// peer in ascending id order. The caller has already checked that
    /// `payload` holds one triple per mirrored peer.
    pub fn apply_positions(&self, payload: &[u8]) {
        let mut table = self.table.lock();
        table.for_each_mut(|dense, _id, position| {
            if let Some(update) = Position::decode(&payload[dense * Position::ENCODED_LEN..]) {
                *position = update;
            }
        });
    }

    pub fn position_of(&self, id: u32) -> Option<Position> {
        self.table.lock().get(id as usize).copied()
    }

    /// Snapshot of `(id, position)` pairs in ascending id order, for the
    /// renderer's per-frame read.
    pub fn peers(&self) -> Vec<(u32, Position)> {
        let table = self.table.lock();
        let mut peers = Vec::with_capacity(table.len());
        table.for_each(|_dense, id, position| peers.push((id as u32, *position)));
        peers
    }
}

impl Default for PeerMirror {
    fn default() -> Self {
        Self::new()
    }
}
