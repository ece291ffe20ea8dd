//! Server-side player roster.
//!
//! Every connected player is one [`PlayerRecord`] in a holey table; the slot
//! index a record lands in is that player's canonical id for the rest of the
//! session and the basis for all rebased ids on the wire. A single mutex
//! guards membership *and* the positions inside the records: joins, leaves,
//! position writes from the per-player reactions, and the broadcast's
//! iteration all serialize on it.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use shared::holey::HoleyTable;
use shared::socket::AsyncSocket;
use shared::Position;

/// Canonical player id: the slot index in the player table, as it appears
/// on the wire.
pub type PlayerId = u32;

/// One connected player.
pub struct PlayerRecord {
    pub socket: Arc<AsyncSocket>,
    pub position: Position,
}

/// The roster and its one coarse lock.
pub struct PlayerTable {
    inner: Mutex<HoleyTable<PlayerRecord>>,
}

impl PlayerTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HoleyTable::with_capacity(8)),
        }
    }

    /// Takes the roster lock. Held across every multi-step protocol action
    /// (admission, departure notification, one broadcast tick) so that no
    /// recipient ever observes a half-applied membership change.
    pub fn lock(&self) -> MutexGuard<'_, HoleyTable<PlayerRecord>> {
        self.inner.lock()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The player's socket, if they are still connected.
    pub fn socket(&self, id: PlayerId) -> Option<Arc<AsyncSocket>> {
        self.inner
            .lock()
            .get(id as usize)
            .map(|record| Arc::clone(&record.socket))
    }

    /// Stores a freshly-reported position. Returns false if the player left
    /// between the read and this write.
    pub fn set_position(&self, id: PlayerId, position: Position) -> bool {
        match self.inner.lock().get_mut(id as usize) {
            Some(record) => {
                record.position = position;
                true
            }
            None => false,
        }
    }

    pub fn position(&self, id: PlayerId) -> Option<Position> {
        self.inner.lock().get(id as usize).map(|r| r.position)
    }

    /// Canonical ids of everyone except `exclude`, ascending.
    pub fn other_ids(&self, exclude: PlayerId) -> Vec<PlayerId> {
        let table = self.inner.lock();
        let mut ids = Vec::with_capacity(table.len().saturating_sub(1));
        table.for_each(|_dense, slot, _record| {
            if slot as PlayerId != exclude {
                ids.push(slot as PlayerId);
            }
        });
        ids
    }
}

impl Default for PlayerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::reactor::{Context, EventSet, Reactor};
    use shared::socket::DEFAULT_INTEREST;
    use std::net::TcpListener;

    /// Builds a registered socket for a throwaway localhost connection.
    fn test_socket(reactor: &Reactor, listener: &TcpListener) -> Arc<AsyncSocket> {
        let addr = listener.local_addr().unwrap();
        let ours = std::net::TcpStream::connect(addr).unwrap();
        ours.set_nonblocking(true).unwrap();
        let _ = listener.accept().unwrap();
        AsyncSocket::register_with(
            &reactor.handle(),
            mio::net::TcpStream::from_std(ours),
            DEFAULT_INTEREST,
            |_socket| Box::new(|_events: EventSet, _ctx: &Context| {}),
        )
        .unwrap()
    }

    fn insert_player(table: &PlayerTable, socket: Arc<AsyncSocket>) -> PlayerId {
        table.lock().insert(PlayerRecord {
            socket,
            position: Position::default(),
        }) as PlayerId
    }

    #[test]
    fn test_ids_assign_lowest_free_slot() {
        let reactor = Reactor::new(1).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let table = PlayerTable::new();

        let a = insert_player(&table, test_socket(&reactor, &listener));
        let b = insert_player(&table, test_socket(&reactor, &listener));
        let c = insert_player(&table, test_socket(&reactor, &listener));
        assert_eq!((a, b, c), (0, 1, 2));

        table.lock().remove(b as usize);
        let d = insert_player(&table, test_socket(&reactor, &listener));
        assert_eq!(d, b, "a departed player's id is reused");
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_positions_update_under_the_roster_lock() {
        let reactor = Reactor::new(1).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let table = PlayerTable::new();
        let id = insert_player(&table, test_socket(&reactor, &listener));

        assert_eq!(table.position(id), Some(Position::default()));
        assert!(table.set_position(id, Position::new(1, 2, 3)));
        assert_eq!(table.position(id), Some(Position::new(1, 2, 3)));

        table.lock().remove(id as usize);
        assert!(!table.set_position(id, Position::new(4, 5, 6)));
        assert_eq!(table.position(id), None);
    }

    #[test]
    fn test_other_ids_excludes_self_and_is_ascending() {
        let reactor = Reactor::new(1).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let table = PlayerTable::new();
        for _ in 0..4 {
            insert_player(&table, test_socket(&reactor, &listener));
        }
        assert_eq!(table.other_ids(2), vec![0, 1, 3]);
        assert_eq!(table.other_ids(9), vec![0, 1, 2, 3]);
    }
}
