//! Camera position accessor.
//!
//! The rendering pipeline owns the real camera; the networking layer only
//! needs a thread-safe way to read the current position when the upload
//! timer fires. This type is that seam: the renderer writes through
//! [`Camera::set_position`] once per frame, the timer reaction reads
//! through [`Camera::position`] from whichever reactor thread it runs on.

use parking_lot::Mutex;
use shared::Position;

pub struct Camera {
    position: Mutex<Position>,
}

impl Camera {
    pub fn new(initial: Position) -> Self {
        Self {
            position: Mutex::new(initial),
        }
    }

    pub fn position(&self) -> Position {
        *self.position.lock()
    }

    pub fn set_position(&self, position: Position) {
        *self.position.lock() = position;
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(Position::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_roundtrip() {
        let camera = Camera::default();
        assert_eq!(camera.position(), Position::default());
        camera.set_position(Position::new(3, -4, 5));
        assert_eq!(camera.position(), Position::new(3, -4, 5));
    }
}
