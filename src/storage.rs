//! The log backend abstraction. The log is the database: every entry the
//! store ever writes is appended here, and the current state is whatever a
//! replay of the log produces. The backend owns durability, total ordering
//! and hole filling; this module only captures that contract and provides an
//! in-memory implementation for tests and volatile databases.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// Position of an entry in the log.
pub type Position = u64;

#[derive(Debug, Error)]
pub enum LogError {
    /// The position has not been written yet (a hole or past the tail).
    #[error("position {0} not written")]
    NotWritten(Position),
    #[error("log backend error: {0}")]
    Backend(String),
}

/// A shared, strongly-ordered append-only log.
///
/// A successful append is durable and assigns the entry a unique position.
/// Reads of any acknowledged position are idempotent. `check_tail` returns
/// the next position that has not been assigned, so an empty log reports 0.
pub trait Log: Send + Sync {
    fn append(&self, blob: Vec<u8>) -> Result<Position, LogError>;
    fn read(&self, pos: Position) -> Result<Vec<u8>, LogError>;
    fn check_tail(&self) -> Result<Position, LogError>;

    /// Invalidate a hole so readers can make progress past it. Backends that
    /// never produce holes may treat this as a no-op.
    fn fill(&self, _pos: Position) -> Result<(), LogError> {
        Ok(())
    }
}

/// Log backend living entirely in memory. Positions are assigned densely so
/// it never produces holes.
#[derive(Default)]
pub struct MemLog {
    entries: Mutex<Vec<Arc<[u8]>>>,
}

impl MemLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Log for MemLog {
    fn append(&self, blob: Vec<u8>) -> Result<Position, LogError> {
        let mut entries = self.entries.lock();
        let pos = entries.len() as Position;
        entries.push(blob.into());
        Ok(pos)
    }

    fn read(&self, pos: Position) -> Result<Vec<u8>, LogError> {
        let entries = self.entries.lock();
        entries
            .get(pos as usize)
            .map(|e| e.to_vec())
            .ok_or(LogError::NotWritten(pos))
    }

    fn check_tail(&self) -> Result<Position, LogError> {
        Ok(self.entries.lock().len() as Position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_log_has_zero_tail() {
        let log = MemLog::new();
        assert_eq!(log.check_tail().unwrap(), 0);
        assert!(matches!(log.read(0), Err(LogError::NotWritten(0))));
    }

    #[test]
    fn append_assigns_dense_positions() {
        let log = MemLog::new();
        assert_eq!(log.append(b"a".to_vec()).unwrap(), 0);
        assert_eq!(log.append(b"b".to_vec()).unwrap(), 1);
        assert_eq!(log.check_tail().unwrap(), 2);
        assert_eq!(log.read(0).unwrap(), b"a");
        assert_eq!(log.read(1).unwrap(), b"b");
        assert!(matches!(log.read(2), Err(LogError::NotWritten(2))));
    }
}
