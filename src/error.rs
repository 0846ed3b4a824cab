use core::fmt;

use crate::modules::backing_store::StoreError;

/// Recoverable failure classes surfaced to callers.
///
/// Integrity violations (reference count underflow, corrupted housekeeping
/// tags, unmapping a segment that is not resident) indicate a logic defect
/// rather than an environmental condition and panic instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    /// Every window in the pool is referenced and the pool is at its limit.
    WindowsExhausted,
    /// The backing store could not be grown or mapped.
    Store(StoreError),
    /// The handle's generation does not match the node's stored generation,
    /// the node is on the free list, or the index is out of range.
    StaleHandle,
}

impl From<StoreError> for ArenaError {
    fn from(err: StoreError) -> Self {
        ArenaError::Store(err)
    }
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArenaError::WindowsExhausted => write!(f, "all map windows in use"),
            ArenaError::Store(err) => write!(f, "backing store failure: {}", err),
            ArenaError::StaleHandle => write!(f, "stale or invalid node handle"),
        }
    }
}

impl std::error::Error for ArenaError {}
