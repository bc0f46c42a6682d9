//! Heap error types.

use crate::pointer::ObjId;
use thiserror::Error;

/// Errors raised by heap operations.
///
/// `OutOfBounds`, `InvalidObject` and `BadPointer` describe faults of the
/// program being explored; builders turn them into error-flagged states.
/// `Exhausted` and `TooLarge` are resource failures and abort the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("access of {len} bytes at offset {offset} is out of bounds of object {obj} (size {size})")]
    OutOfBounds {
        obj: ObjId,
        offset: u32,
        len: usize,
        size: usize,
    },

    #[error("object {0} does not exist")]
    InvalidObject(ObjId),

    #[error("malformed pointer word {0:#018x}")]
    BadPointer(u64),

    #[error("object of {size} bytes exceeds the addressable offset range")]
    TooLarge { size: usize },

    #[error("object pool exhausted ({limit} bytes)")]
    Exhausted { limit: usize },
}

pub type HeapResult<T> = Result<T, HeapError>;

impl HeapError {
    /// Whether the error is a fault of the explored program rather than an
    /// engine resource failure.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            HeapError::OutOfBounds { .. } | HeapError::InvalidObject(_) | HeapError::BadPointer(_)
        )
    }
}
