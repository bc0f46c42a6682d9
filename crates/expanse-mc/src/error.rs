//! Engine error types.

use expanse_heap::HeapError;
use std::ops::Range;
use thiserror::Error;

/// Fatal failures of the dedup store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("hash table probe sequence exceeded {probes} probes (capacity {capacity})")]
    CollisionBound { probes: usize, capacity: usize },

    #[error(transparent)]
    Heap(#[from] HeapError),
}

/// A recorded step disagreed with the transitions the builder produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("trace is empty")]
    Empty,

    #[error("step {step}: no transition with choices {choices:?}")]
    NoSuchEdge { step: usize, choices: Vec<u32> },

    #[error("step {step}: choices {choices:?} lead to different states on replay")]
    Diverged { step: usize, choices: Vec<u32> },
}

/// Fatal errors that abort a search.
///
/// Faults of the explored program never appear here; builders report them
/// as error-flagged states.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("heap failure: {0}")]
    Heap(#[from] HeapError),

    #[error("transition relation is not deterministic: {0}")]
    Nondeterminism(#[from] ReplayError),

    #[error("builder failed: {0}")]
    Builder(String),

    #[error("builder produced no initial states")]
    NoInitialStates,

    #[error("search worker panicked")]
    WorkerPanicked,

    #[error("cannot start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Error in a graph or trace text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    /// Byte range of the offending token in the source.
    pub span: Range<usize>,
}

/// Lines of `src` paired with the byte offset each starts at. Both `\n` and
/// `\r\n` endings are stripped.
pub(crate) fn source_lines(src: &str) -> impl Iterator<Item = (usize, &str)> {
    src.split_inclusive('\n').scan(0, |offset, raw| {
        let start = *offset;
        *offset += raw.len();
        let line = raw.strip_suffix('\n').unwrap_or(raw);
        Some((start, line.strip_suffix('\r').unwrap_or(line)))
    })
}
