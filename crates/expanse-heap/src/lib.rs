//! Copy-on-write object heap for explicit-state model checking.
//!
//! A [`CowHeap`] is a private, mutable workspace layered over an immutable
//! [`Snapshot`]. Objects touched since the last snapshot live in the
//! workspace; everything else is read straight from the snapshot. Freezing
//! the workspace interns the touched objects into the shared [`Pool`] and
//! produces a new snapshot, which is cheap to clone, compare and hash.

pub mod canon;
pub mod cow;
pub mod error;
pub mod hash;
pub mod pointer;
pub mod pool;
pub mod snapshot;

pub use canon::{compare, equal, hash_snapshot, SkipSet};
pub use cow::CowHeap;
pub use error::{HeapError, HeapResult};
pub use pointer::{HeapLoc, ObjId, Pointer, PointerType};
pub use pool::{Image, Pool};
pub use snapshot::{SnapItem, Snapshot};
