//! The transition-relation contract consumed by the search.

use crate::error::EngineResult;
use crate::state::{Label, State};
use expanse_heap::SkipSet;

/// Produces the states of a system and the transitions between them.
///
/// Each search worker owns a clone, so implementations may keep private
/// scratch state (an interpreter, a heap workspace) without locking.
///
/// `edges` must be deterministic: calling it on two states whose snapshots
/// compare equal (under [`Builder::skip_ids`]) yields the same sequence of
/// labels leading to pairwise equal successors. Replay relies on this.
///
/// Faults of the explored system are not errors here. A builder reports
/// them by yielding a successor with `flags.error` set. `Err` is reserved
/// for failures that must abort the whole run.
pub trait Builder: Clone + Send {
    /// Yield every initial state. The label's choices identify which initial
    /// state was produced, for replay.
    fn initials<Y>(&mut self, yield_: Y) -> EngineResult<()>
    where
        Y: FnMut(State, Label);

    /// Yield every successor of `from`, one per nondeterministic choice.
    fn edges<Y>(&mut self, from: &State, yield_: Y) -> EngineResult<()>
    where
        Y: FnMut(State, Label);

    /// Objects whose content does not affect state identity.
    fn skip_ids(&self) -> SkipSet {
        SkipSet::new()
    }
}
