//! The deduplicating state store.

use crate::error::StoreError;
use crate::hashset::{ConcurrentSet, SlotHasher};
use crate::state::{Fingerprint, State};
use expanse_heap::{compare, hash_snapshot, SkipSet};
use std::cmp::Ordering;

/// Hashes and compares states by their canonical snapshot image.
#[derive(Clone, Default)]
pub struct Canonical {
    pub skip: SkipSet,
}

impl SlotHasher<State> for Canonical {
    #[inline]
    fn hash(&self, state: &State) -> u64 {
        hash_snapshot(&state.snap, &self.skip)
    }

    #[inline]
    fn equal(&self, a: &State, b: &State) -> bool {
        compare(&a.snap, &b.snap, &self.skip) == Ordering::Equal
    }
}

/// Thread-safe set of visited states.
///
/// Holds one canonical copy of every distinct state. Handles returned by
/// [`DedupStore::insert_or_get`] for equal states share the same snapshot,
/// so later identity checks are pointer comparisons.
pub struct DedupStore {
    set: ConcurrentSet<State, Canonical>,
}

impl DedupStore {
    pub fn new(skip: SkipSet) -> Self {
        Self::with_capacity(skip, 1 << 10)
    }

    pub fn with_capacity(skip: SkipSet, capacity: usize) -> Self {
        Self {
            set: ConcurrentSet::with_capacity(Canonical { skip }, capacity),
        }
    }

    pub fn skip_ids(&self) -> &SkipSet {
        &self.set.hasher().skip
    }

    #[inline]
    pub fn fingerprint(&self, state: &State) -> Fingerprint {
        Fingerprint::from_u64(self.set.hasher().hash(state))
    }

    /// Return the canonical copy of `state` and whether it was new.
    pub fn insert_or_get(&self, state: State) -> Result<(State, bool), StoreError> {
        let fp = self.fingerprint(&state);
        self.insert_hinted(fp, state)
    }

    /// Same as [`insert_or_get`](Self::insert_or_get) with a fingerprint the
    /// caller already computed. A hash match is always confirmed by full
    /// comparison.
    pub fn insert_hinted(&self, fp: Fingerprint, state: State) -> Result<(State, bool), StoreError> {
        self.set.insert_hashed(fp.as_u64(), state)
    }

    /// Same as [`insert_or_get`](Self::insert_or_get), calling `on_new` with
    /// a state this call adds before other threads can find it.
    pub fn insert_or_get_with(
        &self,
        state: State,
        on_new: impl FnOnce(&State),
    ) -> Result<(State, bool), StoreError> {
        let fp = self.fingerprint(&state);
        self.set.insert_hashed_with(fp.as_u64(), state, on_new)
    }

    pub fn get(&self, state: &State) -> Option<State> {
        self.set.find(state)
    }

    pub fn contains(&self, state: &State) -> bool {
        self.set.contains(state)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.set.capacity()
    }

    /// Distinct states that shared a full hash.
    pub fn collisions(&self) -> usize {
        self.set.collisions()
    }

    /// A copy of every stored state, in no particular order.
    pub fn states(&self) -> Vec<State> {
        let mut out = Vec::with_capacity(self.len());
        self.set.for_each(|s| out.push(s.clone()));
        out
    }
}

impl std::fmt::Debug for DedupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupStore")
            .field("states", &self.len())
            .field("capacity", &self.capacity())
            .field("collisions", &self.collisions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expanse_heap::{CowHeap, HeapLoc, ObjId, Pool};
    use std::sync::Arc;

    fn state(heap: &mut CowHeap, a: u32, b: u32) -> State {
        let pool = Arc::clone(heap.pool());
        *heap = CowHeap::new(pool);
        let x = heap.make(4).unwrap();
        let y = heap.make(4).unwrap();
        heap.write_u32(HeapLoc::base(x), a).unwrap();
        heap.write_u32(HeapLoc::base(y), b).unwrap();
        State::new(heap.snapshot().unwrap())
    }

    #[test]
    fn test_insert_returns_canonical() {
        let mut heap = CowHeap::new(Arc::new(Pool::new()));
        let store = DedupStore::new(SkipSet::new());
        let s1 = state(&mut heap, 1, 2);
        let s2 = state(&mut heap, 1, 2);
        assert!(!s1.same(&s2));

        let (c1, new1) = store.insert_or_get(s1).unwrap();
        let (c2, new2) = store.insert_or_get(s2).unwrap();
        assert!(new1);
        assert!(!new2);
        assert!(c1.same(&c2));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_skip_ids_merge_states() {
        let mut heap = CowHeap::new(Arc::new(Pool::new()));
        let store = DedupStore::new([ObjId::new(2)].into_iter().collect());
        assert!(store.insert_or_get(state(&mut heap, 1, 2)).unwrap().1);
        assert!(!store.insert_or_get(state(&mut heap, 1, 3)).unwrap().1);
        assert!(store.insert_or_get(state(&mut heap, 2, 3)).unwrap().1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.states().len(), 2);
    }

    #[test]
    fn test_contains_and_get() {
        let mut heap = CowHeap::new(Arc::new(Pool::new()));
        let store = DedupStore::new(SkipSet::new());
        let (canon, _) = store.insert_or_get(state(&mut heap, 5, 5)).unwrap();
        let probe = state(&mut heap, 5, 5);
        assert!(store.contains(&probe));
        assert!(store.get(&probe).unwrap().same(&canon));
        assert!(!store.contains(&state(&mut heap, 5, 6)));
    }
}
