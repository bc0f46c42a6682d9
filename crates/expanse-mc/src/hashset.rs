//! Concurrent open-addressed hash set.
//!
//! Each slot holds a tag word and a write-once value cell. The tag is the
//! element's hash shifted left by one, with the low bit marking a slot whose
//! value is still being written; a zero tag is an empty slot. Writers claim a
//! slot by compare-and-swap from empty to `tag | WRITING`, store the value,
//! then clear the bit with release ordering. Readers that find the bit set
//! spin until it clears.
//!
//! Probing is linear within an aligned group of 16 slots, then jumps between
//! groups quadratically. The table doubles once it is three quarters full;
//! growth takes the table's write lock, so it waits for in-flight inserts and
//! blocks new ones until the rehash is done.

use crate::error::StoreError;
use crossbeam::utils::Backoff;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;
use tracing::{debug, warn};

const EMPTY: u64 = 0;
const WRITING: u64 = 1;

/// Probes within one aligned group before switching to quadratic jumps.
const THRESHOLD: usize = 16;

/// Probe count after which the table is considered broken.
pub const MAX_COLLISIONS: usize = 1 << 16;

const MIN_CAPACITY: usize = 1 << 6;

/// Hashing and equality for the elements of a [`ConcurrentSet`].
pub trait SlotHasher<V>: Send + Sync {
    fn hash(&self, value: &V) -> u64;
    fn equal(&self, a: &V, b: &V) -> bool;
}

/// Normalize a hash so that its tag is never empty.
#[inline]
fn normalize(hash: u64) -> u64 {
    let h = hash & (u64::MAX >> 1);
    if h == 0 {
        1
    } else {
        h
    }
}

#[inline]
fn tag_of(hash: u64) -> u64 {
    normalize(hash) << 1
}

/// Slot index of the `i`-th probe for `hash`.
#[inline]
fn probe(hash: u64, i: usize, mask: usize) -> usize {
    let h = (hash as usize) & !(THRESHOLD - 1);
    if i < THRESHOLD {
        h.wrapping_add(i) & mask
    } else {
        let j = i & (THRESHOLD - 1);
        let i = i >> 4;
        let hop = (3 * i).wrapping_add(2 * i.wrapping_mul(i)) << 4;
        h.wrapping_add(j).wrapping_add(hop) & mask
    }
}

/// What a reader found in a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Writing,
    Full(u64),
}

/// One cell of the table: a tag word guarding a write-once value.
pub struct AtomicSlot<V> {
    tag: AtomicU64,
    value: OnceLock<V>,
}

impl<V> Default for AtomicSlot<V> {
    fn default() -> Self {
        Self {
            tag: AtomicU64::new(EMPTY),
            value: OnceLock::new(),
        }
    }
}

impl<V> AtomicSlot<V> {
    #[inline]
    pub fn state(&self) -> SlotState {
        let tag = self.tag.load(Ordering::Acquire);
        if tag == EMPTY {
            SlotState::Empty
        } else if tag & WRITING != 0 {
            SlotState::Writing
        } else {
            SlotState::Full(tag)
        }
    }

    /// Spin until no writer holds the slot.
    pub fn wait(&self) -> SlotState {
        let backoff = Backoff::new();
        loop {
            match self.state() {
                SlotState::Writing => backoff.snooze(),
                other => return other,
            }
        }
    }

    /// Try to take an empty slot for writing. On failure the slot's current
    /// state is returned.
    #[inline]
    pub fn claim(&self, tag: u64) -> Result<(), SlotState> {
        match self.tag.compare_exchange(
            EMPTY,
            tag | WRITING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => Err(self.state()),
        }
    }

    /// Store the value into a claimed slot and make it visible.
    pub fn publish(&self, tag: u64, value: V) {
        // A claimed slot has never held a value.
        let _ = self.value.set(value);
        self.tag.store(tag, Ordering::Release);
    }

    #[inline]
    pub fn get(&self) -> Option<&V> {
        self.value.get()
    }

    fn into_parts(self) -> (u64, Option<V>) {
        (self.tag.into_inner(), self.value.into_inner())
    }
}

struct Table<V> {
    slots: Box<[AtomicSlot<V>]>,
    mask: usize,
}

impl<V> Table<V> {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY).next_power_of_two();
        let slots: Vec<AtomicSlot<V>> = (0..capacity).map(|_| AtomicSlot::default()).collect();
        Self {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Insert during a rehash, when no other thread can see the table.
    fn place(&mut self, tag: u64, value: V) -> Result<(), StoreError> {
        let hash = tag >> 1;
        for i in 0..MAX_COLLISIONS {
            let idx = probe(hash, i, self.mask);
            let slot = &mut self.slots[idx];
            if *slot.tag.get_mut() == EMPTY {
                *slot.tag.get_mut() = tag;
                let _ = slot.value.set(value);
                return Ok(());
            }
        }
        Err(StoreError::CollisionBound {
            probes: MAX_COLLISIONS,
            capacity: self.capacity(),
        })
    }
}

/// A grow-only concurrent set handing out one canonical copy per element.
pub struct ConcurrentSet<V, H> {
    table: RwLock<Table<V>>,
    hasher: H,
    count: AtomicUsize,
    collisions: AtomicUsize,
    probe_limit: usize,
}

impl<V, H> ConcurrentSet<V, H>
where
    V: Clone + Send + Sync,
    H: SlotHasher<V>,
{
    pub fn new(hasher: H) -> Self {
        Self::with_capacity(hasher, 1 << 10)
    }

    pub fn with_capacity(hasher: H, capacity: usize) -> Self {
        Self {
            table: RwLock::new(Table::new(capacity)),
            hasher,
            count: AtomicUsize::new(0),
            collisions: AtomicUsize::new(0),
            probe_limit: MAX_COLLISIONS,
        }
    }

    /// Lower the probe count at which inserts fail.
    pub fn with_probe_limit(mut self, limit: usize) -> Self {
        self.probe_limit = limit.min(MAX_COLLISIONS);
        self
    }

    pub fn hasher(&self) -> &H {
        &self.hasher
    }

    pub fn insert(&self, value: V) -> Result<(V, bool), StoreError> {
        let hash = self.hasher.hash(&value);
        self.insert_hashed(hash, value)
    }

    /// Insert `value` with a precomputed hash.
    ///
    /// Returns the canonical element and whether this call added it. When two
    /// threads race on equal elements exactly one of them sees `true`, and
    /// both get the same canonical element back.
    pub fn insert_hashed(&self, hash: u64, value: V) -> Result<(V, bool), StoreError> {
        self.insert_hashed_with(hash, value, |_| {})
    }

    /// Like [`insert_hashed`](Self::insert_hashed), calling `on_new` with the
    /// element this call adds before any other thread can find it.
    pub fn insert_hashed_with(
        &self,
        hash: u64,
        value: V,
        on_new: impl FnOnce(&V),
    ) -> Result<(V, bool), StoreError> {
        let hash = normalize(hash);
        let tag = tag_of(hash);
        let table = self.table.read();
        let mut shared = false;

        for i in 0..self.probe_limit {
            let slot = &table.slots[probe(hash, i, table.mask)];
            let mut seen = slot.state();
            loop {
                match seen {
                    SlotState::Empty => match slot.claim(tag) {
                        Ok(()) => {
                            let canonical = value.clone();
                            on_new(&canonical);
                            slot.publish(tag, value);
                            let capacity = table.capacity();
                            drop(table);
                            if shared && self.collisions.fetch_add(1, Ordering::Relaxed) == 0 {
                                warn!(hash, "distinct states share a full hash");
                            }
                            let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
                            if count * 4 > capacity * 3 {
                                self.grow(capacity)?;
                            }
                            return Ok((canonical, true));
                        }
                        Err(now) => seen = now,
                    },
                    SlotState::Writing => seen = slot.wait(),
                    SlotState::Full(found) if found == tag => {
                        if let Some(existing) = slot.get() {
                            if self.hasher.equal(existing, &value) {
                                return Ok((existing.clone(), false));
                            }
                        }
                        shared = true;
                        break;
                    }
                    SlotState::Full(_) => break,
                }
            }
        }

        Err(StoreError::CollisionBound {
            probes: self.probe_limit,
            capacity: table.capacity(),
        })
    }

    /// Look up the canonical element equal to `value`.
    pub fn find(&self, value: &V) -> Option<V> {
        let hash = normalize(self.hasher.hash(value));
        let tag = tag_of(hash);
        let table = self.table.read();
        for i in 0..self.probe_limit {
            let slot = &table.slots[probe(hash, i, table.mask)];
            match slot.wait() {
                SlotState::Empty => return None,
                SlotState::Full(found) if found == tag => {
                    if let Some(existing) = slot.get() {
                        if self.hasher.equal(existing, value) {
                            return Some(existing.clone());
                        }
                    }
                }
                _ => {}
            }
        }
        None
    }

    pub fn contains(&self, value: &V) -> bool {
        self.find(value).is_some()
    }

    /// Visit every published element.
    pub fn for_each(&self, mut f: impl FnMut(&V)) {
        let table = self.table.read();
        for slot in table.slots.iter() {
            if let SlotState::Full(_) = slot.state() {
                if let Some(value) = slot.get() {
                    f(value);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.table.read().capacity()
    }

    /// Number of elements added while another element with the same full
    /// hash was already stored.
    pub fn collisions(&self) -> usize {
        self.collisions.load(Ordering::Relaxed)
    }

    /// Double the table, unless another thread already grew it past `seen`.
    fn grow(&self, seen: usize) -> Result<(), StoreError> {
        let mut table = self.table.write();
        if table.capacity() != seen {
            return Ok(());
        }
        let mut next = Table::new(seen * 2);
        let old = std::mem::replace(&mut *table, Table::new(0));
        let mut result = Ok(());
        for slot in old.slots.into_vec() {
            if let (tag, Some(value)) = slot.into_parts() {
                if let Err(e) = next.place(tag, value) {
                    result = Err(e);
                    break;
                }
            }
        }
        debug!(from = seen, to = next.capacity(), "grew state table");
        *table = next;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Modulo(u64);

    impl SlotHasher<u64> for Modulo {
        fn hash(&self, v: &u64) -> u64 {
            v % self.0
        }
        fn equal(&self, a: &u64, b: &u64) -> bool {
            a == b
        }
    }

    #[test]
    fn test_slot_claim_and_publish() {
        let slot: AtomicSlot<u32> = AtomicSlot::default();
        assert_eq!(slot.state(), SlotState::Empty);
        slot.claim(8).unwrap();
        assert_eq!(slot.state(), SlotState::Writing);
        assert_eq!(slot.claim(8), Err(SlotState::Writing));
        slot.publish(8, 77);
        assert_eq!(slot.state(), SlotState::Full(8));
        assert_eq!(slot.get(), Some(&77));
        assert_eq!(slot.claim(10), Err(SlotState::Full(8)));
    }

    #[test]
    fn test_probe_sequence() {
        let mask = (1 << 12) - 1;
        // Linear inside the aligned group.
        let first: Vec<usize> = (0..16).map(|i| probe(0x123, i, mask)).collect();
        assert_eq!(first, (0x120..0x130).collect::<Vec<_>>());
        // Quadratic groups never revisit a slot within one table.
        let mut seen = std::collections::HashSet::new();
        for i in 0..=mask {
            assert!(seen.insert(probe(0x123, i, mask)), "probe {i} repeated");
        }
    }

    #[test]
    fn test_tag_never_empty() {
        assert_ne!(tag_of(0), EMPTY);
        assert_ne!(tag_of(1 << 63), EMPTY);
        assert_eq!(tag_of(5) & WRITING, 0);
    }

    #[test]
    fn test_insert_and_grow() {
        let set = ConcurrentSet::with_capacity(Modulo(u64::MAX), 64);
        for v in 0..1000u64 {
            assert_eq!(set.insert(v).unwrap(), (v, true));
        }
        for v in 0..1000u64 {
            assert_eq!(set.insert(v).unwrap(), (v, false));
        }
        assert_eq!(set.len(), 1000);
        assert!(set.capacity() >= 1024);
        assert!(set.contains(&999));
        assert!(!set.contains(&1000));
        let mut sum = 0;
        set.for_each(|v| sum += v);
        assert_eq!(sum, (0..1000).sum::<u64>());
    }

    #[test]
    fn test_hash_collisions_resolved_by_equality() {
        let set = ConcurrentSet::new(Modulo(4));
        for v in 0..100u64 {
            assert!(set.insert(v).unwrap().1);
        }
        assert_eq!(set.len(), 100);
        // Hashes 0 and 1 normalize to the same tag, so only the first
        // elements of the three tags are added without a collision.
        assert_eq!(set.collisions(), 97);
        for v in 0..100u64 {
            assert!(set.contains(&v));
            assert!(!set.insert(v).unwrap().1);
        }
        assert_eq!(set.collisions(), 97);
    }

    #[test]
    fn test_collision_bound() {
        let set = ConcurrentSet::with_capacity(Modulo(1), 1 << 10).with_probe_limit(64);
        let mut failed = None;
        for v in 0..100u64 {
            if let Err(e) = set.insert(v) {
                failed = Some(e);
                break;
            }
        }
        assert!(matches!(failed, Some(StoreError::CollisionBound { .. })));
    }

    #[test]
    fn test_concurrent_insert_exactly_one_winner() {
        use std::thread;

        let set = Arc::new(ConcurrentSet::with_capacity(Modulo(u64::MAX), 64));
        let wins = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let set = Arc::clone(&set);
                let wins = Arc::clone(&wins);
                thread::spawn(move || {
                    for v in 0..2000u64 {
                        if set.insert(v).unwrap().1 {
                            wins.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(set.len(), 2000);
        assert_eq!(wins.load(Ordering::Relaxed), 2000);
    }
}
