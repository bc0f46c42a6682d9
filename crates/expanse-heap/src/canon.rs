//! Canonical comparison and hashing of snapshots.
//!
//! Both walk the same sequence: the snapshot's `(id, image)` items in id
//! order, leaving out every id in the [`SkipSet`]. Equal sequences therefore
//! always hash equally.

use crate::hash::Jenkins;
use crate::pointer::ObjId;
use crate::snapshot::{SnapItem, Snapshot};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Object ids ignored by comparison and hashing.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct SkipSet(Arc<BTreeSet<ObjId>>);

impl SkipSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn contains(&self, id: ObjId) -> bool {
        !self.0.is_empty() && self.0.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjId> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<ObjId> for SkipSet {
    fn from_iter<I: IntoIterator<Item = ObjId>>(iter: I) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

fn visible<'a>(s: &'a Snapshot, skip: &'a SkipSet) -> impl Iterator<Item = &'a SnapItem> + 'a {
    s.iter().filter(move |item| !skip.contains(item.id))
}

/// Lexicographic order over the visible `(id, image)` sequences.
pub fn compare(a: &Snapshot, b: &Snapshot, skip: &SkipSet) -> Ordering {
    if a.ptr_eq(b) {
        return Ordering::Equal;
    }
    let mut left = visible(a, skip);
    let mut right = visible(b, skip);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = x.id.cmp(&y.id).then_with(|| {
                    if Arc::ptr_eq(&x.image, &y.image) {
                        Ordering::Equal
                    } else {
                        x.image[..].cmp(&y.image[..])
                    }
                });
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

pub fn equal(a: &Snapshot, b: &Snapshot, skip: &SkipSet) -> bool {
    compare(a, b, skip) == Ordering::Equal
}

/// Stable 64-bit hash of the visible `(id, image)` sequence.
pub fn hash_snapshot(s: &Snapshot, skip: &SkipSet) -> u64 {
    let mut h = Jenkins::default();
    let mut count = 0u32;
    for item in visible(s, skip) {
        h.update_u32(item.id.raw());
        h.update_u32(item.image.len() as u32);
        h.update(&item.image);
        count += 1;
    }
    h.update_u32(count);
    h.finalize().0
}
