//! Immutable heap snapshots.

use crate::pointer::ObjId;
use crate::pool::Image;
use std::fmt;
use std::sync::Arc;

/// One frozen object: its id and its interned image.
#[derive(Clone, PartialEq, Eq)]
pub struct SnapItem {
    pub id: ObjId,
    pub image: Image,
}

impl fmt::Debug for SnapItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:02x?}", self.id, &self.image[..])
    }
}

/// A frozen heap: `(id, image)` pairs sorted by id.
///
/// Snapshots are shared and never mutated after creation. Cloning one only
/// bumps a reference count.
#[derive(Clone)]
pub struct Snapshot {
    items: Arc<[SnapItem]>,
}

impl Snapshot {
    /// Build a snapshot from items already sorted by id with no duplicates.
    pub(crate) fn from_sorted(items: Vec<SnapItem>) -> Self {
        debug_assert!(items.windows(2).all(|w| w[0].id < w[1].id));
        Self {
            items: items.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SnapItem> {
        self.items.iter()
    }

    pub fn items(&self) -> &[SnapItem] {
        &self.items
    }

    fn find(&self, id: ObjId) -> Option<usize> {
        self.items.binary_search_by_key(&id, |item| item.id).ok()
    }

    /// The image of object `id`, if the snapshot holds it.
    pub fn get(&self, id: ObjId) -> Option<&Image> {
        self.find(id).map(|i| &self.items[i].image)
    }

    pub fn contains(&self, id: ObjId) -> bool {
        self.find(id).is_some()
    }

    /// Whether both handles refer to the same frozen item array.
    #[inline]
    pub fn ptr_eq(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.items, &other.items)
    }

    /// Address of the shared item array, stable for the snapshot's lifetime.
    #[inline]
    pub fn as_ptr(&self) -> usize {
        self.items.as_ptr() as usize
    }

    /// Total bytes of object content.
    pub fn bytes(&self) -> usize {
        self.items.iter().map(|item| item.image.len()).sum()
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::from_sorted(Vec::new())
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.iter()).finish()
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a SnapItem;
    type IntoIter = std::slice::Iter<'a, SnapItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: u32, bytes: &[u8]) -> SnapItem {
        SnapItem {
            id: ObjId::new(id),
            image: Arc::from(bytes),
        }
    }

    #[test]
    fn test_lookup() {
        let s = Snapshot::from_sorted(vec![item(1, &[1]), item(4, &[4, 4]), item(9, &[])]);
        assert_eq!(s.len(), 3);
        assert_eq!(s.get(ObjId::new(4)).map(|i| &i[..]), Some(&[4u8, 4][..]));
        assert!(s.contains(ObjId::new(9)));
        assert!(!s.contains(ObjId::new(2)));
        assert_eq!(s.bytes(), 3);
    }

    #[test]
    fn test_clone_shares_items() {
        let s = Snapshot::from_sorted(vec![item(1, &[1])]);
        let t = s.clone();
        assert!(s.ptr_eq(&t));
        assert_eq!(s.as_ptr(), t.as_ptr());
        let u = Snapshot::from_sorted(vec![item(1, &[1])]);
        assert!(!s.ptr_eq(&u));
    }
}
