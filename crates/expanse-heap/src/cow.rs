//! Copy-on-write heap workspace.
//!
//! The workspace is a base [`Snapshot`] plus a private overlay of objects
//! touched since that snapshot was taken or restored. Reads fall through to
//! the base; the first write to a base object copies its image into the
//! overlay. Freezing merges the overlay into a new snapshot and makes that
//! snapshot the new base, so the next generation again starts empty.

use crate::error::{HeapError, HeapResult};
use crate::pointer::{HeapLoc, ObjId, Pointer, MAX_OFFSET, POINTER_BYTES};
use crate::pool::Pool;
use crate::snapshot::{SnapItem, Snapshot};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A private mutable heap over a shared object pool.
///
/// Each search worker owns one. Cloning a workspace is cheap when its
/// overlay is empty, which is the normal case right after `restore`.
#[derive(Clone)]
pub struct CowHeap {
    pool: Arc<Pool>,
    base: Snapshot,
    /// `Some` holds a detached or freshly made object, `None` marks an
    /// object freed in this generation.
    local: BTreeMap<ObjId, Option<Vec<u8>>>,
}

impl CowHeap {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self {
            pool,
            base: Snapshot::default(),
            local: BTreeMap::new(),
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Whether anything changed since the last snapshot or restore.
    pub fn is_dirty(&self) -> bool {
        !self.local.is_empty()
    }

    /// Allocate a zeroed object of `size` bytes with the lowest free id.
    pub fn make(&mut self, size: usize) -> HeapResult<ObjId> {
        self.make_hinted(size, 1)
    }

    /// Allocate a zeroed object, using the first free id at or above `hint`.
    ///
    /// Builders pass a fixed hint for objects whose identity should not
    /// depend on allocation order.
    pub fn make_hinted(&mut self, size: usize, hint: u32) -> HeapResult<ObjId> {
        if size > MAX_OFFSET as usize {
            return Err(HeapError::TooLarge { size });
        }
        let mut raw = hint.max(1);
        while self.valid(ObjId::new(raw)) {
            raw = raw.checked_add(1).ok_or(HeapError::Exhausted {
                limit: u32::MAX as usize,
            })?;
        }
        let id = ObjId::new(raw);
        self.local.insert(id, Some(vec![0; size]));
        Ok(id)
    }

    /// Whether `id` names a live object.
    pub fn valid(&self, id: ObjId) -> bool {
        match self.local.get(&id) {
            Some(entry) => entry.is_some(),
            None => self.base.contains(id),
        }
    }

    fn object(&self, id: ObjId) -> HeapResult<&[u8]> {
        match self.local.get(&id) {
            Some(Some(bytes)) => Ok(bytes),
            Some(None) => Err(HeapError::InvalidObject(id)),
            None => self
                .base
                .get(id)
                .map(|image| &image[..])
                .ok_or(HeapError::InvalidObject(id)),
        }
    }

    /// Copy `id` into the current generation if it is not already there.
    fn detach(&mut self, id: ObjId) -> HeapResult<&mut Vec<u8>> {
        if !self.local.contains_key(&id) {
            let image = self.base.get(id).ok_or(HeapError::InvalidObject(id))?;
            self.local.insert(id, Some(image.to_vec()));
        }
        match self.local.get_mut(&id) {
            Some(Some(bytes)) => Ok(bytes),
            _ => Err(HeapError::InvalidObject(id)),
        }
    }

    fn check_bounds(&self, loc: HeapLoc, len: usize) -> HeapResult<()> {
        let size = self.object(loc.obj)?.len();
        let end = loc.offset as usize + len;
        if end > size {
            return Err(HeapError::OutOfBounds {
                obj: loc.obj,
                offset: loc.offset,
                len,
                size,
            });
        }
        Ok(())
    }

    pub fn size(&self, id: ObjId) -> HeapResult<usize> {
        self.object(id).map(|bytes| bytes.len())
    }

    pub fn read(&self, loc: HeapLoc, len: usize) -> HeapResult<&[u8]> {
        self.check_bounds(loc, len)?;
        let start = loc.offset as usize;
        Ok(&self.object(loc.obj)?[start..start + len])
    }

    /// Write `bytes` at `loc`. A failed bounds check leaves the workspace
    /// untouched.
    pub fn write(&mut self, loc: HeapLoc, bytes: &[u8]) -> HeapResult<()> {
        self.check_bounds(loc, bytes.len())?;
        let start = loc.offset as usize;
        let target = self.detach(loc.obj)?;
        target[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_u32(&self, loc: HeapLoc) -> HeapResult<u32> {
        let mut word = [0u8; 4];
        word.copy_from_slice(self.read(loc, 4)?);
        Ok(u32::from_le_bytes(word))
    }

    pub fn write_u32(&mut self, loc: HeapLoc, value: u32) -> HeapResult<()> {
        self.write(loc, &value.to_le_bytes())
    }

    pub fn read_u64(&self, loc: HeapLoc) -> HeapResult<u64> {
        let mut word = [0u8; 8];
        word.copy_from_slice(self.read(loc, 8)?);
        Ok(u64::from_le_bytes(word))
    }

    pub fn write_u64(&mut self, loc: HeapLoc, value: u64) -> HeapResult<()> {
        self.write(loc, &value.to_le_bytes())
    }

    pub fn read_pointer(&self, loc: HeapLoc) -> HeapResult<Pointer> {
        debug_assert_eq!(POINTER_BYTES, 8);
        Pointer::from_word(self.read_u64(loc)?)
    }

    pub fn write_pointer(&mut self, loc: HeapLoc, ptr: Pointer) -> HeapResult<()> {
        let word = ptr.to_word()?;
        self.write_u64(loc, word)
    }

    pub fn free(&mut self, id: ObjId) -> HeapResult<()> {
        if !self.valid(id) {
            return Err(HeapError::InvalidObject(id));
        }
        if self.base.contains(id) {
            self.local.insert(id, None);
        } else {
            self.local.remove(&id);
        }
        Ok(())
    }

    /// Change the size of `id`, truncating or zero-extending its content.
    pub fn resize(&mut self, id: ObjId, size: usize) -> HeapResult<()> {
        if size > MAX_OFFSET as usize {
            return Err(HeapError::TooLarge { size });
        }
        self.detach(id)?.resize(size, 0);
        Ok(())
    }

    /// Ids of all live objects in ascending order.
    pub fn objects(&self) -> Vec<ObjId> {
        let mut ids: Vec<ObjId> = self
            .base
            .iter()
            .map(|item| item.id)
            .filter(|id| !self.local.contains_key(id))
            .collect();
        ids.extend(
            self.local
                .iter()
                .filter(|(_, entry)| entry.is_some())
                .map(|(id, _)| *id),
        );
        ids.sort_unstable();
        ids
    }

    /// Freeze the workspace.
    ///
    /// Touched objects are interned into the pool and merged with the base
    /// in id order. The result becomes the new base. With nothing touched
    /// the current base is returned as is.
    pub fn snapshot(&mut self) -> HeapResult<Snapshot> {
        if self.local.is_empty() {
            return Ok(self.base.clone());
        }

        let mut items = Vec::with_capacity(self.base.len() + self.local.len());
        let mut base = self.base.iter().peekable();
        for (&id, entry) in &self.local {
            while let Some(item) = base.next_if(|item| item.id < id) {
                items.push(item.clone());
            }
            base.next_if(|item| item.id == id);
            if let Some(bytes) = entry {
                items.push(SnapItem {
                    id,
                    image: self.pool.intern(bytes)?,
                });
            }
        }
        items.extend(base.cloned());

        let snap = Snapshot::from_sorted(items);
        self.base = snap.clone();
        self.local.clear();
        Ok(snap)
    }

    /// Make `snap` the live workspace, discarding any pending changes.
    pub fn restore(&mut self, snap: &Snapshot) {
        self.base = snap.clone();
        self.local.clear();
    }

    /// Discard changes made since the last snapshot or restore.
    pub fn rollback(&mut self) {
        self.local.clear();
    }

    /// The snapshot the current generation started from.
    pub fn base(&self) -> &Snapshot {
        &self.base
    }
}

impl std::fmt::Debug for CowHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CowHeap")
            .field("base", &self.base.len())
            .field("touched", &self.local.len())
            .finish()
    }
}
