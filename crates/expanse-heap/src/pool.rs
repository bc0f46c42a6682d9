//! Shared object pool.
//!
//! Frozen object images are interned here: freezing an object whose bytes
//! are already present in the pool returns the existing image, so equal
//! objects in different snapshots share storage. Images are reference
//! counted; [`Pool::collect`] drops those no snapshot refers to any more.
//! Collection also runs on its own whenever the pool has doubled since the
//! last one, and before an intern would exceed the byte limit.

use crate::error::{HeapError, HeapResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// An immutable object image.
pub type Image = Arc<[u8]>;

/// Pool size below which no automatic collection runs.
const COLLECT_FLOOR: usize = 1 << 20;

/// Concurrent intern table for object images, shared by every workspace of
/// a search.
pub struct Pool {
    images: DashMap<Image, (), ahash::RandomState>,
    bytes: AtomicUsize,
    limit: Option<usize>,
    /// Byte count that triggers the next automatic collection. `usize::MAX`
    /// while one is running.
    next_collect: AtomicUsize,
}

impl Pool {
    pub fn new() -> Self {
        Self {
            images: DashMap::with_hasher(ahash::RandomState::new()),
            bytes: AtomicUsize::new(0),
            limit: None,
            next_collect: AtomicUsize::new(COLLECT_FLOOR),
        }
    }

    /// A pool that refuses to hold more than `limit` bytes of images.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new()
        }
    }

    /// Return the shared image equal to `bytes`, adding it if needed.
    pub fn intern(&self, bytes: &[u8]) -> HeapResult<Image> {
        if let Some(found) = self.images.get(bytes) {
            return Ok(found.key().clone());
        }

        self.reserve(bytes.len())?;
        let (image, added) = match self.images.entry(Arc::from(bytes)) {
            Entry::Occupied(occupied) => (occupied.key().clone(), false),
            Entry::Vacant(vacant) => {
                let image = vacant.key().clone();
                vacant.insert(());
                (image, true)
            }
        };
        if added {
            self.collect_if_due();
        } else {
            self.bytes.fetch_sub(bytes.len(), Ordering::Relaxed);
        }
        Ok(image)
    }

    /// Account for `len` more bytes, collecting once if they do not fit
    /// under the limit.
    fn reserve(&self, len: usize) -> HeapResult<()> {
        let Some(limit) = self.limit else {
            self.bytes.fetch_add(len, Ordering::Relaxed);
            return Ok(());
        };
        let fits = |held: usize| held.checked_add(len).filter(|&total| total <= limit);
        if self.bytes.fetch_update(Ordering::Relaxed, Ordering::Relaxed, fits).is_ok() {
            return Ok(());
        }
        self.collect();
        self.bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, fits)
            .map(|_| ())
            .map_err(|_| HeapError::Exhausted { limit })
    }

    fn collect_if_due(&self) {
        let due = self.next_collect.load(Ordering::Relaxed);
        if self.bytes() < due {
            return;
        }
        if self
            .next_collect
            .compare_exchange(due, usize::MAX, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        self.collect();
        let next = self.bytes().saturating_mul(2).max(COLLECT_FLOOR);
        self.next_collect.store(next, Ordering::Relaxed);
    }

    /// Number of distinct images held.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Total bytes of image content held.
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Release every image that is referenced only by the pool itself.
    /// Returns the number of images released.
    pub fn collect(&self) -> usize {
        let mut released = 0usize;
        let mut freed = 0usize;
        self.images.retain(|image, _| {
            if Arc::strong_count(image) > 1 {
                true
            } else {
                released += 1;
                freed += image.len();
                false
            }
        });
        self.bytes.fetch_sub(freed, Ordering::Relaxed);
        debug!(released, freed, remaining = self.images.len(), "collected object pool");
        released
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("images", &self.len())
            .field("bytes", &self.bytes())
            .field("limit", &self.limit)
            .finish()
    }
}
