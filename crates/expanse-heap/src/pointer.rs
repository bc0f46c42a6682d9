//! Tagged pointers.
//!
//! A pointer is stored in heap objects as one 64-bit word: the object id in
//! the upper 32 bits, a 3-bit type tag, and a 29-bit offset in the low bits.
//! In memory it is always handled as the [`Pointer`] enum so that field
//! access is checked.

use crate::error::{HeapError, HeapResult};
use std::fmt;

pub const OBJ_BITS: u32 = 32;
pub const TYPE_BITS: u32 = 3;
pub const OFFSET_BITS: u32 = 64 - OBJ_BITS - TYPE_BITS;

const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;
const TYPE_MASK: u64 = ((1 << TYPE_BITS) - 1) << OFFSET_BITS;

/// Largest offset (and hence object size) a pointer can address.
pub const MAX_OFFSET: u32 = OFFSET_MASK as u32;

/// Size of a pointer word stored in a heap object.
pub const POINTER_BYTES: usize = 8;

/// Identifier of a heap object. Id 0 is reserved for null.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjId(u32);

impl ObjId {
    pub const NULL: ObjId = ObjId(0);

    #[inline]
    pub const fn new(raw: u32) -> Self {
        ObjId(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A byte position inside a heap object.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeapLoc {
    pub obj: ObjId,
    pub offset: u32,
}

impl HeapLoc {
    #[inline]
    pub const fn new(obj: ObjId, offset: u32) -> Self {
        Self { obj, offset }
    }

    /// Location of the first byte of `obj`.
    #[inline]
    pub const fn base(obj: ObjId) -> Self {
        Self { obj, offset: 0 }
    }

    /// Same object, at `offset`.
    #[inline]
    pub const fn at(self, offset: u32) -> Self {
        Self {
            obj: self.obj,
            offset,
        }
    }

    /// Same object, `delta` bytes further.
    #[inline]
    pub fn add(self, delta: u32) -> Self {
        Self {
            obj: self.obj,
            offset: self.offset.wrapping_add(delta),
        }
    }
}

impl fmt::Debug for HeapLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.obj, self.offset)
    }
}

/// The 3-bit type tag of a pointer word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PointerType {
    Global = 0,
    Heap = 1,
    Code = 2,
    Weak = 3,
    Marked = 4,
}

impl PointerType {
    fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => PointerType::Global,
            1 => PointerType::Heap,
            2 => PointerType::Code,
            3 => PointerType::Weak,
            4 => PointerType::Marked,
            _ => return None,
        })
    }
}

/// A decoded pointer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pointer {
    Null,
    Global { slot: u32, offset: u32 },
    Heap(HeapLoc),
    Code { function: u32, instruction: u32 },
    Weak(HeapLoc),
    Marked(HeapLoc),
}

impl Pointer {
    pub fn kind(&self) -> PointerType {
        match self {
            Pointer::Null | Pointer::Global { .. } => PointerType::Global,
            Pointer::Heap(_) => PointerType::Heap,
            Pointer::Code { .. } => PointerType::Code,
            Pointer::Weak(_) => PointerType::Weak,
            Pointer::Marked(_) => PointerType::Marked,
        }
    }

    /// The heap location this pointer refers to, if it points into the heap.
    pub fn heap_loc(&self) -> Option<HeapLoc> {
        match *self {
            Pointer::Heap(loc) | Pointer::Weak(loc) | Pointer::Marked(loc) => Some(loc),
            _ => None,
        }
    }

    fn fields(&self) -> (u32, u32) {
        match *self {
            Pointer::Null => (0, 0),
            Pointer::Global { slot, offset } => (slot, offset),
            Pointer::Heap(loc) | Pointer::Weak(loc) | Pointer::Marked(loc) => {
                (loc.obj.raw(), loc.offset)
            }
            Pointer::Code {
                function,
                instruction,
            } => (function, instruction),
        }
    }

    /// Encode into a pointer word. Fails if the offset does not fit.
    pub fn to_word(&self) -> HeapResult<u64> {
        let (obj, offset) = self.fields();
        if offset > MAX_OFFSET {
            return Err(HeapError::TooLarge {
                size: offset as usize,
            });
        }
        let tag = self.kind() as u64;
        Ok(((obj as u64) << (TYPE_BITS + OFFSET_BITS)) | (tag << OFFSET_BITS) | offset as u64)
    }

    /// Decode a pointer word.
    pub fn from_word(word: u64) -> HeapResult<Self> {
        let obj = (word >> (TYPE_BITS + OFFSET_BITS)) as u32;
        let tag = ((word & TYPE_MASK) >> OFFSET_BITS) as u8;
        let offset = (word & OFFSET_MASK) as u32;
        let kind = PointerType::from_tag(tag).ok_or(HeapError::BadPointer(word))?;
        let loc = HeapLoc::new(ObjId::new(obj), offset);
        Ok(match kind {
            PointerType::Global if obj == 0 && offset == 0 => Pointer::Null,
            PointerType::Global => Pointer::Global { slot: obj, offset },
            PointerType::Heap => Pointer::Heap(loc),
            PointerType::Code => Pointer::Code {
                function: obj,
                instruction: offset,
            },
            PointerType::Weak => Pointer::Weak(loc),
            PointerType::Marked => Pointer::Marked(loc),
        })
    }
}

impl From<HeapLoc> for Pointer {
    fn from(loc: HeapLoc) -> Self {
        Pointer::Heap(loc)
    }
}
