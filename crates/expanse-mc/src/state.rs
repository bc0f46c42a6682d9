//! States, fingerprints and edge labels.

use crate::trace::TraceStep;
use expanse_heap::Snapshot;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// A fingerprint is a 64-bit hash of a state's canonical image.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u64);

impl Fingerprint {
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_u64(v: u64) -> Self {
        Fingerprint(v)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({:016x})", self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Conditions observed while a builder produced a state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StateFlags {
    pub error: bool,
    pub accepting: bool,
    pub deadlock: bool,
}

/// A vertex of the explored graph: a frozen heap plus flags.
///
/// Flags are not part of state identity. Two states with equal snapshots
/// are the same state; the store keeps the flags of whichever copy it saw
/// first, which for a deterministic builder are the same anyway.
#[derive(Clone)]
pub struct State {
    pub snap: Snapshot,
    pub flags: StateFlags,
}

/// Identity of a canonical state, valid while the store holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey(usize);

impl State {
    pub fn new(snap: Snapshot) -> Self {
        Self {
            snap,
            flags: StateFlags::default(),
        }
    }

    pub fn with_flags(snap: Snapshot, flags: StateFlags) -> Self {
        Self { snap, flags }
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.flags.error
    }

    /// Whether both handles share the same frozen heap. After deduplication
    /// this is the equality test for states.
    #[inline]
    pub fn same(&self, other: &State) -> bool {
        self.snap.ptr_eq(&other.snap)
    }

    #[inline]
    pub fn key(&self) -> StateKey {
        StateKey(self.snap.as_ptr())
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("objects", &self.snap.len())
            .field("flags", &self.flags)
            .finish()
    }
}

/// Interrupt points recorded with a transition.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterruptFlags(u8);

impl InterruptFlags {
    pub const NONE: InterruptFlags = InterruptFlags(0);
    /// Interrupted before a visible memory access.
    pub const MEMORY: InterruptFlags = InterruptFlags(1);
    /// Interrupted at a control-flow loop.
    pub const CONTROL: InterruptFlags = InterruptFlags(2);

    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn from_bits(bits: u8) -> Self {
        InterruptFlags(bits & 0b11)
    }

    #[inline]
    pub fn contains(self, other: InterruptFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for InterruptFlags {
    type Output = InterruptFlags;

    fn bitor(self, rhs: InterruptFlags) -> InterruptFlags {
        InterruptFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for InterruptFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(InterruptFlags::MEMORY) {
            parts.push("mem");
        }
        if self.contains(InterruptFlags::CONTROL) {
            parts.push("cfl");
        }
        if parts.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}", parts.join("|"))
        }
    }
}

/// Edge metadata.
///
/// `choices` and `interrupts` are enough to replay the transition; the
/// annotation and the property bits are for listeners.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Label {
    pub choices: SmallVec<[u32; 4]>,
    pub interrupts: InterruptFlags,
    pub annotation: Option<Arc<str>>,
    pub accepting: bool,
    pub error: bool,
}

impl Label {
    pub fn choice(index: u32) -> Self {
        Self {
            choices: smallvec::smallvec![index],
            ..Self::default()
        }
    }

    pub fn with_annotation(mut self, text: impl Into<Arc<str>>) -> Self {
        self.annotation = Some(text.into());
        self
    }

    /// The replayable part of the label.
    pub fn step(&self) -> TraceStep {
        TraceStep {
            choices: self.choices.to_vec(),
            interrupts: self.interrupts,
        }
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", &self.choices[..], self.interrupts)?;
        if let Some(note) = &self.annotation {
            write!(f, " {note}")?;
        }
        Ok(())
    }
}
