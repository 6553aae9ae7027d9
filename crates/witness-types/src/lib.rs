//! Data types shared by the witness crates.
//!
//! Everything here is plain data: index newtypes for witnesses and lock
//! objects, acquisition sites, captured call stacks, and the serialisable
//! snapshot records used for dumps.

use facet::Facet;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    IndexOutOfRange {
        field: &'static str,
        max: u64,
        got: u64,
    },
    EmptyField(&'static str),
    EmptyStack,
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndexOutOfRange { field, max, got } => {
                write!(f, "{field} must be < {max}, got {got}")
            }
            Self::EmptyField(field) => write!(f, "{field} must be non-empty"),
            Self::EmptyStack => write!(f, "stack frames must be non-empty"),
        }
    }
}

impl Error for InvariantError {}

// ── Identifiers ─────────────────────────────────────────────

/// Stable index of a witness (a lock *type*) in the registry arena.
///
/// Indices are handed out from a bounded free list and never reclaimed, so a
/// `WitnessId` stays valid for the life of the checker that issued it.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[facet(transparent)]
pub struct WitnessId(u32);

impl WitnessId {
    pub fn new(index: usize, capacity: usize) -> Result<Self, InvariantError> {
        if index >= capacity {
            return Err(InvariantError::IndexOutOfRange {
                field: "witness_id",
                max: capacity as u64,
                got: index as u64,
            });
        }
        let raw = u32::try_from(index).map_err(|_| InvariantError::IndexOutOfRange {
            field: "witness_id",
            max: u64::from(u32::MAX),
            got: index as u64,
        })?;
        Ok(Self(raw))
    }

    /// Unchecked conversion for indices already known to be in range.
    pub fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for WitnessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Identity of one lock object. Unique for the life of the process.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[facet(transparent)]
pub struct LockId(u64);

impl LockId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Whether a lock is tracked on the sleep-lock list of its thread or on the
/// spin-lock list of its CPU.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum LockKind {
    Sleep,
    Spin,
}

impl LockKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sleep => "sleep",
            Self::Spin => "spin",
        }
    }
}

// ── Acquisition sites ───────────────────────────────────────

/// A file/line pair naming where a lock operation happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Source {
    file: &'static str,
    line: u32,
}

impl Source {
    pub const UNKNOWN: Source = Source::new("<unknown>", 0);

    pub const fn new(file: &'static str, line: u32) -> Self {
        Self { file, line }
    }

    #[track_caller]
    pub fn caller() -> Self {
        let location = std::panic::Location::caller();
        Self {
            file: location.file(),
            line: location.line(),
        }
    }

    pub fn file(self) -> &'static str {
        self.file
    }

    pub fn line(self) -> u32 {
        self.line
    }

    /// The file name with leading `./` and `../` components stripped.
    pub fn short_file(self) -> &'static str {
        let mut file = self.file;
        loop {
            if let Some(rest) = file.strip_prefix("../") {
                file = rest;
            } else if let Some(rest) = file.strip_prefix("./") {
                file = rest;
            } else {
                return file;
            }
        }
    }

    pub fn to_snapshot(self) -> SourceSnapshot {
        SourceSnapshot {
            file: self.short_file().to_owned(),
            line: self.line,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.short_file(), self.line)
    }
}

// ── Call stacks ─────────────────────────────────────────────

/// Opaque handle to a captured call stack: the raw instruction pointers,
/// innermost first.
#[derive(Facet, Debug, Clone, PartialEq, Eq, Hash)]
pub struct StackHandle {
    frames: Vec<u64>,
}

impl StackHandle {
    pub fn new(frames: Vec<u64>) -> Result<Self, InvariantError> {
        if frames.is_empty() {
            return Err(InvariantError::EmptyStack);
        }
        Ok(Self { frames })
    }

    pub fn frames(&self) -> &[u64] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Capability used to decorate first-seen lock order edges with the call
/// stack that established them.
pub trait StackCapture: Send + Sync {
    /// Capture the current call stack, or `None` when capture is unavailable.
    fn capture(&self) -> Option<StackHandle>;

    /// Render a previously captured stack, one frame per line.
    fn render(&self, stack: &StackHandle) -> String;
}

/// Stack capture that never captures anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStacks;

impl StackCapture for NoStacks {
    fn capture(&self) -> Option<StackHandle> {
        None
    }

    fn render(&self, stack: &StackHandle) -> String {
        stack
            .frames()
            .iter()
            .enumerate()
            .map(|(depth, ip)| format!("#{depth} 0x{ip:x}\n"))
            .collect()
    }
}

// ── Snapshots ───────────────────────────────────────────────

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct SourceSnapshot {
    pub file: String,
    pub line: u32,
}

/// Point-in-time view of one witness.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct WitnessSnapshot {
    pub index: WitnessId,
    pub name: String,
    /// Name of the lock class the witness was enrolled under.
    pub class: String,
    pub kind: LockKind,
    pub ancestors: u32,
    pub descendants: u32,
    pub reversed: bool,
    /// Number of live lock objects of this type.
    pub refcount: u32,
    /// Where a lock of this type was last acquired; `None` once dormant.
    pub last_acquired: Option<SourceSnapshot>,
}

/// A direct "parent is acquired before child" edge.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct EdgeSnapshot {
    pub parent: String,
    pub child: String,
}

/// A pair of witnesses observed in both orders.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct ReversalSnapshot {
    pub first: String,
    pub second: String,
}

/// One lock held by an owner.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct HeldLockSnapshot {
    pub lock: String,
    pub type_name: String,
    pub class: String,
    pub exclusive: bool,
    pub recursion: u32,
    pub site: SourceSnapshot,
}

/// Everything the order graph knows at one instant.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct GraphSnapshot {
    pub state: String,
    pub generation: u64,
    pub witnesses: Vec<WitnessSnapshot>,
    pub edges: Vec<EdgeSnapshot>,
    pub reversals: Vec<ReversalSnapshot>,
}
