//! Runtime lock-order verifier.
//!
//! Every lock object belongs to a *witness*, one per lock type name. As locks
//! are acquired, the checker learns a partial order over witnesses ("A is
//! always taken before B") and reports any acquisition that contradicts an
//! order it has already seen. It never blocks, retries or reorders the real
//! lock operations: on internal trouble it disables itself and gets out of
//! the way.
//!
//! All state hangs off an explicitly constructed [`OrderChecker`]; each
//! thread of execution carries its own [`LockOwner`] with the locks it holds.

mod checker;
mod config;
mod dump;
mod error;
mod lock;
mod lock_list;
mod matrix;
mod order_log;
mod owner;
mod registry;
mod report;
mod sink;

pub use checker::{CheckerState, LockAssertion, OrderChecker, Verdict, WarnFlags, MAX_NAME_LEN};
pub use config::{BlessedPair, CheckMode, OrderHint, WitnessConfig, MAX_LOCK_BLOCKS, MAX_WITNESS_CAPACITY};
pub use error::{DisableReason, LockLabel, TransitionProblem, UsageError};
pub use lock::{AcquireFlags, ClassFlags, LockClass, LockFlags, LockObject, RW_LOCK, SLEEP_MUTEX, SPIN_MUTEX, SX_LOCK};
pub use lock_list::BLOCK_SLOTS;
pub use matrix::{Contradiction, RelationFlags, RelationshipMatrix};
pub use owner::LockOwner;
pub use report::{DuplicateReport, HeldSite, ReversalKind, ReversalReport, Violation};
pub use sink::{DiagnosticSink, MemorySink, TracingSink};

pub use witness_types::{
    GraphSnapshot, HeldLockSnapshot, LockId, LockKind, NoStacks, Source, StackCapture, StackHandle, WitnessId,
    WitnessSnapshot,
};

#[cfg(test)]
mod tests;
