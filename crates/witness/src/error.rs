use compact_str::CompactString;
use std::error::Error;
use std::fmt;
use witness_types::Source;

use crate::matrix::Contradiction;

/// Name, witness name and class of a lock, as printed in diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLabel {
    pub name: CompactString,
    pub type_name: CompactString,
    pub class: &'static str,
}

impl fmt::Display for LockLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}) {}", self.class, self.name)
    }
}

/// Why an upgrade or downgrade was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionProblem {
    NotUpgradable,
    NotSleepLock,
    NotLocked,
    /// Upgrade of an exclusive hold, or downgrade of a shared one.
    WrongMode,
    Recursed(u32),
}

/// Misuse of a lock detected by the checker. Continuing after one of these
/// risks corrupting the per-owner bookkeeping, so callers treat them as fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    EmptyName,
    NameTooLong {
        name: CompactString,
        max: usize,
    },
    ClassMismatch {
        name: CompactString,
        existing: &'static str,
        requested: &'static str,
    },
    RecursedNonRecursive {
        lock: LockLabel,
        site: Source,
    },
    ExclusiveToShared {
        lock: LockLabel,
        site: Source,
        held: Source,
    },
    SharedToExclusive {
        lock: LockLabel,
        site: Source,
        held: Source,
    },
    SharedUnlockOfExclusive {
        lock: LockLabel,
        site: Source,
        held: Source,
    },
    ExclusiveUnlockOfShared {
        lock: LockLabel,
        site: Source,
        held: Source,
    },
    NotLocked {
        lock: LockLabel,
        site: Source,
    },
    ForbiddenUnlock {
        lock: LockLabel,
        site: Source,
    },
    Upgrade {
        lock: LockLabel,
        site: Source,
        problem: TransitionProblem,
    },
    Downgrade {
        lock: LockLabel,
        site: Source,
        problem: TransitionProblem,
    },
    InterlockNotLocked {
        interlock: LockLabel,
        site: Source,
    },
    InterlockRecursed {
        interlock: LockLabel,
        site: Source,
    },
    SleepUnderSpin {
        lock: LockLabel,
        spin: LockLabel,
        site: Source,
    },
    AssertionFailed {
        lock: LockLabel,
        site: Source,
        detail: &'static str,
    },
    InvalidAssertion {
        site: Source,
    },
    Untracked {
        lock: LockLabel,
    },
    OrderCycle {
        first: CompactString,
        second: CompactString,
    },
}

impl UsageError {
    /// Short tag naming the failed check.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyName | Self::NameTooLong { .. } => "bad name",
            Self::ClassMismatch { .. } => "class mismatch",
            Self::RecursedNonRecursive { .. } => "recursed",
            Self::ExclusiveToShared { .. } => "excl->share",
            Self::SharedToExclusive { .. } => "share->excl",
            Self::SharedUnlockOfExclusive { .. } => "excl->ushare",
            Self::ExclusiveUnlockOfShared { .. } => "share->uexcl",
            Self::NotLocked { .. } => "not locked",
            Self::ForbiddenUnlock { .. } => "lock marked norelease",
            Self::Upgrade { .. } => "upgrade",
            Self::Downgrade { .. } => "downgrade",
            Self::InterlockNotLocked { .. } | Self::InterlockRecursed { .. } => "interlock",
            Self::SleepUnderSpin { .. } => "sleep under spin",
            Self::AssertionFailed { .. } | Self::InvalidAssertion { .. } => "assert",
            Self::Untracked { .. } => "untracked",
            Self::OrderCycle { .. } => "order cycle",
        }
    }
}

fn transition(f: &mut fmt::Formatter<'_>, verb: &str, lock: &LockLabel, site: &Source, problem: TransitionProblem) -> fmt::Result {
    match problem {
        TransitionProblem::NotUpgradable => write!(f, "{verb} of non-upgradable lock {lock} @ {site}"),
        TransitionProblem::NotSleepLock => write!(f, "{verb} of non-sleep lock {lock} @ {site}"),
        TransitionProblem::NotLocked => write!(f, "{verb} of unlocked lock {lock} @ {site}"),
        TransitionProblem::WrongMode if verb == "upgrade" => write!(f, "upgrade of exclusive lock {lock} @ {site}"),
        TransitionProblem::WrongMode => write!(f, "downgrade of shared lock {lock} @ {site}"),
        TransitionProblem::Recursed(depth) => write!(f, "{verb} of recursed lock {lock} r={depth} @ {site}"),
    }
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.code())?;
        match self {
            Self::EmptyName => write!(f, "lock type name must be non-empty"),
            Self::NameTooLong { name, max } => {
                write!(f, "lock type name \"{name}\" is longer than {max} bytes")
            }
            Self::ClassMismatch {
                name,
                existing,
                requested,
            } => write!(f, "lock ({requested}) {name} does not match earlier ({existing}) lock"),
            Self::RecursedNonRecursive { lock, site } => {
                write!(f, "recursed on non-recursive lock {lock} @ {site}")
            }
            Self::ExclusiveToShared { lock, site, held } => {
                write!(f, "shared lock of {lock} @ {site} while exclusively locked from {held}")
            }
            Self::SharedToExclusive { lock, site, held } => {
                write!(f, "exclusive lock of {lock} @ {site} while share locked from {held}")
            }
            Self::SharedUnlockOfExclusive { lock, site, held } => {
                write!(f, "shared unlock of {lock} @ {site} while exclusively locked from {held}")
            }
            Self::ExclusiveUnlockOfShared { lock, site, held } => {
                write!(f, "exclusive unlock of {lock} @ {site} while share locked from {held}")
            }
            Self::NotLocked { lock, site } => write!(f, "lock {lock} not locked @ {site}"),
            Self::ForbiddenUnlock { lock, site } => write!(f, "forbidden unlock of {lock} @ {site}"),
            Self::Upgrade { lock, site, problem } => transition(f, "upgrade", lock, site, *problem),
            Self::Downgrade { lock, site, problem } => transition(f, "downgrade", lock, site, *problem),
            Self::InterlockNotLocked { interlock, site } => {
                write!(f, "interlock {interlock} not locked @ {site}")
            }
            Self::InterlockRecursed { interlock, site } => {
                write!(f, "interlock {interlock} recursed @ {site}")
            }
            Self::SleepUnderSpin { lock, spin, site } => write!(
                f,
                "acquiring blockable sleep lock with spinlock held ({spin} held) {lock} @ {site}"
            ),
            Self::AssertionFailed { lock, site, detail } => {
                write!(f, "Lock {lock} {detail} @ {site}.")
            }
            Self::InvalidAssertion { site } => write!(f, "Invalid lock assertion at {site}."),
            Self::Untracked { lock } => write!(f, "lock {lock} is not tracked"),
            Self::OrderCycle { first, second } => write!(
                f,
                "cannot order \"{first}\" before \"{second}\": the opposite order is already known"
            ),
        }
    }
}

impl Error for UsageError {}

/// Why the checker switched itself off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisableReason {
    WitnessTableFull { capacity: usize },
    BlockPoolExhausted { capacity: usize },
    GraphContradiction(Contradiction),
    Operator,
}

impl fmt::Display for DisableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WitnessTableFull { capacity } => {
                write!(f, "witness table exhausted ({capacity} witnesses)")
            }
            Self::BlockPoolExhausted { capacity } => {
                write!(f, "lock list block pool exhausted ({capacity} blocks)")
            }
            Self::GraphContradiction(contradiction) => write!(f, "graph contradiction: {contradiction}"),
            Self::Operator => write!(f, "turned off by operator"),
        }
    }
}

impl Error for DisableReason {}
