//! `parking_lot` locks that report to a lock-order checker.
//!
//! Every wrapper registers with the process-wide [`OrderChecker`] (see
//! [`install`] and [`checker`]) and each thread gets its own lock owner on
//! first use. Acquisitions are checked against every order seen so far
//! before blocking on the real lock.
//!
//! Order reversals are reported through the checker's sink and do not stop
//! the program unless the checker is set to panic on violations. Misuse
//! (unlocking in the wrong mode, recursing on a non-recursive lock, taking a
//! sleep lock under a spin lock) panics. Only [`RecursiveMutex`] may be
//! taken again by the thread already holding it.

mod global;
mod mutex;
mod recursive;
mod rwlock;
mod spin;
mod tracked;


pub use global::{checker, held_locks, install, warn_held};
pub use mutex::{Mutex, MutexGuard};
pub use recursive::{RecursiveMutex, RecursiveMutexGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard};
pub use spin::{SpinMutex, SpinMutexGuard};
pub use witness::{LockFlags, OrderChecker, WarnFlags};
