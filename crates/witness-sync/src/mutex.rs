use std::fmt;
use std::ops::{Deref, DerefMut};
use witness::{AcquireFlags, LockAssertion, LockFlags, SLEEP_MUTEX};
use witness_types::Source;

use crate::tracked::{not_recursable, Tracked, EXCLUSIVE};

/// `parking_lot::Mutex` checked as a sleep mutex.
pub struct Mutex<T> {
    tracked: Tracked,
    inner: parking_lot::Mutex<T>,
}

impl<T> Mutex<T> {
    /// `name` is also the lock type: every mutex created with the same name
    /// is ordered as one.
    pub fn new(name: &str, value: T) -> Self {
        Self::typed(name, name, LockFlags::empty(), value)
    }

    /// Panics on [`LockFlags::RECURSABLE`]; use [`crate::RecursiveMutex`].
    pub fn with_flags(name: &str, flags: LockFlags, value: T) -> Self {
        Self::typed(name, name, flags, value)
    }

    /// A mutex named `name` ordered under `type_name`.
    pub fn typed(name: &str, type_name: &str, flags: LockFlags, value: T) -> Self {
        Self {
            tracked: Tracked::new(name, type_name, &SLEEP_MUTEX, not_recursable(name, flags)),
            inner: parking_lot::Mutex::new(value),
        }
    }

    #[track_caller]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let site = Source::caller();
        self.tracked.check(EXCLUSIVE, site, None);
        let guard = self.inner.lock();
        self.tracked.acquired(EXCLUSIVE, site);
        MutexGuard {
            mutex: self,
            site,
            guard,
        }
    }

    /// Never blocks, so the order is not checked.
    #[track_caller]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let site = Source::caller();
        let guard = self.inner.try_lock()?;
        self.tracked.acquired(EXCLUSIVE | AcquireFlags::TRYLOCK, site);
        Some(MutexGuard {
            mutex: self,
            site,
            guard,
        })
    }

    /// Take this mutex while holding `interlock`, then release the
    /// interlock. The interlock is not ordered against this mutex.
    #[track_caller]
    pub fn lock_handoff<U>(&self, interlock: MutexGuard<'_, U>) -> MutexGuard<'_, T> {
        let site = Source::caller();
        self.tracked.check(EXCLUSIVE, site, Some(&interlock.mutex.tracked));
        let guard = self.inner.lock();
        self.tracked.acquired(EXCLUSIVE, site);
        drop(interlock);
        MutexGuard {
            mutex: self,
            site,
            guard,
        }
    }

    /// Panics unless this thread holds the mutex.
    #[track_caller]
    pub fn assert_held(&self) {
        self.tracked.assert(LockAssertion::XLOCKED, Source::caller());
    }

    #[track_caller]
    pub fn assert_not_held(&self) {
        self.tracked.assert(LockAssertion::UNLOCKED, Source::caller());
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("lock", &self.tracked.object)
            .field("inner", &self.inner)
            .finish()
    }
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    site: Source,
    guard: parking_lot::MutexGuard<'a, T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        // The real unlock happens right after, when `guard` is dropped.
        self.mutex.tracked.released(AcquireFlags::EXCLUSIVE, self.site);
    }
}
