use std::fmt;
use std::ops::Deref;
use witness::{AcquireFlags, LockAssertion, LockFlags, SLEEP_MUTEX};
use witness_types::Source;

use crate::tracked::{Release, Tracked, EXCLUSIVE};

/// `parking_lot::ReentrantMutex` checked as a recursable sleep mutex.
///
/// The holding thread may lock it again; each guard only gives shared
/// access to the value.
pub struct RecursiveMutex<T> {
    tracked: Tracked,
    inner: parking_lot::ReentrantMutex<T>,
}

impl<T> RecursiveMutex<T> {
    pub fn new(name: &str, value: T) -> Self {
        Self::with_flags(name, LockFlags::empty(), value)
    }

    pub fn with_flags(name: &str, flags: LockFlags, value: T) -> Self {
        Self {
            tracked: Tracked::new(name, name, &SLEEP_MUTEX, flags | LockFlags::RECURSABLE),
            inner: parking_lot::ReentrantMutex::new(value),
        }
    }

    #[track_caller]
    pub fn lock(&self) -> RecursiveMutexGuard<'_, T> {
        let site = Source::caller();
        self.tracked.check(EXCLUSIVE, site, None);
        let guard = self.inner.lock();
        self.tracked.acquired(EXCLUSIVE, site);
        RecursiveMutexGuard {
            release: Release::new(&self.tracked, AcquireFlags::EXCLUSIVE, site),
            guard,
        }
    }

    #[track_caller]
    pub fn try_lock(&self) -> Option<RecursiveMutexGuard<'_, T>> {
        let site = Source::caller();
        let guard = self.inner.try_lock()?;
        self.tracked.acquired(EXCLUSIVE | AcquireFlags::TRYLOCK, site);
        Some(RecursiveMutexGuard {
            release: Release::new(&self.tracked, AcquireFlags::EXCLUSIVE, site),
            guard,
        })
    }

    #[track_caller]
    pub fn assert_recursed(&self) {
        self.tracked
            .assert(LockAssertion::XLOCKED | LockAssertion::RECURSED, Source::caller());
    }

    #[track_caller]
    pub fn assert_not_held(&self) {
        self.tracked.assert(LockAssertion::UNLOCKED, Source::caller());
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: fmt::Debug> fmt::Debug for RecursiveMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecursiveMutex")
            .field("lock", &self.tracked.object)
            .field("inner", &self.inner)
            .finish()
    }
}

pub struct RecursiveMutexGuard<'a, T> {
    release: Release<'a>,
    guard: parking_lot::ReentrantMutexGuard<'a, T>,
}

impl<T> Deref for RecursiveMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}
