use std::ops::{Deref, DerefMut};
use witness::{AcquireFlags, LockFlags, SPIN_MUTEX};
use witness_types::Source;

use crate::tracked::{not_recursable, Tracked, EXCLUSIVE};

/// A mutex ordered as a spin lock: no sleep lock may be taken while it is
/// held, and it sits after every sleep lock.
pub struct SpinMutex<T> {
    tracked: Tracked,
    inner: parking_lot::Mutex<T>,
}

impl<T> SpinMutex<T> {
    pub fn new(name: &str, value: T) -> Self {
        Self::with_flags(name, LockFlags::empty(), value)
    }

    pub fn with_flags(name: &str, flags: LockFlags, value: T) -> Self {
        Self {
            tracked: Tracked::new(name, name, &SPIN_MUTEX, not_recursable(name, flags)),
            inner: parking_lot::Mutex::new(value),
        }
    }

    #[track_caller]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        let site = Source::caller();
        self.tracked.check(EXCLUSIVE, site, None);
        let guard = self.inner.lock();
        self.tracked.acquired(EXCLUSIVE, site);
        SpinMutexGuard {
            lock: &self.tracked,
            site,
            guard,
        }
    }

    #[track_caller]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        let site = Source::caller();
        let guard = self.inner.try_lock()?;
        self.tracked.acquired(EXCLUSIVE | AcquireFlags::TRYLOCK, site);
        Some(SpinMutexGuard {
            lock: &self.tracked,
            site,
            guard,
        })
    }
}

pub struct SpinMutexGuard<'a, T> {
    lock: &'a Tracked,
    site: Source,
    guard: parking_lot::MutexGuard<'a, T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.released(AcquireFlags::EXCLUSIVE, self.site);
    }
}
