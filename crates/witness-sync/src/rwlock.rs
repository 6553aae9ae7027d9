use std::fmt;
use std::ops::{Deref, DerefMut};
use witness::{AcquireFlags, LockAssertion, LockFlags, RW_LOCK};
use witness_types::Source;

use crate::tracked::{not_recursable, Release, Tracked, EXCLUSIVE, SHARED};

/// `parking_lot::RwLock` checked as an upgradable reader/writer lock.
///
/// Read guards may recurse. Write guards may not, so
/// [`LockFlags::RECURSABLE`] is refused.
pub struct RwLock<T> {
    tracked: Tracked,
    inner: parking_lot::RwLock<T>,
}

impl<T> RwLock<T> {
    pub fn new(name: &str, value: T) -> Self {
        Self::with_flags(name, LockFlags::empty(), value)
    }

    pub fn with_flags(name: &str, flags: LockFlags, value: T) -> Self {
        Self {
            tracked: Tracked::new(name, name, &RW_LOCK, not_recursable(name, flags)),
            inner: parking_lot::RwLock::new(value),
        }
    }

    #[track_caller]
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let site = Source::caller();
        self.tracked.check(SHARED, site, None);
        // A queued writer must not block a reader that already holds the lock.
        let guard = self.inner.read_recursive();
        self.tracked.acquired(SHARED, site);
        RwLockReadGuard {
            release: Release::new(&self.tracked, AcquireFlags::empty(), site),
            guard,
        }
    }

    #[track_caller]
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        let site = Source::caller();
        let guard = self.inner.try_read_recursive()?;
        self.tracked.acquired(SHARED | AcquireFlags::TRYLOCK, site);
        Some(RwLockReadGuard {
            release: Release::new(&self.tracked, AcquireFlags::empty(), site),
            guard,
        })
    }

    #[track_caller]
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let site = Source::caller();
        self.tracked.check(EXCLUSIVE, site, None);
        let guard = self.inner.write();
        self.tracked.acquired(EXCLUSIVE, site);
        RwLockWriteGuard {
            release: Release::new(&self.tracked, AcquireFlags::EXCLUSIVE, site),
            guard,
        }
    }

    #[track_caller]
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        let site = Source::caller();
        let guard = self.inner.try_write()?;
        self.tracked.acquired(EXCLUSIVE | AcquireFlags::TRYLOCK, site);
        Some(RwLockWriteGuard {
            release: Release::new(&self.tracked, AcquireFlags::EXCLUSIVE, site),
            guard,
        })
    }

    /// A shared hold that can later become exclusive without releasing.
    #[track_caller]
    pub fn upgradable_read(&self) -> RwLockUpgradableReadGuard<'_, T> {
        let site = Source::caller();
        self.tracked.check(SHARED, site, None);
        let guard = self.inner.upgradable_read();
        self.tracked.acquired(SHARED, site);
        RwLockUpgradableReadGuard {
            release: Release::new(&self.tracked, AcquireFlags::empty(), site),
            guard,
        }
    }

    #[track_caller]
    pub fn assert_read_held(&self) {
        self.tracked.assert(LockAssertion::SLOCKED, Source::caller());
    }

    #[track_caller]
    pub fn assert_write_held(&self) {
        self.tracked.assert(LockAssertion::XLOCKED, Source::caller());
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: fmt::Debug> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock")
            .field("lock", &self.tracked.object)
            .field("inner", &self.inner)
            .finish()
    }
}

pub struct RwLockReadGuard<'a, T> {
    release: Release<'a>,
    guard: parking_lot::RwLockReadGuard<'a, T>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

pub struct RwLockWriteGuard<'a, T> {
    release: Release<'a>,
    guard: parking_lot::RwLockWriteGuard<'a, T>,
}

impl<'a, T> RwLockWriteGuard<'a, T> {
    /// Turn the write hold into a read hold without letting a writer in.
    #[track_caller]
    pub fn downgrade(this: Self) -> RwLockReadGuard<'a, T> {
        let site = Source::caller();
        let Self { mut release, guard } = this;
        let guard = parking_lot::RwLockWriteGuard::downgrade(guard);
        release.lock.downgraded(site);
        release.flags = AcquireFlags::empty();
        RwLockReadGuard { release, guard }
    }
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

pub struct RwLockUpgradableReadGuard<'a, T> {
    release: Release<'a>,
    guard: parking_lot::RwLockUpgradableReadGuard<'a, T>,
}

impl<'a, T> RwLockUpgradableReadGuard<'a, T> {
    /// Wait for other readers to leave, then hold the lock exclusively.
    #[track_caller]
    pub fn upgrade(this: Self) -> RwLockWriteGuard<'a, T> {
        let site = Source::caller();
        let Self { mut release, guard } = this;
        let guard = parking_lot::RwLockUpgradableReadGuard::upgrade(guard);
        release.lock.upgraded(site);
        release.flags = AcquireFlags::EXCLUSIVE;
        RwLockWriteGuard { release, guard }
    }
}

impl<T> Deref for RwLockUpgradableReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}
