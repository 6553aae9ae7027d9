use witness::{AcquireFlags, LockAssertion, LockClass, LockFlags, LockObject};
use witness_types::Source;

use crate::global::{checker, fatal, with_owner};

pub(crate) const EXCLUSIVE: AcquireFlags = AcquireFlags::EXCLUSIVE.union(AcquireFlags::NEWORDER);
pub(crate) const SHARED: AcquireFlags = AcquireFlags::NEWORDER;

/// The checker's view of one wrapped lock. Destroyed with the lock.
pub(crate) struct Tracked {
    pub(crate) object: LockObject,
}

impl Tracked {
    pub(crate) fn new(name: &str, type_name: &str, class: &'static LockClass, flags: LockFlags) -> Self {
        match checker().init_typed(name, type_name, class, flags) {
            Ok(object) => Self { object },
            Err(err) => panic!("witness: {err}"),
        }
    }

    /// Before blocking on the real lock.
    pub(crate) fn check(&self, flags: AcquireFlags, site: Source, interlock: Option<&Tracked>) {
        let interlock = interlock.map(|tracked| &tracked.object);
        fatal(with_owner(|checker, owner| {
            checker.check_order(owner, &self.object, flags, site, interlock)
        }));
    }

    /// After the real lock was taken.
    pub(crate) fn acquired(&self, flags: AcquireFlags, site: Source) {
        fatal(with_owner(|checker, owner| {
            checker.record_acquire(owner, &self.object, flags, site)
        }));
    }

    /// Called from guard destructors, so errors are dropped while unwinding.
    pub(crate) fn released(&self, flags: AcquireFlags, site: Source) {
        let result = with_owner(|checker, owner| checker.release(owner, &self.object, flags, site));
        if !std::thread::panicking() {
            fatal(result);
        }
    }

    pub(crate) fn upgraded(&self, site: Source) {
        fatal(with_owner(|checker, owner| checker.upgrade(owner, &self.object, site)));
    }

    pub(crate) fn downgraded(&self, site: Source) {
        fatal(with_owner(|checker, owner| checker.downgrade(owner, &self.object, site)));
    }

    pub(crate) fn assert(&self, assertion: LockAssertion, site: Source) {
        fatal(with_owner(|checker, owner| {
            checker.assert_lock(owner, &self.object, assertion, site)
        }));
    }
}

/// parking_lot's mutexes and write locks deadlock when their holder takes
/// them again, so only [`crate::RecursiveMutex`] may be recursable.
pub(crate) fn not_recursable(name: &str, flags: LockFlags) -> LockFlags {
    if flags.contains(LockFlags::RECURSABLE) {
        panic!("witness: {name}: only RecursiveMutex can be recursable");
    }
    flags
}

/// Reports the release when dropped. Guards keep it ahead of the real
/// guard so the checker hears about the unlock first.
pub(crate) struct Release<'a> {
    pub(crate) lock: &'a Tracked,
    pub(crate) flags: AcquireFlags,
    site: Source,
}

impl<'a> Release<'a> {
    pub(crate) fn new(lock: &'a Tracked, flags: AcquireFlags, site: Source) -> Self {
        Self { lock, flags, site }
    }
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.lock.released(self.flags, self.site);
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        checker().destroy(&self.object);
    }
}
