use compact_str::CompactString;
use std::fmt;
use std::sync::Weak;
use witness_types::LockKind;

use crate::checker::Inner;
use crate::lock_list::LockInstanceList;

/// One thread of execution as the checker sees it: the sleep locks it holds
/// and the spin locks held on its behalf.
///
/// An owner must only be used from the thread that created it. Dropping it
/// returns its list blocks to the checker and reports any locks still held.
pub struct LockOwner {
    name: CompactString,
    checker: Weak<Inner>,
    pub(crate) sleep: LockInstanceList,
    pub(crate) spin: LockInstanceList,
}

impl LockOwner {
    pub(crate) fn new(name: &str, checker: Weak<Inner>) -> Self {
        Self {
            name: CompactString::from(name),
            checker,
            sleep: LockInstanceList::new(),
            spin: LockInstanceList::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Distinct locks held, recursion not counted.
    pub fn held_count(&self) -> usize {
        self.sleep.len() + self.spin.len()
    }

    pub fn holds_any(&self) -> bool {
        !self.sleep.is_empty() || !self.spin.is_empty()
    }

    pub(crate) fn list(&self, kind: LockKind) -> &LockInstanceList {
        match kind {
            LockKind::Sleep => &self.sleep,
            LockKind::Spin => &self.spin,
        }
    }

    pub(crate) fn list_mut(&mut self, kind: LockKind) -> &mut LockInstanceList {
        match kind {
            LockKind::Sleep => &mut self.sleep,
            LockKind::Spin => &mut self.spin,
        }
    }
}

impl fmt::Debug for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockOwner")
            .field("name", &self.name)
            .field("sleep", &self.sleep.len())
            .field("spin", &self.spin.len())
            .finish()
    }
}

impl Drop for LockOwner {
    fn drop(&mut self) {
        if let Some(inner) = self.checker.upgrade() {
            inner.retire_owner(self);
        }
    }
}
