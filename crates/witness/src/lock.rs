use bitflags::bitflags;
use compact_str::CompactString;
use std::fmt;
use std::sync::Arc;
use witness_types::{LockId, LockKind, WitnessId};

use crate::error::LockLabel;

bitflags! {
    /// Properties shared by every lock of one implementation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClassFlags: u8 {
        const SLEEPLOCK = 0x01;
        const SPINLOCK = 0x02;
        /// Holders may sleep while the lock is held.
        const SLEEPABLE = 0x04;
        const RECURSABLE = 0x08;
        const UPGRADABLE = 0x10;
    }
}

/// Descriptor of a lock implementation ("sleep mutex", "rw", ...).
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct LockClass {
    name: &'static str,
    flags: ClassFlags,
}

impl LockClass {
    pub const fn new(name: &'static str, flags: ClassFlags) -> Self {
        Self { name, flags }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn flags(&self) -> ClassFlags {
        self.flags
    }

    pub fn kind(&self) -> LockKind {
        if self.flags.contains(ClassFlags::SPINLOCK) {
            LockKind::Spin
        } else {
            LockKind::Sleep
        }
    }

    /// Look up one of the built-in classes by its name.
    pub fn by_name(name: &str) -> Option<&'static LockClass> {
        [&SLEEP_MUTEX, &SPIN_MUTEX, &RW_LOCK, &SX_LOCK]
            .into_iter()
            .find(|class| class.name == name)
    }
}

pub static SLEEP_MUTEX: LockClass =
    LockClass::new("sleep mutex", ClassFlags::SLEEPLOCK.union(ClassFlags::RECURSABLE));

pub static SPIN_MUTEX: LockClass =
    LockClass::new("spin mutex", ClassFlags::SPINLOCK.union(ClassFlags::RECURSABLE));

pub static RW_LOCK: LockClass = LockClass::new(
    "rw",
    ClassFlags::SLEEPLOCK
        .union(ClassFlags::RECURSABLE)
        .union(ClassFlags::UPGRADABLE),
);

pub static SX_LOCK: LockClass = LockClass::new(
    "sx",
    ClassFlags::SLEEPLOCK
        .union(ClassFlags::SLEEPABLE)
        .union(ClassFlags::RECURSABLE)
        .union(ClassFlags::UPGRADABLE),
);

bitflags! {
    /// Per-object options chosen when the lock is initialised.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LockFlags: u8 {
        /// Holding two locks of this type at once is expected.
        const DUPOK = 0x01;
        /// Never track this lock.
        const NOWITNESS = 0x02;
        const SLEEPABLE = 0x04;
        const UPGRADABLE = 0x08;
        /// Recursive acquisition is allowed. Ignored for classes that cannot
        /// recurse.
        const RECURSABLE = 0x10;
        const QUIET = 0x20;
    }
}

bitflags! {
    /// Options of one acquire or release.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AcquireFlags: u8 {
        const EXCLUSIVE = 0x01;
        /// The acquisition cannot block, so it is recorded without an
        /// order check.
        const TRYLOCK = 0x02;
        /// Learn the order against the previously held lock if it is new.
        const NEWORDER = 0x04;
        const DUPOK = 0x08;
        /// The caller will not sleep while holding this lock.
        const NOSLEEP = 0x10;
    }
}

struct LockMeta {
    id: LockId,
    name: CompactString,
    type_name: CompactString,
    class: &'static LockClass,
    flags: LockFlags,
    witness: Option<WitnessId>,
}

/// Handle to one lock object as the checker sees it.
///
/// Clones share identity; two handles refer to the same lock when
/// [`LockObject::same`] says so.
#[derive(Clone)]
pub struct LockObject {
    meta: Arc<LockMeta>,
}

impl LockObject {
    pub(crate) fn new(
        name: &str,
        type_name: &str,
        class: &'static LockClass,
        flags: LockFlags,
        witness: Option<WitnessId>,
    ) -> Self {
        Self {
            meta: Arc::new(LockMeta {
                id: LockId::next(),
                name: CompactString::from(name),
                type_name: CompactString::from(type_name),
                class,
                flags,
                witness,
            }),
        }
    }

    pub fn id(&self) -> LockId {
        self.meta.id
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// The witness name this lock is ordered by.
    pub fn type_name(&self) -> &str {
        &self.meta.type_name
    }

    pub fn class(&self) -> &'static LockClass {
        self.meta.class
    }

    pub fn flags(&self) -> LockFlags {
        self.meta.flags
    }

    pub fn kind(&self) -> LockKind {
        self.meta.class.kind()
    }

    /// `None` when the lock is not tracked.
    pub fn witness(&self) -> Option<WitnessId> {
        self.meta.witness
    }

    pub fn same(&self, other: &LockObject) -> bool {
        self.meta.id == other.meta.id
    }

    pub fn is_sleepable(&self) -> bool {
        self.meta.flags.contains(LockFlags::SLEEPABLE)
    }

    pub fn is_upgradable(&self) -> bool {
        self.meta.flags.contains(LockFlags::UPGRADABLE)
    }

    pub fn is_recursable(&self) -> bool {
        self.meta.flags.contains(LockFlags::RECURSABLE)
    }

    pub fn label(&self) -> LockLabel {
        LockLabel {
            name: self.meta.name.clone(),
            type_name: self.meta.type_name.clone(),
            class: self.meta.class.name,
        }
    }
}

impl fmt::Debug for LockObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockObject")
            .field("id", &self.meta.id)
            .field("name", &self.meta.name)
            .field("type_name", &self.meta.type_name)
            .field("class", &self.meta.class.name)
            .field("witness", &self.meta.witness)
            .finish()
    }
}

/// Object flags a class implies, plus the caller's own, minus those the class
/// cannot honour.
pub(crate) fn effective_flags(class: &LockClass, mut flags: LockFlags) -> LockFlags {
    if class.flags.contains(ClassFlags::SLEEPABLE) {
        flags |= LockFlags::SLEEPABLE;
    }
    if class.flags.contains(ClassFlags::UPGRADABLE) {
        flags |= LockFlags::UPGRADABLE;
    }
    if !class.flags.contains(ClassFlags::RECURSABLE) {
        flags.remove(LockFlags::RECURSABLE);
    }
    flags
}
