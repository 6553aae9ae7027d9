use witness_types::Source;

use crate::lock::LockObject;

/// Instances per block.
pub const BLOCK_SLOTS: usize = 5;

/// One held lock as recorded in an owner's list.
#[derive(Debug, Clone)]
pub(crate) struct LockInstance {
    pub(crate) lock: LockObject,
    pub(crate) site: Source,
    pub(crate) exclusive: bool,
    pub(crate) recursion: u32,
    pub(crate) norelease: bool,
}

impl LockInstance {
    /// `exclusive sleep mutex foo (foo_type) r = 0 (#3) locked @ file:line`
    pub(crate) fn describe(&self) -> String {
        let mut out = format!(
            "{} {} {}",
            if self.exclusive { "exclusive" } else { "shared" },
            self.lock.class().name(),
            self.lock.name()
        );
        if self.lock.type_name() != self.lock.name() {
            out.push_str(&format!(" ({})", self.lock.type_name()));
        }
        out.push_str(&format!(
            " r = {} ({}) locked @ {}",
            self.recursion,
            self.lock.id(),
            self.site
        ));
        out
    }
}

#[derive(Debug, Default)]
pub(crate) struct LockBlock {
    entries: Vec<LockInstance>,
}

impl LockBlock {
    fn is_full(&self) -> bool {
        self.entries.len() >= BLOCK_SLOTS
    }
}

/// Fixed supply of list blocks shared by all owners of one checker.
pub(crate) struct BlockPool {
    capacity: usize,
    free: Vec<Box<LockBlock>>,
}

impl BlockPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: (0..capacity)
                .map(|_| {
                    Box::new(LockBlock {
                        entries: Vec::with_capacity(BLOCK_SLOTS),
                    })
                })
                .collect(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn take(&mut self) -> Option<Box<LockBlock>> {
        self.free.pop()
    }

    pub(crate) fn give(&mut self, mut block: Box<LockBlock>) {
        block.entries.clear();
        self.free.push(block);
    }

    pub(crate) fn available(&self) -> usize {
        self.free.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pushed {
    Inserted,
    Recursed(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushError {
    ModeMismatch { held_exclusive: bool, held_site: Source },
    PoolExhausted,
}

#[derive(Debug, Clone)]
pub(crate) enum Popped {
    Unrecursed(u32),
    Removed(LockInstance),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PopError {
    NotHeld,
    ModeMismatch { held_exclusive: bool, held_site: Source },
    NoRelease,
}

/// Locks held by one context, oldest block first.
#[derive(Debug, Default)]
pub(crate) struct LockInstanceList {
    blocks: Vec<Box<LockBlock>>,
}

impl LockInstanceList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.iter().map(|block| block.entries.len()).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.blocks.iter().all(|block| block.entries.is_empty())
    }

    pub(crate) fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Most recent acquisition first.
    pub(crate) fn iter_recent(&self) -> impl Iterator<Item = &LockInstance> {
        self.blocks.iter().rev().flat_map(|block| block.entries.iter().rev())
    }

    pub(crate) fn most_recent(&self) -> Option<&LockInstance> {
        self.iter_recent().next()
    }

    /// The most recent instance that is not `interlock`.
    pub(crate) fn previous_excluding(&self, interlock: Option<&LockObject>) -> Option<&LockInstance> {
        self.iter_recent()
            .take(2)
            .find(|instance| !interlock.is_some_and(|il| il.same(&instance.lock)))
    }

    pub(crate) fn find(&self, lock: &LockObject) -> Option<&LockInstance> {
        self.iter_recent().find(|instance| instance.lock.same(lock))
    }

    pub(crate) fn find_mut(&mut self, lock: &LockObject) -> Option<&mut LockInstance> {
        self.blocks
            .iter_mut()
            .flat_map(|block| block.entries.iter_mut())
            .find(|instance| instance.lock.same(lock))
    }

    fn position(&self, lock: &LockObject) -> Option<(usize, usize)> {
        self.blocks.iter().enumerate().find_map(|(b, block)| {
            block
                .entries
                .iter()
                .position(|instance| instance.lock.same(lock))
                .map(|slot| (b, slot))
        })
    }

    /// Record an acquisition. A lock already on the list anywhere is a
    /// recursion. With `enforce` unset a mode mismatch is tolerated.
    pub(crate) fn push(
        &mut self,
        lock: &LockObject,
        site: Source,
        exclusive: bool,
        enforce: bool,
        alloc: impl FnOnce() -> Option<Box<LockBlock>>,
    ) -> Result<Pushed, PushError> {
        if let Some(instance) = self.find_mut(lock) {
            if enforce && instance.exclusive != exclusive {
                return Err(PushError::ModeMismatch {
                    held_exclusive: instance.exclusive,
                    held_site: instance.site,
                });
            }
            instance.recursion += 1;
            instance.site = site;
            return Ok(Pushed::Recursed(instance.recursion));
        }

        let needs_block = self.blocks.last().is_none_or(|block| block.is_full());
        if needs_block {
            let block = alloc().ok_or(PushError::PoolExhausted)?;
            self.blocks.push(block);
        }
        let Some(block) = self.blocks.last_mut() else {
            return Err(PushError::PoolExhausted);
        };
        block.entries.push(LockInstance {
            lock: lock.clone(),
            site,
            exclusive,
            recursion: 0,
            norelease: false,
        });
        Ok(Pushed::Inserted)
    }

    /// Record a release, wherever the instance sits in the list. An emptied
    /// block goes back through `give` unless it is the only one.
    pub(crate) fn pop(
        &mut self,
        lock: &LockObject,
        exclusive: bool,
        enforce: bool,
        give: impl FnOnce(Box<LockBlock>),
    ) -> Result<Popped, PopError> {
        let (b, slot) = self.position(lock).ok_or(PopError::NotHeld)?;
        let instance = &mut self.blocks[b].entries[slot];
        if enforce && instance.exclusive != exclusive {
            return Err(PopError::ModeMismatch {
                held_exclusive: instance.exclusive,
                held_site: instance.site,
            });
        }
        if instance.recursion > 0 {
            instance.recursion -= 1;
            return Ok(Popped::Unrecursed(instance.recursion));
        }
        if enforce && instance.norelease {
            return Err(PopError::NoRelease);
        }

        let removed = self.blocks[b].entries.remove(slot);
        self.compact_from(b);
        if self.blocks.len() > 1 && self.blocks.last().is_some_and(|block| block.entries.is_empty()) {
            if let Some(block) = self.blocks.pop() {
                give(block);
            }
        }
        Ok(Popped::Removed(removed))
    }

    // Pull entries down from later blocks so every block but the newest
    // stays full.
    fn compact_from(&mut self, b: usize) {
        for next in b + 1..self.blocks.len() {
            if self.blocks[next].entries.is_empty() {
                break;
            }
            let moved = self.blocks[next].entries.remove(0);
            self.blocks[next - 1].entries.push(moved);
        }
    }

    /// Hand every block back, leaving the list empty.
    pub(crate) fn drain_blocks(&mut self) -> Vec<Box<LockBlock>> {
        std::mem::take(&mut self.blocks)
    }
}
