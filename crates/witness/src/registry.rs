use compact_str::CompactString;
use std::collections::HashMap;
use witness_types::WitnessId;

use crate::lock::LockClass;

/// Bookkeeping for one lock type.
#[derive(Debug, Clone)]
pub(crate) struct WitnessRecord {
    pub(crate) name: CompactString,
    pub(crate) class: &'static LockClass,
    pub(crate) index: WitnessId,
    pub(crate) ancestors: u32,
    pub(crate) descendants: u32,
    pub(crate) reversed: bool,
    pub(crate) refcount: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enrolled {
    Existing(WitnessId),
    New(WitnessId),
}

#[cfg(test)]
impl Enrolled {
    pub(crate) fn id(self) -> WitnessId {
        match self {
            Self::Existing(id) | Self::New(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnrollError {
    ClassMismatch { existing: &'static LockClass },
    Exhausted,
}

/// Name-indexed arena of witnesses.
///
/// Slots come off a free-index stack and are never given back: a witness
/// whose last lock is destroyed goes dormant but keeps its index and its
/// place in the order graph.
pub(crate) struct WitnessRegistry {
    slots: Vec<Option<WitnessRecord>>,
    free: Vec<WitnessId>,
    by_name: HashMap<CompactString, WitnessId>,
}

impl WitnessRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().map(WitnessId::from_index).collect(),
            by_name: HashMap::new(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// One past the highest index handed out so far.
    pub(crate) fn bound(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<WitnessId> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn enroll(&mut self, name: &str, class: &'static LockClass) -> Result<Enrolled, EnrollError> {
        if let Some(id) = self.lookup(name) {
            let record = self.slots[id.index()]
                .as_mut()
                .ok_or(EnrollError::Exhausted)?;
            if record.class != class {
                return Err(EnrollError::ClassMismatch {
                    existing: record.class,
                });
            }
            record.refcount += 1;
            return Ok(Enrolled::Existing(id));
        }

        let id = self.free.pop().ok_or(EnrollError::Exhausted)?;
        let name = CompactString::from(name);
        self.slots[id.index()] = Some(WitnessRecord {
            name: name.clone(),
            class,
            index: id,
            ancestors: 0,
            descendants: 0,
            reversed: false,
            refcount: 1,
        });
        self.by_name.insert(name, id);
        Ok(Enrolled::New(id))
    }

    /// Drop one reference. Returns `true` when the witness went dormant.
    pub(crate) fn retire(&mut self, id: WitnessId) -> bool {
        let Some(record) = self.get_mut(id) else {
            return false;
        };
        record.refcount = record.refcount.saturating_sub(1);
        record.refcount == 0
    }

    pub(crate) fn get(&self, id: WitnessId) -> Option<&WitnessRecord> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, id: WitnessId) -> Option<&mut WitnessRecord> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub(crate) fn name(&self, id: WitnessId) -> &str {
        self.get(id).map_or("<unknown>", |record| record.name.as_str())
    }

    /// Witnesses in index (enrollment) order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &WitnessRecord> {
        self.slots[..self.bound()].iter().flatten()
    }
}
