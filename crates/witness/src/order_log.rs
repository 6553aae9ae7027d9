use std::collections::HashMap;
use witness_types::{StackHandle, WitnessId};

/// First sighting of a `parent -> child` acquisition order.
#[derive(Debug, Clone)]
pub(crate) struct LockOrderEdge {
    pub(crate) parent: WitnessId,
    pub(crate) child: WitnessId,
    pub(crate) stack: Option<StackHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recorded {
    Inserted,
    Present,
    Full,
}

/// Diagnostics-only table of first-seen order edges. Entries are never
/// replaced or removed.
pub(crate) struct LockOrderLog {
    capacity: usize,
    edges: HashMap<(WitnessId, WitnessId), LockOrderEdge>,
}

impl LockOrderLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            edges: HashMap::new(),
        }
    }

    /// Record the pair if it is new. `capture` only runs when an entry is
    /// actually inserted.
    pub(crate) fn record(
        &mut self,
        parent: WitnessId,
        child: WitnessId,
        capture: impl FnOnce() -> Option<StackHandle>,
    ) -> Recorded {
        if self.edges.contains_key(&(parent, child)) {
            return Recorded::Present;
        }
        if self.edges.len() >= self.capacity {
            return Recorded::Full;
        }
        self.edges.insert(
            (parent, child),
            LockOrderEdge {
                parent,
                child,
                stack: capture(),
            },
        );
        Recorded::Inserted
    }

    pub(crate) fn lookup(&self, parent: WitnessId, child: WitnessId) -> Option<&LockOrderEdge> {
        self.edges.get(&(parent, child))
    }

    pub(crate) fn len(&self) -> usize {
        self.edges.len()
    }
}
