use bitflags::bitflags;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use witness_types::WitnessId;

bitflags! {
    /// Relation of the row witness to the column witness.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RelationFlags: u8 {
        const PARENT = 0x01;
        const ANCESTOR = 0x02;
        const CHILD = 0x04;
        const DESCENDANT = 0x08;
        const REVERSAL = 0x10;
        const ORDER_KNOWN = 0x20;

        const ANCESTOR_MASK = Self::PARENT.bits() | Self::ANCESTOR.bits();
        const DESCENDANT_MASK = Self::CHILD.bits() | Self::DESCENDANT.bits();
        const RELATED = Self::ANCESTOR_MASK.bits() | Self::DESCENDANT_MASK.bits();
    }
}

impl RelationFlags {
    fn ancestor_to_descendant(self) -> Self {
        Self::from_bits_truncate((self & Self::ANCESTOR_MASK).bits() << 2)
    }

    fn descendant_to_ancestor(self) -> Self {
        Self::from_bits_truncate((self & Self::DESCENDANT_MASK).bits() >> 2)
    }

    fn related(self) -> Self {
        self & Self::RELATED
    }
}

/// An internal inconsistency in the order graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Contradiction {
    /// The relation at (first, second) is not the mirror of (second, first).
    Asymmetric {
        first: WitnessId,
        second: WitnessId,
        forward: u8,
        backward: u8,
    },
    /// Closure would make `ancestor` both ancestor and descendant of
    /// `descendant`.
    Cycle {
        ancestor: WitnessId,
        descendant: WitnessId,
    },
    SelfEdge(WitnessId),
}

impl fmt::Display for Contradiction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asymmetric {
                first,
                second,
                forward,
                backward,
            } => write!(
                f,
                "relation {first}->{second} is 0x{forward:02x} but {second}->{first} is 0x{backward:02x}"
            ),
            Self::Cycle { ancestor, descendant } => {
                write!(f, "{ancestor} would be both ancestor and descendant of {descendant}")
            }
            Self::SelfEdge(witness) => write!(f, "{witness} cannot be its own child"),
        }
    }
}

/// Square matrix of relation flags indexed by witness.
///
/// Cells are atomics so that the ORDER_KNOWN probe can run without the graph
/// guard; every mutation happens with the guard held.
pub struct RelationshipMatrix {
    dim: usize,
    cells: Box<[AtomicU8]>,
}

impl RelationshipMatrix {
    pub fn new(dim: usize) -> Self {
        let cells = (0..dim * dim).map(|_| AtomicU8::new(0)).collect();
        Self { dim, cells }
    }

    fn cell(&self, row: WitnessId, col: WitnessId) -> &AtomicU8 {
        &self.cells[row.index() * self.dim + col.index()]
    }

    pub fn get(&self, row: WitnessId, col: WitnessId) -> RelationFlags {
        RelationFlags::from_bits_truncate(self.cell(row, col).load(Ordering::Acquire))
    }

    fn set(&self, row: WitnessId, col: WitnessId, flags: RelationFlags) {
        self.cell(row, col).fetch_or(flags.bits(), Ordering::Release);
    }

    pub fn order_known(&self, parent: WitnessId, child: WitnessId) -> bool {
        self.get(parent, child).contains(RelationFlags::ORDER_KNOWN)
    }

    pub fn mark_order_known(&self, parent: WitnessId, child: WitnessId) {
        self.set(parent, child, RelationFlags::ORDER_KNOWN);
    }

    /// Lock-free probe: `parent -> child` is a known direct edge. May miss an
    /// edge being added concurrently; callers re-check under the guard.
    pub fn probe_order(&self, parent: WitnessId, child: WitnessId) -> bool {
        parent != child && self.get(parent, child).contains(RelationFlags::ORDER_KNOWN | RelationFlags::PARENT)
    }

    /// Guarded form of [`Self::probe_order`] that also validates the pair.
    pub fn check_order(&self, parent: WitnessId, child: WitnessId) -> Result<bool, Contradiction> {
        Ok(parent != child && self.order_known(parent, child) && self.is_child(parent, child)?)
    }

    fn consistent(&self, a: WitnessId, b: WitnessId) -> Result<(RelationFlags, RelationFlags), Contradiction> {
        let r1 = self.get(a, b).related();
        let r2 = self.get(b, a).related();
        let mirrored = (r1.ancestor_to_descendant() == r2 && r2.descendant_to_ancestor() == r1)
            || (r1.descendant_to_ancestor() == r2 && r2.ancestor_to_descendant() == r1);
        if !mirrored {
            return Err(Contradiction::Asymmetric {
                first: a,
                second: b,
                forward: r1.bits(),
                backward: r2.bits(),
            });
        }
        Ok((r1, r2))
    }

    pub fn is_child(&self, parent: WitnessId, child: WitnessId) -> Result<bool, Contradiction> {
        let (r, _) = self.consistent(parent, child)?;
        Ok(r.contains(RelationFlags::PARENT))
    }

    pub fn is_descendant(&self, ancestor: WitnessId, descendant: WitnessId) -> Result<bool, Contradiction> {
        let (r, _) = self.consistent(ancestor, descendant)?;
        Ok(r.intersects(RelationFlags::ANCESTOR_MASK))
    }

    /// Record `parent -> child` and close the relation transitively over the
    /// first `bound` witnesses.
    ///
    /// Returns `None` when the edge was already present, otherwise every
    /// (ancestor, descendant) pair that became newly related. Each pair
    /// appears once, so callers can count them.
    pub fn adopt(
        &self,
        parent: WitnessId,
        child: WitnessId,
        bound: usize,
    ) -> Result<Option<Vec<(WitnessId, WitnessId)>>, Contradiction> {
        if parent == child {
            return Err(Contradiction::SelfEdge(parent));
        }
        if self.is_child(parent, child)? {
            return Ok(None);
        }
        if self.is_descendant(child, parent)? {
            return Err(Contradiction::Cycle {
                ancestor: child,
                descendant: parent,
            });
        }

        let mut pairs = Vec::new();
        if !self.get(parent, child).intersects(RelationFlags::ANCESTOR_MASK) {
            pairs.push((parent, child));
        }
        self.set(parent, child, RelationFlags::PARENT);
        self.set(child, parent, RelationFlags::CHILD);

        let ids = || (0..bound.min(self.dim)).map(|raw| WitnessId::from_index(raw));
        for i in ids() {
            if i != parent && !self.get(i, parent).intersects(RelationFlags::ANCESTOR_MASK) {
                continue;
            }
            for j in ids() {
                if self.get(i, j).intersects(RelationFlags::ANCESTOR_MASK) {
                    continue;
                }
                if j != child && !self.get(child, j).intersects(RelationFlags::ANCESTOR_MASK) {
                    continue;
                }
                if i == j || self.get(i, j).intersects(RelationFlags::DESCENDANT_MASK) {
                    return Err(Contradiction::Cycle {
                        ancestor: i,
                        descendant: j,
                    });
                }
                self.set(i, j, RelationFlags::ANCESTOR);
                self.set(j, i, RelationFlags::DESCENDANT);
                pairs.push((i, j));
            }
        }
        Ok(Some(pairs))
    }

    /// Flag `a` and `b` as observed in both orders. Returns `false` if the
    /// pair was already flagged.
    pub fn mark_reversal(&self, a: WitnessId, b: WitnessId) -> bool {
        let previous = self.cell(a, b).fetch_or(RelationFlags::REVERSAL.bits(), Ordering::AcqRel);
        self.set(b, a, RelationFlags::REVERSAL);
        previous & RelationFlags::REVERSAL.bits() == 0
    }

    pub fn is_reversed(&self, a: WitnessId, b: WitnessId) -> bool {
        self.get(a, b).contains(RelationFlags::REVERSAL)
    }

    #[cfg(test)]
    pub(crate) fn corrupt(&self, row: WitnessId, col: WitnessId, flags: RelationFlags) {
        self.set(row, col, flags);
    }
}
