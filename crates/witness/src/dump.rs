use std::fmt::Write as _;
use witness_types::{
    EdgeSnapshot, GraphSnapshot, LockKind, ReversalSnapshot, StackHandle, WitnessId, WitnessSnapshot,
};

use crate::checker::{GraphState, Inner, OrderChecker};
use crate::matrix::RelationFlags;
use crate::registry::WitnessRecord;

fn snapshot_of(inner: &Inner, record: &WitnessRecord) -> WitnessSnapshot {
    WitnessSnapshot {
        index: record.index,
        name: record.name.to_string(),
        class: record.class.name().to_owned(),
        kind: record.class.kind(),
        ancestors: record.ancestors,
        descendants: record.descendants,
        reversed: record.reversed,
        refcount: record.refcount,
        last_acquired: inner.last_acquired(record.index).map(|site| site.to_snapshot()),
    }
}

struct TreeWalk<'a> {
    graph: &'a GraphState,
    checker: &'a OrderChecker,
    levels: Vec<Option<u32>>,
    displayed: Vec<bool>,
    out: String,
}

impl TreeWalk<'_> {
    fn children(&self, id: WitnessId) -> Vec<WitnessId> {
        let matrix = &self.checker.inner.matrix;
        self.graph
            .registry
            .iter()
            .map(|record| record.index)
            .filter(|child| matrix.get(id, *child).contains(RelationFlags::PARENT))
            .collect()
    }

    fn level(&mut self, id: WitnessId, level: u32) {
        if self.levels[id.index()].is_some_and(|current| current >= level) {
            return;
        }
        self.levels[id.index()] = Some(level);
        for child in self.children(id) {
            self.level(child, level + 1);
        }
    }

    fn depth(&self, id: WitnessId) -> i64 {
        self.levels[id.index()].map_or(-1, i64::from)
    }

    fn descend(&mut self, id: WitnessId, indent: usize) {
        let Some(record) = self.graph.registry.get(id) else {
            return;
        };
        let depth = self.depth(id);
        let _ = write!(
            self.out,
            "{:indent$}{} (type: {}, depth: {depth})",
            "",
            record.name,
            record.class.name()
        );
        if self.displayed[id.index()] {
            self.out.push_str(" -- (already displayed)\n");
            return;
        }
        self.displayed[id.index()] = true;
        match self.checker.inner.last_acquired(id) {
            Some(site) => {
                let _ = writeln!(self.out, " -- last acquired @ {site}");
            }
            None => self.out.push_str(" -- never acquired\n"),
        }
        for child in self.children(id) {
            self.descend(child, indent + 1);
        }
    }

    fn roots(&mut self, kind: LockKind) {
        let roots: Vec<WitnessId> = self
            .graph
            .registry
            .iter()
            .filter(|record| record.class.kind() == kind && self.checker.inner.last_acquired(record.index).is_some())
            .map(|record| record.index)
            .filter(|id| self.levels[id.index()].is_none_or(|level| level == 0))
            .collect();
        for id in roots {
            self.descend(id, 0);
        }
    }
}

struct ReversalPair {
    first: (String, &'static str),
    second: (String, &'static str),
    forward: Option<Option<StackHandle>>,
    backward: Option<Option<StackHandle>>,
}

impl OrderChecker {
    /// Every direct order edge between witnesses currently in use, as DOT.
    pub fn full_graph(&self) -> String {
        let graph = self.inner.graph.lock();
        let matrix = &self.inner.matrix;
        let mut out = String::from("digraph witness {\n");
        for parent in graph
            .registry
            .iter()
            .filter(|record| self.inner.last_acquired(record.index).is_some())
        {
            for child in graph.registry.iter() {
                if matrix.get(parent.index, child.index).contains(RelationFlags::PARENT) {
                    let _ = writeln!(out, "  \"{}\" -> \"{}\";", parent.name, child.name);
                }
            }
        }
        out.push_str("}\n");
        out
    }

    /// Every unblessed reversal with the stacks that first established each
    /// direction.
    ///
    /// The graph guard is only held per step, so the walk starts over if the
    /// graph changes underneath it.
    pub fn bad_stacks(&self) -> String {
        let inner = &*self.inner;
        'restart: loop {
            let (generation, relationships, bound) = {
                let graph = inner.graph.lock();
                (graph.generation, graph.order_log.len(), graph.registry.bound())
            };
            let mut out = format!("Number of known direct relationships is {relationships}\n");

            for i in 0..bound {
                let first = WitnessId::from_index(i);
                {
                    let graph = inner.graph.lock();
                    if graph.generation != generation {
                        continue 'restart;
                    }
                    if !graph.registry.get(first).is_some_and(|record| record.reversed) {
                        continue;
                    }
                }

                for j in i..bound {
                    let second = WitnessId::from_index(j);
                    if !inner.matrix.is_reversed(first, second) {
                        continue;
                    }
                    let pair = {
                        let graph = inner.graph.lock();
                        if graph.generation != generation {
                            continue 'restart;
                        }
                        let (Some(w1), Some(w2)) = (graph.registry.get(first), graph.registry.get(second)) else {
                            continue;
                        };
                        ReversalPair {
                            first: (w1.name.to_string(), w1.class.name()),
                            second: (w2.name.to_string(), w2.class.name()),
                            forward: graph.order_log.lookup(first, second).map(|edge| edge.stack.clone()),
                            backward: (first != second)
                                .then(|| graph.order_log.lookup(second, first).map(|edge| edge.stack.clone()))
                                .flatten(),
                        }
                    };
                    if inner.config.is_blessed(&pair.first.0, &pair.second.0) {
                        continue;
                    }

                    let _ = writeln!(
                        out,
                        "\n*** Lock order reversal between \"{}\"({}) and \"{}\"({})!",
                        pair.first.0, pair.first.1, pair.second.0, pair.second.1
                    );
                    for (from, to, stack) in [
                        (&pair.first, &pair.second, &pair.forward),
                        (&pair.second, &pair.first, &pair.backward),
                    ] {
                        let Some(stack) = stack else {
                            continue;
                        };
                        let _ = writeln!(
                            out,
                            "Lock order \"{}\"({}) -> \"{}\"({}) first seen at:",
                            from.0, from.1, to.0, to.1
                        );
                        if let Some(stack) = stack {
                            out.push_str(&inner.stacks.render(stack));
                        }
                        out.push('\n');
                    }
                }
            }

            if inner.graph.lock().generation != generation {
                continue 'restart;
            }
            return out;
        }
    }

    /// Indented descendant trees of sleep then spin witnesses.
    pub fn display_tree(&self) -> String {
        let graph = self.inner.graph.lock();
        let capacity = graph.registry.capacity();
        let mut walk = TreeWalk {
            graph: &*graph,
            checker: self,
            levels: vec![None; capacity],
            displayed: vec![false; capacity],
            out: String::new(),
        };

        let roots: Vec<WitnessId> = graph
            .registry
            .iter()
            .filter(|record| record.ancestors == 0)
            .map(|record| record.index)
            .collect();
        for root in roots {
            walk.level(root, 0);
        }

        walk.out.push_str("Sleep locks:\n");
        walk.roots(LockKind::Sleep);
        walk.out.push_str("\nSpin locks:\n");
        walk.roots(LockKind::Spin);
        walk.out.push_str("\nLocks which were never acquired:\n");
        for record in graph.registry.iter() {
            if self.inner.last_acquired(record.index).is_some() || record.refcount == 0 {
                continue;
            }
            let depth = walk.depth(record.index);
            let _ = writeln!(
                walk.out,
                "{} (type: {}, depth: {})",
                record.name,
                record.class.name(),
                depth
            );
        }
        walk.out
    }

    /// Serialisable view of the whole graph.
    pub fn snapshot(&self) -> GraphSnapshot {
        let graph = self.inner.graph.lock();
        let matrix = &self.inner.matrix;
        let mut edges = Vec::new();
        let mut reversals = Vec::new();
        for a in graph.registry.iter() {
            for b in graph.registry.iter() {
                let relation = matrix.get(a.index, b.index);
                if relation.contains(RelationFlags::PARENT) {
                    edges.push(EdgeSnapshot {
                        parent: a.name.to_string(),
                        child: b.name.to_string(),
                    });
                }
                if relation.contains(RelationFlags::REVERSAL) && a.index <= b.index {
                    reversals.push(ReversalSnapshot {
                        first: a.name.to_string(),
                        second: b.name.to_string(),
                    });
                }
            }
        }
        GraphSnapshot {
            state: self.state().to_string(),
            generation: graph.generation,
            witnesses: graph.registry.iter().map(|record| snapshot_of(&self.inner, record)).collect(),
            edges,
            reversals,
        }
    }

    pub fn witness_info(&self, witness: WitnessId) -> Option<WitnessSnapshot> {
        let graph = self.inner.graph.lock();
        graph.registry.get(witness).map(|record| snapshot_of(&self.inner, record))
    }

    pub fn witness_by_name(&self, name: &str) -> Option<WitnessSnapshot> {
        let graph = self.inner.graph.lock();
        let id = graph.registry.lookup(name)?;
        graph.registry.get(id).map(|record| snapshot_of(&self.inner, record))
    }
}
