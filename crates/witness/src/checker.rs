use bitflags::bitflags;
use compact_str::CompactString;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace, warn};
use witness_types::{HeldLockSnapshot, LockKind, Source, StackCapture, WitnessId};

use crate::config::{CheckMode, WitnessConfig};
use crate::error::{DisableReason, TransitionProblem, UsageError};
use crate::lock::{effective_flags, AcquireFlags, LockClass, LockFlags, LockObject};
use crate::lock_list::{BlockPool, LockInstance, PopError, Popped, PushError};
use crate::matrix::{Contradiction, RelationshipMatrix};
use crate::order_log::{LockOrderLog, Recorded};
use crate::owner::LockOwner;
use crate::registry::{EnrollError, Enrolled, WitnessRegistry};
use crate::report::{DuplicateReport, HeldSite, ReversalKind, ReversalReport, Violation};
use crate::sink::DiagnosticSink;

/// Longest accepted lock type name, in bytes.
pub const MAX_NAME_LEN: usize = 64;

const ACTIVE: u8 = 0;
const SUSPENDED: u8 = 1;
const DISABLED: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckerState {
    Active,
    /// Bookkeeping continues, order checks and usage checks do not.
    Suspended,
    /// Permanent. Lock operations pass straight through.
    Disabled(DisableReason),
}

impl fmt::Display for CheckerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Suspended => write!(f, "suspended"),
            Self::Disabled(reason) => write!(f, "disabled: {reason}"),
        }
    }
}

/// Outcome of an order check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Clean,
    Violation(Violation),
}

impl Verdict {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }

    pub fn violation(&self) -> Option<&Violation> {
        match self {
            Self::Clean => None,
            Self::Violation(violation) => Some(violation),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WarnFlags: u8 {
        /// Sleepable locks may stay held.
        const SLEEPOK = 0x01;
        const PANIC = 0x02;
    }
}

bitflags! {
    /// What a caller expects about a lock it may hold.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LockAssertion: u8 {
        const LOCKED = 0x01;
        const SLOCKED = 0x03;
        const XLOCKED = 0x05;
        const RECURSED = 0x08;
        const NOTRECURSED = 0x10;
    }
}

impl LockAssertion {
    pub const UNLOCKED: Self = Self::empty();

    fn is_valid(self) -> bool {
        if self.is_empty() {
            return true;
        }
        self.contains(Self::LOCKED)
            && !self.contains(Self::SLOCKED | Self::XLOCKED)
            && !self.contains(Self::RECURSED | Self::NOTRECURSED)
    }
}

pub(crate) struct GraphState {
    pub(crate) registry: WitnessRegistry,
    pub(crate) order_log: LockOrderLog,
    pub(crate) pool: BlockPool,
    pub(crate) generation: u64,
}

pub(crate) struct Inner {
    state: AtomicU8,
    reason: OnceLock<DisableReason>,
    panic_on_violation: AtomicBool,
    pub(crate) trace: AtomicBool,
    pub(crate) config: WitnessConfig,
    pub(crate) matrix: RelationshipMatrix,
    /// Where each witness was last acquired, indexed like the registry.
    /// Kept outside the graph guard so acquisitions never take it.
    last_acquired: Box<[Mutex<Option<Source>>]>,
    pub(crate) graph: Mutex<GraphState>,
    pub(crate) sink: Arc<dyn DiagnosticSink>,
    pub(crate) stacks: Arc<dyn StackCapture>,
}

impl Inner {
    fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == ACTIVE
    }

    fn is_disabled(&self) -> bool {
        self.state.load(Ordering::Acquire) == DISABLED
    }

    /// Switch off for good. Only the first caller gets to report.
    pub(crate) fn disable(&self, reason: DisableReason) {
        if self.reason.set(reason.clone()).is_err() {
            return;
        }
        self.state.store(DISABLED, Ordering::Release);
        self.sink.emit(&format!("witness: disabled: {reason}"));
    }

    pub(crate) fn last_acquired(&self, witness: WitnessId) -> Option<Source> {
        self.last_acquired.get(witness.index()).and_then(|cell| *cell.lock())
    }

    fn set_last_acquired(&self, witness: WitnessId, site: Option<Source>) {
        if let Some(cell) = self.last_acquired.get(witness.index()) {
            *cell.lock() = site;
        }
    }

    fn contradiction(&self, contradiction: Contradiction) {
        self.disable(DisableReason::GraphContradiction(contradiction));
    }

    fn usage(&self, err: UsageError) -> UsageError {
        self.sink.emit(&err.to_string());
        err
    }

    fn report(&self, violation: Violation) -> Verdict {
        for line in violation.lines() {
            self.sink.emit(&line);
        }
        if self.panic_on_violation.load(Ordering::Relaxed) {
            panic!("witness: {}", violation.headline());
        }
        Verdict::Violation(violation)
    }

    /// Add `parent -> child` and count every newly related pair.
    pub(crate) fn adopt(&self, graph: &mut GraphState, parent: WitnessId, child: WitnessId) -> Result<(), Contradiction> {
        let bound = graph.registry.bound();
        let Some(pairs) = self.matrix.adopt(parent, child, bound)? else {
            return Ok(());
        };
        for (ancestor, descendant) in pairs {
            if let Some(record) = graph.registry.get_mut(ancestor) {
                record.descendants += 1;
            }
            if let Some(record) = graph.registry.get_mut(descendant) {
                record.ancestors += 1;
            }
        }
        graph.generation += 1;
        debug!(
            parent = %graph.registry.name(parent),
            child = %graph.registry.name(child),
            generation = graph.generation,
            "new lock order"
        );
        Ok(())
    }

    pub(crate) fn retire_owner(&self, owner: &mut LockOwner) {
        if owner.holds_any() && self.is_active() {
            self.sink.emit(&format!(
                "thread \"{}\" exiting with the following locks held:",
                owner.name()
            ));
            for instance in owner.sleep.iter_recent().chain(owner.spin.iter_recent()) {
                self.sink.emit(&instance.describe());
            }
        }
        let mut graph = self.graph.lock();
        for block in owner.sleep.drain_blocks().into_iter().chain(owner.spin.drain_blocks()) {
            graph.pool.give(block);
        }
    }
}

/// The lock-order verifier.
///
/// Cheap to clone; clones share all state. Every thread that takes locks
/// needs its own [`LockOwner`] from [`OrderChecker::new_owner`].
#[derive(Clone)]
pub struct OrderChecker {
    pub(crate) inner: Arc<Inner>,
}

impl fmt::Debug for OrderChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderChecker")
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}

impl OrderChecker {
    pub fn new(config: WitnessConfig, sink: Arc<dyn DiagnosticSink>, stacks: Arc<dyn StackCapture>) -> Self {
        let config = config.clamped();
        let capacity = config.witness_capacity as usize;
        let inner = Inner {
            state: AtomicU8::new(ACTIVE),
            reason: OnceLock::new(),
            panic_on_violation: AtomicBool::new(config.panic_on_violation),
            trace: AtomicBool::new(config.trace),
            matrix: RelationshipMatrix::new(capacity),
            last_acquired: (0..capacity).map(|_| Mutex::new(None)).collect(),
            graph: Mutex::new(GraphState {
                registry: WitnessRegistry::new(capacity),
                order_log: LockOrderLog::new(config.order_log_capacity as usize),
                pool: BlockPool::new(config.lock_blocks as usize),
                generation: 0,
            }),
            sink,
            stacks,
            config,
        };
        let checker = Self { inner: Arc::new(inner) };
        checker.seed_order_hints();
        checker.set_mode(checker.inner.config.mode);
        checker
    }

    fn seed_order_hints(&self) {
        for hint in &self.inner.config.order_hints {
            let Some(class) = LockClass::by_name(&hint.class) else {
                warn!(class = %hint.class, "order hint names an unknown lock class, skipped");
                continue;
            };
            let mut previous: Option<WitnessId> = None;
            for name in &hint.names {
                let witness = match self.enroll(name, class) {
                    Ok(Some(witness)) => witness,
                    Ok(None) => return,
                    Err(err) => {
                        warn!(%err, "order hint entry skipped");
                        previous = None;
                        continue;
                    }
                };
                if let Some(parent) = previous.filter(|parent| *parent != witness) {
                    let mut graph = self.inner.graph.lock();
                    match self.inner.matrix.is_descendant(witness, parent) {
                        Ok(false) => {}
                        Ok(true) => {
                            warn!(parent = %name, "order hint contradicts an earlier hint, skipped");
                            previous = Some(witness);
                            continue;
                        }
                        Err(contradiction) => {
                            drop(graph);
                            self.inner.contradiction(contradiction);
                            return;
                        }
                    }
                    if let Err(contradiction) = self.inner.adopt(&mut graph, parent, witness) {
                        drop(graph);
                        self.inner.contradiction(contradiction);
                        return;
                    }
                }
                previous = Some(witness);
            }
        }
    }

    /// A fresh per-thread context.
    pub fn new_owner(&self, name: &str) -> LockOwner {
        LockOwner::new(name, Arc::downgrade(&self.inner))
    }

    pub fn config(&self) -> &WitnessConfig {
        &self.inner.config
    }

    pub fn state(&self) -> CheckerState {
        match self.inner.state.load(Ordering::Acquire) {
            ACTIVE => CheckerState::Active,
            SUSPENDED => CheckerState::Suspended,
            _ => CheckerState::Disabled(self.inner.reason.get().cloned().unwrap_or(DisableReason::Operator)),
        }
    }

    /// Change the checking mode. Returns `false` if the checker is already
    /// disabled, which cannot be undone.
    pub fn set_mode(&self, mode: CheckMode) -> bool {
        let target = match mode {
            CheckMode::Enabled => ACTIVE,
            CheckMode::Suspended => SUSPENDED,
            CheckMode::Off => {
                self.inner.disable(DisableReason::Operator);
                return true;
            }
        };
        self.inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != DISABLED).then_some(target)
            })
            .is_ok()
    }

    pub fn set_panic_on_violation(&self, on: bool) {
        self.inner.panic_on_violation.store(on, Ordering::Relaxed);
    }

    pub fn set_trace(&self, on: bool) {
        self.inner.trace.store(on, Ordering::Relaxed);
    }

    /// Bumped on every structural change to the order graph.
    pub fn generation(&self) -> u64 {
        self.inner.graph.lock().generation
    }

    /// Look up or create the witness for `name`.
    ///
    /// Returns `Ok(None)` when the lock should go untracked: the checker is
    /// disabled, spin locks are skipped, or the witness table just ran out.
    pub fn enroll(&self, name: &str, class: &'static LockClass) -> Result<Option<WitnessId>, UsageError> {
        let inner = &*self.inner;
        if name.is_empty() {
            return Err(inner.usage(UsageError::EmptyName));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(inner.usage(UsageError::NameTooLong {
                name: CompactString::from(name),
                max: MAX_NAME_LEN,
            }));
        }
        if inner.is_disabled() || (inner.config.skip_spin && class.kind() == LockKind::Spin) {
            return Ok(None);
        }

        let mut graph = inner.graph.lock();
        match graph.registry.enroll(name, class) {
            Ok(Enrolled::Existing(id)) => Ok(Some(id)),
            Ok(Enrolled::New(id)) => {
                graph.generation += 1;
                debug!(witness = %name, index = id.get(), class = class.name(), "enrolled witness");
                Ok(Some(id))
            }
            Err(EnrollError::ClassMismatch { existing }) => {
                drop(graph);
                Err(inner.usage(UsageError::ClassMismatch {
                    name: CompactString::from(name),
                    existing: existing.name(),
                    requested: class.name(),
                }))
            }
            Err(EnrollError::Exhausted) => {
                let capacity = graph.registry.capacity();
                drop(graph);
                inner.disable(DisableReason::WitnessTableFull { capacity });
                Ok(None)
            }
        }
    }

    /// Register a lock object whose witness is its own name.
    pub fn init(&self, name: &str, class: &'static LockClass, flags: LockFlags) -> Result<LockObject, UsageError> {
        self.init_typed(name, name, class, flags)
    }

    /// Register a lock object ordered under `type_name`.
    pub fn init_typed(
        &self,
        name: &str,
        type_name: &str,
        class: &'static LockClass,
        flags: LockFlags,
    ) -> Result<LockObject, UsageError> {
        let flags = effective_flags(class, flags);
        let witness = if flags.contains(LockFlags::NOWITNESS) {
            None
        } else {
            self.enroll(type_name, class)?
        };
        Ok(LockObject::new(name, type_name, class, flags, witness))
    }

    /// The lock object is going away.
    pub fn destroy(&self, lock: &LockObject) {
        let Some(witness) = lock.witness() else {
            return;
        };
        let mut graph = self.inner.graph.lock();
        if graph.registry.retire(witness) {
            self.inner.set_last_acquired(witness, None);
            debug!(witness = %lock.type_name(), "witness dormant");
        }
    }

    /// Check that acquiring `lock` now agrees with every order seen so far.
    ///
    /// Call before blocking on the real lock. `interlock` names a held lock
    /// that is being handed off for this one and does not count for ordering.
    pub fn check_order(
        &self,
        owner: &LockOwner,
        lock: &LockObject,
        flags: AcquireFlags,
        site: Source,
        interlock: Option<&LockObject>,
    ) -> Result<Verdict, UsageError> {
        let inner = &*self.inner;
        let Some(witness) = lock.witness() else {
            return Ok(Verdict::Clean);
        };
        if !inner.is_active() {
            return Ok(Verdict::Clean);
        }

        let list = match lock.kind() {
            LockKind::Sleep => {
                if let Some(spin) = owner.spin.most_recent() {
                    return Err(inner.usage(UsageError::SleepUnderSpin {
                        lock: lock.label(),
                        spin: spin.lock.label(),
                        site,
                    }));
                }
                &owner.sleep
            }
            LockKind::Spin => &owner.spin,
        };
        if list.is_empty() {
            return Ok(Verdict::Clean);
        }

        let exclusive = flags.contains(AcquireFlags::EXCLUSIVE);
        if let Some(held) = list.find(lock) {
            if held.exclusive && !exclusive {
                return Err(inner.usage(UsageError::ExclusiveToShared {
                    lock: lock.label(),
                    site,
                    held: held.site,
                }));
            }
            if !held.exclusive && exclusive {
                return Err(inner.usage(UsageError::SharedToExclusive {
                    lock: lock.label(),
                    site,
                    held: held.site,
                }));
            }
            if exclusive && !lock.is_recursable() {
                return Err(inner.usage(UsageError::RecursedNonRecursive {
                    lock: lock.label(),
                    site,
                }));
            }
            return Ok(Verdict::Clean);
        }

        if let Some(interlock) = interlock.filter(|il| il.witness().is_some()) {
            match owner.list(interlock.kind()).find(interlock) {
                None => {
                    return Err(inner.usage(UsageError::InterlockNotLocked {
                        interlock: interlock.label(),
                        site,
                    }));
                }
                Some(instance) if instance.recursion > 0 => {
                    return Err(inner.usage(UsageError::InterlockRecursed {
                        interlock: interlock.label(),
                        site,
                    }));
                }
                Some(_) => {}
            }
        }

        let Some(previous) = list.previous_excluding(interlock) else {
            return Ok(Verdict::Clean);
        };
        let Some(prev_witness) = previous.lock.witness() else {
            return Ok(Verdict::Clean);
        };
        if inner.matrix.probe_order(prev_witness, witness) {
            return Ok(Verdict::Clean);
        }

        let mut graph = inner.graph.lock();
        match inner.matrix.check_order(prev_witness, witness) {
            Ok(true) => return Ok(Verdict::Clean),
            Ok(false) => {}
            Err(contradiction) => {
                drop(graph);
                inner.contradiction(contradiction);
                return Ok(Verdict::Clean);
            }
        }
        inner.matrix.mark_order_known(prev_witness, witness);
        if graph.order_log.record(prev_witness, witness, || inner.stacks.capture()) == Recorded::Full {
            debug!(
                parent = %graph.registry.name(prev_witness),
                child = %graph.registry.name(witness),
                "order log full, edge not kept"
            );
        }

        if prev_witness == witness {
            if lock.flags().contains(LockFlags::DUPOK)
                || flags.contains(AcquireFlags::DUPOK)
                || !inner.matrix.mark_reversal(witness, witness)
            {
                return Ok(Verdict::Clean);
            }
            if let Some(record) = graph.registry.get_mut(witness) {
                record.reversed = true;
            }
            graph.generation += 1;
            drop(graph);
            let report = DuplicateReport {
                type_name: CompactString::from(lock.type_name()),
                first: HeldSite {
                    lock: previous.lock.label(),
                    site: previous.site,
                },
                second: HeldSite {
                    lock: lock.label(),
                    site,
                },
            };
            return Ok(inner.report(Violation::Duplicate(report)));
        }

        match inner.matrix.is_child(prev_witness, witness) {
            Ok(true) => return Ok(Verdict::Clean),
            Ok(false) => {}
            Err(contradiction) => {
                drop(graph);
                inner.contradiction(contradiction);
                return Ok(Verdict::Clean);
            }
        }

        let sleepable = lock.is_sleepable() && !flags.contains(AcquireFlags::NOSLEEP);
        let held: Vec<&LockInstance> = list.iter_recent().collect();
        for (pos, instance) in held.iter().enumerate() {
            if interlock.is_some_and(|il| il.same(&instance.lock)) {
                continue;
            }
            let Some(held_witness) = instance.lock.witness() else {
                continue;
            };
            let kind = if sleepable && !instance.lock.is_sleepable() {
                ReversalKind::SleepableAfterNonSleepable
            } else {
                match inner.matrix.is_descendant(witness, held_witness) {
                    Ok(true) => ReversalKind::Plain,
                    Ok(false) => continue,
                    Err(contradiction) => {
                        drop(graph);
                        inner.contradiction(contradiction);
                        return Ok(Verdict::Clean);
                    }
                }
            };

            if !inner.matrix.mark_reversal(held_witness, witness) {
                return Ok(Verdict::Clean);
            }
            for id in [held_witness, witness] {
                if let Some(record) = graph.registry.get_mut(id) {
                    record.reversed = true;
                }
            }
            graph.generation += 1;
            if inner.config.is_blessed(lock.type_name(), instance.lock.type_name()) {
                return Ok(Verdict::Clean);
            }

            let earlier = held[pos + 1..]
                .iter()
                .find(|older| older.lock.witness() == Some(witness))
                .map(|older| HeldSite {
                    lock: older.lock.label(),
                    site: older.site,
                });
            let traced = inner.trace.load(Ordering::Relaxed);
            let established_stack = if traced {
                graph
                    .order_log
                    .lookup(witness, held_witness)
                    .and_then(|edge| edge.stack.clone())
            } else {
                None
            };
            drop(graph);

            let stack = if traced {
                inner.stacks.capture().map(|stack| inner.stacks.render(&stack))
            } else {
                None
            };
            let established = established_stack.map(|stack| {
                (
                    CompactString::from(lock.type_name()),
                    CompactString::from(instance.lock.type_name()),
                    inner.stacks.render(&stack),
                )
            });
            let report = ReversalReport {
                kind,
                first: HeldSite {
                    lock: instance.lock.label(),
                    site: instance.site,
                },
                second: HeldSite {
                    lock: lock.label(),
                    site,
                },
                earlier,
                stack,
                established,
            };
            return Ok(inner.report(Violation::Reversal(report)));
        }

        if flags.contains(AcquireFlags::NEWORDER) {
            if let Err(contradiction) = inner.adopt(&mut graph, prev_witness, witness) {
                drop(graph);
                inner.contradiction(contradiction);
            }
        }
        Ok(Verdict::Clean)
    }

    /// Record that `lock` is now held. Call after the real lock succeeded.
    pub fn record_acquire(
        &self,
        owner: &mut LockOwner,
        lock: &LockObject,
        flags: AcquireFlags,
        site: Source,
    ) -> Result<(), UsageError> {
        let inner = &*self.inner;
        let Some(witness) = lock.witness() else {
            return Ok(());
        };
        if inner.is_disabled() {
            return Ok(());
        }
        let enforce = inner.is_active();
        inner.set_last_acquired(witness, Some(site));

        let exclusive = flags.contains(AcquireFlags::EXCLUSIVE);
        let pushed = owner
            .list_mut(lock.kind())
            .push(lock, site, exclusive, enforce, || inner.graph.lock().pool.take());
        match pushed {
            Ok(depth) => {
                if !lock.flags().contains(LockFlags::QUIET) {
                    trace!(lock = %lock.name(), %site, ?depth, exclusive, "acquired");
                }
                Ok(())
            }
            Err(PushError::ModeMismatch {
                held_exclusive,
                held_site,
            }) => {
                let err = if held_exclusive {
                    UsageError::ExclusiveToShared {
                        lock: lock.label(),
                        site,
                        held: held_site,
                    }
                } else {
                    UsageError::SharedToExclusive {
                        lock: lock.label(),
                        site,
                        held: held_site,
                    }
                };
                Err(inner.usage(err))
            }
            Err(PushError::PoolExhausted) => {
                let capacity = inner.graph.lock().pool.capacity();
                inner.disable(DisableReason::BlockPoolExhausted { capacity });
                Ok(())
            }
        }
    }

    /// [`Self::check_order`] then [`Self::record_acquire`]. Try-locks skip
    /// the order check since they cannot deadlock.
    pub fn acquire(
        &self,
        owner: &mut LockOwner,
        lock: &LockObject,
        flags: AcquireFlags,
        site: Source,
        interlock: Option<&LockObject>,
    ) -> Result<Verdict, UsageError> {
        let verdict = if flags.contains(AcquireFlags::TRYLOCK) {
            Verdict::Clean
        } else {
            self.check_order(owner, lock, flags, site, interlock)?
        };
        self.record_acquire(owner, lock, flags, site)?;
        Ok(verdict)
    }

    /// Record a release. While not active, stale entries are cleaned up
    /// without complaint.
    pub fn release(
        &self,
        owner: &mut LockOwner,
        lock: &LockObject,
        flags: AcquireFlags,
        site: Source,
    ) -> Result<(), UsageError> {
        let inner = &*self.inner;
        if lock.witness().is_none() {
            return Ok(());
        }
        let enforce = inner.is_active();
        let exclusive = flags.contains(AcquireFlags::EXCLUSIVE);
        let popped = owner
            .list_mut(lock.kind())
            .pop(lock, exclusive, enforce, |block| inner.graph.lock().pool.give(block));
        let err = match popped {
            Ok(popped) => {
                if !lock.flags().contains(LockFlags::QUIET) {
                    match popped {
                        Popped::Unrecursed(depth) => trace!(lock = %lock.name(), %site, depth, "unrecursed"),
                        Popped::Removed(instance) => {
                            trace!(lock = %lock.name(), %site, held_since = %instance.site, "released")
                        }
                    }
                }
                return Ok(());
            }
            Err(PopError::NotHeld) if !enforce => return Ok(()),
            Err(PopError::NotHeld) => UsageError::NotLocked {
                lock: lock.label(),
                site,
            },
            Err(PopError::ModeMismatch {
                held_exclusive: true,
                held_site,
            }) => UsageError::SharedUnlockOfExclusive {
                lock: lock.label(),
                site,
                held: held_site,
            },
            Err(PopError::ModeMismatch {
                held_exclusive: false,
                held_site,
            }) => UsageError::ExclusiveUnlockOfShared {
                lock: lock.label(),
                site,
                held: held_site,
            },
            Err(PopError::NoRelease) => UsageError::ForbiddenUnlock {
                lock: lock.label(),
                site,
            },
        };
        Err(inner.usage(err))
    }

    /// A shared hold became exclusive.
    pub fn upgrade(&self, owner: &mut LockOwner, lock: &LockObject, site: Source) -> Result<(), UsageError> {
        self.transition(owner, lock, site, true)
    }

    /// An exclusive hold became shared.
    pub fn downgrade(&self, owner: &mut LockOwner, lock: &LockObject, site: Source) -> Result<(), UsageError> {
        self.transition(owner, lock, site, false)
    }

    fn transition(&self, owner: &mut LockOwner, lock: &LockObject, site: Source, upgrade: bool) -> Result<(), UsageError> {
        let inner = &*self.inner;
        if lock.witness().is_none() || inner.is_disabled() {
            return Ok(());
        }
        let enforce = inner.is_active();
        let fail = |problem: TransitionProblem| {
            let err = if upgrade {
                UsageError::Upgrade {
                    lock: lock.label(),
                    site,
                    problem,
                }
            } else {
                UsageError::Downgrade {
                    lock: lock.label(),
                    site,
                    problem,
                }
            };
            inner.usage(err)
        };

        if enforce {
            if !lock.is_upgradable() {
                return Err(fail(TransitionProblem::NotUpgradable));
            }
            if lock.kind() != LockKind::Sleep {
                return Err(fail(TransitionProblem::NotSleepLock));
            }
        }
        let Some(instance) = owner.sleep.find_mut(lock) else {
            if enforce {
                return Err(fail(TransitionProblem::NotLocked));
            }
            return Ok(());
        };
        if enforce {
            if instance.exclusive == upgrade {
                return Err(fail(TransitionProblem::WrongMode));
            }
            if instance.recursion > 0 {
                return Err(fail(TransitionProblem::Recursed(instance.recursion)));
            }
        }
        instance.exclusive = upgrade;
        Ok(())
    }

    /// Report every held lock other than `exempt` ahead of an operation that
    /// may sleep. Returns how many were reported.
    pub fn warn(&self, owner: &LockOwner, flags: WarnFlags, exempt: Option<&LockObject>, message: &str) -> usize {
        let inner = &*self.inner;
        if inner.is_disabled() {
            return 0;
        }
        let header = || {
            format!(
                "{message} with the following {}locks held:",
                if flags.contains(WarnFlags::SLEEPOK) { "non-sleepable " } else { "" }
            )
        };
        let is_exempt = |instance: &LockInstance| exempt.is_some_and(|lock| lock.same(&instance.lock));

        let mut count = 0;
        for instance in owner.sleep.iter_recent() {
            if is_exempt(instance) || (flags.contains(WarnFlags::SLEEPOK) && instance.lock.is_sleepable()) {
                continue;
            }
            if count == 0 {
                inner.sink.emit(&header());
            }
            count += 1;
            inner.sink.emit(&instance.describe());
        }

        // Holding only the exempt spin lock is fine.
        let only_exempt_spin = owner.spin.len() == 1 && owner.spin.most_recent().is_some_and(is_exempt);
        if !owner.spin.is_empty() && !(only_exempt_spin && count == 0) {
            if count == 0 {
                inner.sink.emit(&header());
            }
            for instance in owner.spin.iter_recent() {
                count += 1;
                inner.sink.emit(&instance.describe());
            }
        }

        if count > 0 && flags.contains(WarnFlags::PANIC) {
            panic!("witness: {message} with {count} locks held");
        }
        count
    }

    /// Verify what the caller believes about `lock`.
    pub fn assert_lock(
        &self,
        owner: &LockOwner,
        lock: &LockObject,
        assertion: LockAssertion,
        site: Source,
    ) -> Result<(), UsageError> {
        let inner = &*self.inner;
        if lock.witness().is_none() || !inner.is_active() {
            return Ok(());
        }
        if !assertion.is_valid() {
            return Err(inner.usage(UsageError::InvalidAssertion { site }));
        }
        let fail = |detail: &'static str| -> Result<(), UsageError> {
            Err(inner.usage(UsageError::AssertionFailed {
                lock: lock.label(),
                site,
                detail,
            }))
        };

        let instance = owner.list(lock.kind()).find(lock);
        if assertion == LockAssertion::UNLOCKED {
            return match instance {
                Some(_) => fail("locked"),
                None => Ok(()),
            };
        }
        let Some(instance) = instance else {
            return fail("not locked");
        };
        if assertion.contains(LockAssertion::XLOCKED) && !instance.exclusive {
            return fail("not exclusively locked");
        }
        if assertion.contains(LockAssertion::SLOCKED) && instance.exclusive {
            return fail("exclusively locked");
        }
        if assertion.contains(LockAssertion::RECURSED) && instance.recursion == 0 {
            return fail("not recursed");
        }
        if assertion.contains(LockAssertion::NOTRECURSED) && instance.recursion > 0 {
            return fail("recursed");
        }
        Ok(())
    }

    /// Where `lock` was acquired, to hand back to [`Self::restore`] after
    /// the lock is dropped and retaken around a sleep.
    #[track_caller]
    pub fn save(&self, owner: &LockOwner, lock: &LockObject) -> Result<Option<Source>, UsageError> {
        let inner = &*self.inner;
        if lock.witness().is_none() || inner.is_disabled() {
            return Ok(None);
        }
        match owner.list(lock.kind()).find(lock) {
            Some(instance) => Ok(Some(instance.site)),
            None => Err(inner.usage(UsageError::NotLocked {
                lock: lock.label(),
                site: Source::caller(),
            })),
        }
    }

    #[track_caller]
    pub fn restore(&self, owner: &mut LockOwner, lock: &LockObject, saved: Source) -> Result<(), UsageError> {
        let inner = &*self.inner;
        let Some(witness) = lock.witness() else {
            return Ok(());
        };
        if inner.is_disabled() {
            return Ok(());
        }
        inner.set_last_acquired(witness, Some(saved));
        match owner.list_mut(lock.kind()).find_mut(lock) {
            Some(instance) => {
                instance.site = saved;
                Ok(())
            }
            None => Err(inner.usage(UsageError::NotLocked {
                lock: lock.label(),
                site: Source::caller(),
            })),
        }
    }

    /// Forbid releasing `lock` until [`Self::releaseok`].
    #[track_caller]
    pub fn norelease(&self, owner: &mut LockOwner, lock: &LockObject) -> Result<(), UsageError> {
        self.set_norelease(owner, lock, true, Source::caller())
    }

    #[track_caller]
    pub fn releaseok(&self, owner: &mut LockOwner, lock: &LockObject) -> Result<(), UsageError> {
        self.set_norelease(owner, lock, false, Source::caller())
    }

    fn set_norelease(&self, owner: &mut LockOwner, lock: &LockObject, on: bool, site: Source) -> Result<(), UsageError> {
        let inner = &*self.inner;
        if lock.witness().is_none() || inner.is_disabled() {
            return Ok(());
        }
        match owner.list_mut(lock.kind()).find_mut(lock) {
            Some(instance) => {
                instance.norelease = on;
                Ok(())
            }
            None => Err(inner.usage(UsageError::NotLocked {
                lock: lock.label(),
                site,
            })),
        }
    }

    /// Held locks, sleep locks first, most recent first within each list.
    pub fn list_locks(&self, owner: &LockOwner) -> Vec<String> {
        owner
            .sleep
            .iter_recent()
            .chain(owner.spin.iter_recent())
            .map(LockInstance::describe)
            .collect()
    }

    pub fn held(&self, owner: &LockOwner) -> Vec<HeldLockSnapshot> {
        owner
            .sleep
            .iter_recent()
            .chain(owner.spin.iter_recent())
            .map(|instance| HeldLockSnapshot {
                lock: instance.lock.name().to_owned(),
                type_name: instance.lock.type_name().to_owned(),
                class: instance.lock.class().name().to_owned(),
                exclusive: instance.exclusive,
                recursion: instance.recursion,
                site: instance.site.to_snapshot(),
            })
            .collect()
    }

    /// Declare that `first` is always taken before `second`.
    pub fn define_order(&self, first: &LockObject, second: &LockObject) -> Result<(), UsageError> {
        let inner = &*self.inner;
        if inner.is_disabled() {
            return Ok(());
        }
        let Some(parent) = first.witness() else {
            return Err(inner.usage(UsageError::Untracked { lock: first.label() }));
        };
        let Some(child) = second.witness() else {
            return Err(inner.usage(UsageError::Untracked { lock: second.label() }));
        };

        let mut graph = inner.graph.lock();
        let reversed = match inner.matrix.is_descendant(child, parent) {
            Ok(reversed) => reversed,
            Err(contradiction) => {
                drop(graph);
                inner.contradiction(contradiction);
                return Ok(());
            }
        };
        if parent == child || reversed {
            drop(graph);
            return Err(inner.usage(UsageError::OrderCycle {
                first: CompactString::from(first.type_name()),
                second: CompactString::from(second.type_name()),
            }));
        }
        if let Err(contradiction) = inner.adopt(&mut graph, parent, child) {
            drop(graph);
            inner.contradiction(contradiction);
        }
        Ok(())
    }
}
