use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const EXCL: AcquireFlags = AcquireFlags::EXCLUSIVE;
const XNEW: AcquireFlags = AcquireFlags::EXCLUSIVE.union(AcquireFlags::NEWORDER);
const SNEW: AcquireFlags = AcquireFlags::NEWORDER;

fn checker_with(config: WitnessConfig) -> (OrderChecker, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let checker = OrderChecker::new(config, sink.clone(), Arc::new(NoStacks));
    (checker, sink)
}

fn checker() -> (OrderChecker, Arc<MemorySink>) {
    checker_with(WitnessConfig::small())
}

fn site(line: u32) -> Source {
    Source::new("tests.rs", line)
}

fn mutex(checker: &OrderChecker, name: &str) -> LockObject {
    checker
        .init(name, &SLEEP_MUTEX, LockFlags::empty())
        .expect("lock init should succeed")
}

fn take(checker: &OrderChecker, owner: &mut LockOwner, lock: &LockObject, line: u32) -> Verdict {
    checker
        .acquire(owner, lock, XNEW, site(line), None)
        .expect("acquire should not be a usage error")
}

fn drop_lock(checker: &OrderChecker, owner: &mut LockOwner, lock: &LockObject, line: u32) {
    checker
        .release(owner, lock, EXCL, site(line))
        .expect("release should not be a usage error");
}

/// Take `first` then `second`, then release both.
fn in_order(checker: &OrderChecker, owner: &mut LockOwner, first: &LockObject, second: &LockObject) -> Verdict {
    assert!(take(checker, owner, first, 1).is_clean());
    let verdict = take(checker, owner, second, 2);
    drop_lock(checker, owner, second, 3);
    drop_lock(checker, owner, first, 4);
    verdict
}

struct FixedStacks;

impl StackCapture for FixedStacks {
    fn capture(&self) -> Option<StackHandle> {
        StackHandle::new(vec![0xabc]).ok()
    }

    fn render(&self, stack: &StackHandle) -> String {
        stack.frames().iter().map(|ip| format!("frame 0x{ip:x}\n")).collect()
    }
}

/// Renders like [`FixedStacks`] and runs `hook` the first time it renders.
#[derive(Default)]
struct HookedStacks {
    hook: parking_lot::Mutex<Option<Box<dyn FnOnce() + Send>>>,
    renders: AtomicUsize,
}

impl StackCapture for HookedStacks {
    fn capture(&self) -> Option<StackHandle> {
        FixedStacks.capture()
    }

    fn render(&self, stack: &StackHandle) -> String {
        self.renders.fetch_add(1, Ordering::Relaxed);
        let hook = self.hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        FixedStacks.render(stack)
    }
}

// ── Ordering ────────────────────────────────────────────────

#[test]
fn reversal_is_reported_once_with_both_sites() {
    let (checker, sink) = checker();
    let a = mutex(&checker, "A");
    let b = mutex(&checker, "B");
    let wa = a.witness().expect("A tracked");
    let wb = b.witness().expect("B tracked");

    let mut t1 = checker.new_owner("t1");
    assert!(in_order(&checker, &mut t1, &a, &b).is_clean());
    assert_eq!(checker.inner.matrix.is_child(wa, wb), Ok(true));

    let mut t2 = checker.new_owner("t2");
    assert!(take(&checker, &mut t2, &b, 10).is_clean());
    let verdict = take(&checker, &mut t2, &a, 11);
    let Some(Violation::Reversal(report)) = verdict.violation() else {
        panic!("expected a reversal, got {verdict:?}");
    };
    assert_eq!(report.kind, ReversalKind::Plain);
    assert_eq!(report.first.lock.name, "B");
    assert_eq!(report.first.site, site(10));
    assert_eq!(report.second.lock.name, "A");
    assert_eq!(report.second.site, site(11));
    assert!(sink.contains(" 1st B (B, sleep mutex) @ tests.rs:10"));
    assert!(sink.contains(" 2nd A (A, sleep mutex) @ tests.rs:11"));
    drop_lock(&checker, &mut t2, &a, 12);
    drop_lock(&checker, &mut t2, &b, 13);

    assert!(in_order(&checker, &mut t2, &b, &a).is_clean());
    assert_eq!(sink.count("lock order reversal"), 1);
    assert!(checker.inner.matrix.is_reversed(wa, wb));
    assert!(checker.witness_by_name("A").is_some_and(|w| w.reversed));
}

#[test]
fn replaying_a_known_order_changes_nothing() {
    let (checker, sink) = checker();
    let a = mutex(&checker, "A");
    let b = mutex(&checker, "B");
    let mut owner = checker.new_owner("t");

    in_order(&checker, &mut owner, &a, &b);
    let generation = checker.generation();
    let wa = a.witness().expect("tracked");
    let wb = b.witness().expect("tracked");
    assert!(checker.inner.matrix.order_known(wa, wb));

    for _ in 0..3 {
        assert!(in_order(&checker, &mut owner, &a, &b).is_clean());
    }
    assert_eq!(checker.generation(), generation);
    assert!(checker.inner.matrix.order_known(wa, wb));
    assert_eq!(checker.inner.graph.lock().order_log.len(), 1);
    assert!(sink.lines().is_empty());
}

#[test]
fn transitive_order_is_enforced() {
    let (checker, _sink) = checker();
    let a = mutex(&checker, "A");
    let b = mutex(&checker, "B");
    let c = mutex(&checker, "C");
    let mut owner = checker.new_owner("t");

    in_order(&checker, &mut owner, &a, &b);
    in_order(&checker, &mut owner, &b, &c);
    let (wa, wc) = (a.witness().expect("A"), c.witness().expect("C"));
    assert_eq!(checker.inner.matrix.is_descendant(wa, wc), Ok(true));

    let verdict = in_order(&checker, &mut owner, &c, &a);
    assert!(matches!(verdict, Verdict::Violation(Violation::Reversal(_))));

    let info = checker.witness_by_name("A").expect("A enrolled");
    assert_eq!(info.descendants, 2);
    assert_eq!(checker.witness_by_name("C").map(|w| w.ancestors), Some(2));
}

#[test]
fn whole_held_list_is_scanned() {
    let (checker, _sink) = checker();
    let a = mutex(&checker, "A");
    let b = mutex(&checker, "B");
    let c = mutex(&checker, "C");
    let mut owner = checker.new_owner("t");
    in_order(&checker, &mut owner, &a, &b);

    take(&checker, &mut owner, &b, 20);
    // No NEWORDER, so C stays unrelated to B.
    checker
        .acquire(&mut owner, &c, EXCL, site(21), None)
        .expect("C under B");
    let verdict = take(&checker, &mut owner, &a, 22);
    let Some(Violation::Reversal(report)) = verdict.violation() else {
        panic!("A under B must be caught even with C in between, got {verdict:?}");
    };
    assert_eq!(report.first.lock.name, "B");
}

#[test]
fn reversal_lists_earlier_lock_of_same_type() {
    let (checker, sink) = checker();
    let a1 = checker
        .init_typed("a1", "A", &SLEEP_MUTEX, LockFlags::DUPOK)
        .expect("a1");
    let a2 = checker
        .init_typed("a2", "A", &SLEEP_MUTEX, LockFlags::DUPOK)
        .expect("a2");
    let b = mutex(&checker, "B");
    let mut owner = checker.new_owner("t");
    in_order(&checker, &mut owner, &a1, &b);

    take(&checker, &mut owner, &a1, 30);
    take(&checker, &mut owner, &b, 31);
    let verdict = take(&checker, &mut owner, &a2, 32);
    let Some(Violation::Reversal(report)) = verdict.violation() else {
        panic!("expected a reversal, got {verdict:?}");
    };
    assert_eq!(report.earlier.as_ref().map(|e| e.lock.name.as_str()), Some("a1"));
    assert!(sink.contains(" 3rd a2 (A, sleep mutex) @ tests.rs:32"));
}

#[test]
fn duplicate_type_needs_dupok() {
    let (checker, sink) = checker();
    let vp1 = checker
        .init_typed("vp1", "vnode", &SLEEP_MUTEX, LockFlags::empty())
        .expect("vp1");
    let vp2 = checker
        .init_typed("vp2", "vnode", &SLEEP_MUTEX, LockFlags::empty())
        .expect("vp2");
    assert_eq!(vp1.witness(), vp2.witness());
    let mut owner = checker.new_owner("t");

    let verdict = in_order(&checker, &mut owner, &vp1, &vp2);
    let Some(Violation::Duplicate(report)) = verdict.violation() else {
        panic!("expected a duplicate report, got {verdict:?}");
    };
    assert_eq!(report.type_name, "vnode");
    assert!(sink.contains("acquiring duplicate lock of same type: \"vnode\""));
    assert!(sink.contains(" 1st vp1 @ tests.rs:1"));
    assert!(sink.contains(" 2nd vp2 @ tests.rs:2"));

    // Reported once per type.
    assert!(in_order(&checker, &mut owner, &vp1, &vp2).is_clean());

    let bo1 = checker
        .init_typed("bo1", "bufobj", &SLEEP_MUTEX, LockFlags::DUPOK)
        .expect("bo1");
    let bo2 = checker
        .init_typed("bo2", "bufobj", &SLEEP_MUTEX, LockFlags::DUPOK)
        .expect("bo2");
    assert!(in_order(&checker, &mut owner, &bo1, &bo2).is_clean());

    let buf1 = checker
        .init_typed("buf1", "buf", &SLEEP_MUTEX, LockFlags::empty())
        .expect("buf1");
    let buf2 = checker
        .init_typed("buf2", "buf", &SLEEP_MUTEX, LockFlags::empty())
        .expect("buf2");
    take(&checker, &mut owner, &buf1, 40);
    let verdict = checker
        .acquire(&mut owner, &buf2, XNEW | AcquireFlags::DUPOK, site(41), None)
        .expect("acquire");
    assert!(verdict.is_clean());
    assert_eq!(sink.count("duplicate lock"), 1);
}

#[test]
fn blessed_reversal_is_recorded_silently() {
    let (checker, sink) = checker_with(WitnessConfig {
        blessed: vec![BlessedPair {
            first: "ufs".to_owned(),
            second: "bufwait".to_owned(),
        }],
        ..WitnessConfig::small()
    });
    let ufs = mutex(&checker, "ufs");
    let bufwait = mutex(&checker, "bufwait");
    let mut owner = checker.new_owner("t");
    in_order(&checker, &mut owner, &ufs, &bufwait);
    assert!(in_order(&checker, &mut owner, &bufwait, &ufs).is_clean());

    let (wu, wb) = (ufs.witness().expect("ufs"), bufwait.witness().expect("bufwait"));
    assert!(checker.inner.matrix.is_reversed(wu, wb));
    assert!(!sink.contains("lock order reversal"));
    assert!(!checker.bad_stacks().contains("***"));
}

#[test]
fn sleepable_after_non_sleepable_is_a_reversal() {
    let (checker, sink) = checker();
    let m = mutex(&checker, "proc lock");
    let sx = checker.init("allproc", &SX_LOCK, LockFlags::empty()).expect("sx");
    assert!(sx.is_sleepable());
    let mut owner = checker.new_owner("t");

    let verdict = in_order(&checker, &mut owner, &m, &sx);
    let Some(Violation::Reversal(report)) = verdict.violation() else {
        panic!("expected a reversal, got {verdict:?}");
    };
    assert_eq!(report.kind, ReversalKind::SleepableAfterNonSleepable);
    assert!(sink.contains("lock order reversal: (sleepable after non-sleepable)"));

    let m2 = mutex(&checker, "pipe lock");
    let sx2 = checker.init("pipe sx", &SX_LOCK, LockFlags::empty()).expect("sx2");
    take(&checker, &mut owner, &m2, 50);
    let verdict = checker
        .acquire(&mut owner, &sx2, XNEW | AcquireFlags::NOSLEEP, site(51), None)
        .expect("acquire");
    assert!(verdict.is_clean());
}

#[test]
fn order_hints_seed_the_graph() {
    let (checker, sink) = checker_with(WitnessConfig {
        order_hints: vec![OrderHint {
            class: "sleep mutex".to_owned(),
            names: vec!["vm map".to_owned(), "vm object".to_owned(), "vm page".to_owned()],
        }],
        ..WitnessConfig::small()
    });
    assert_eq!(checker.witness_by_name("vm map").map(|w| w.descendants), Some(2));

    let map = mutex(&checker, "vm map");
    let page = mutex(&checker, "vm page");
    let mut owner = checker.new_owner("t");
    assert!(in_order(&checker, &mut owner, &map, &page).is_clean());
    assert!(!in_order(&checker, &mut owner, &page, &map).is_clean());
    assert_eq!(sink.count("lock order reversal"), 1);
}

#[test]
fn define_order_refuses_cycles() {
    let (checker, _sink) = checker();
    let a = mutex(&checker, "A");
    let b = mutex(&checker, "B");
    checker.define_order(&a, &b).expect("A before B");
    let err = checker.define_order(&b, &a).expect_err("B before A contradicts");
    assert!(matches!(err, UsageError::OrderCycle { .. }));
    assert!(matches!(checker.define_order(&a, &a), Err(UsageError::OrderCycle { .. })));

    let untracked = checker.init("loose", &SLEEP_MUTEX, LockFlags::NOWITNESS).expect("init");
    assert!(matches!(checker.define_order(&a, &untracked), Err(UsageError::Untracked { .. })));

    let mut owner = checker.new_owner("t");
    assert!(!in_order(&checker, &mut owner, &b, &a).is_clean());
}

#[test]
fn trace_appends_stacks() {
    let sink = Arc::new(MemorySink::new());
    let checker = OrderChecker::new(WitnessConfig::small(), sink.clone(), Arc::new(FixedStacks));
    let a = mutex(&checker, "A");
    let b = mutex(&checker, "B");
    let mut owner = checker.new_owner("t");
    in_order(&checker, &mut owner, &a, &b);
    in_order(&checker, &mut owner, &b, &a);

    let lines = sink.lines();
    let header = lines
        .iter()
        .position(|line| line == "lock order reversal:")
        .expect("reversal reported");
    assert_eq!(lines[header + 3], "stack backtrace:");
    assert_eq!(lines[header + 4], "frame 0xabc");
    assert_eq!(lines[header + 5], "lock order A -> B established at:");

    checker.set_trace(false);
    let c = mutex(&checker, "C");
    in_order(&checker, &mut owner, &a, &c);
    sink.take();
    in_order(&checker, &mut owner, &c, &a);
    assert!(sink.contains("lock order reversal:"));
    assert!(!sink.contains("stack backtrace:"));
}

#[test]
#[should_panic(expected = "lock order reversal")]
fn panic_on_violation_escalates() {
    let (checker, _sink) = checker_with(WitnessConfig {
        panic_on_violation: true,
        ..WitnessConfig::small()
    });
    let a = mutex(&checker, "A");
    let b = mutex(&checker, "B");
    let mut owner = checker.new_owner("t");
    in_order(&checker, &mut owner, &a, &b);
    in_order(&checker, &mut owner, &b, &a);
}

#[test]
fn known_order_does_not_take_the_graph_guard() {
    let (checker, _sink) = checker();
    let a = mutex(&checker, "A");
    let b = mutex(&checker, "B");
    let mut owner = checker.new_owner("t");
    in_order(&checker, &mut owner, &a, &b);

    let graph = checker.inner.graph.lock();
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    std::thread::scope(|scope| {
        scope.spawn(|| {
            assert!(take(&checker, &mut owner, &a, 20).is_clean());
            assert!(take(&checker, &mut owner, &b, 21).is_clean());
            drop_lock(&checker, &mut owner, &b, 22);
            drop_lock(&checker, &mut owner, &a, 23);
            let _ = done_tx.send(());
        });
        let finished = done_rx.recv_timeout(std::time::Duration::from_secs(5)).is_ok();
        drop(graph);
        assert!(finished, "acquiring in a known order blocked on the graph guard");
    });

    let info = checker.witness_by_name("B").expect("B enrolled");
    assert_eq!(info.last_acquired.map(|s| s.line), Some(21));
}

// ── Interlocks and contexts ─────────────────────────────────

#[test]
fn interlock_is_not_ordered_against() {
    let (checker, sink) = checker();
    let a = mutex(&checker, "A");
    let b = mutex(&checker, "B");
    let mut owner = checker.new_owner("t");
    in_order(&checker, &mut owner, &a, &b);

    take(&checker, &mut owner, &b, 60);
    let verdict = checker
        .acquire(&mut owner, &a, XNEW, site(61), Some(&b))
        .expect("hand-off from B to A");
    assert!(verdict.is_clean());
    // Released out of stack order.
    drop_lock(&checker, &mut owner, &b, 62);
    assert_eq!(owner.held_count(), 1);
    drop_lock(&checker, &mut owner, &a, 63);
    assert!(!owner.holds_any());
    assert!(!sink.contains("reversal"));
}

#[test]
fn interlock_must_be_held_once() {
    let (checker, _sink) = checker();
    let a = checker.init("A", &SLEEP_MUTEX, LockFlags::RECURSABLE).expect("A");
    let b = mutex(&checker, "B");
    let c = mutex(&checker, "C");
    let mut owner = checker.new_owner("t");
    take(&checker, &mut owner, &c, 1);

    let err = checker
        .check_order(&owner, &b, XNEW, site(2), Some(&a))
        .expect_err("interlock not held");
    assert!(matches!(err, UsageError::InterlockNotLocked { .. }));

    take(&checker, &mut owner, &a, 3);
    take(&checker, &mut owner, &a, 4);
    let err = checker
        .check_order(&owner, &b, XNEW, site(5), Some(&a))
        .expect_err("interlock recursed");
    assert!(matches!(err, UsageError::InterlockRecursed { .. }));
}

#[test]
fn sleep_lock_under_spin_lock_is_refused() {
    let (checker, _sink) = checker();
    let spin = checker.init("sched lock", &SPIN_MUTEX, LockFlags::empty()).expect("spin");
    let sleep = mutex(&checker, "proc");
    let mut owner = checker.new_owner("t");
    take(&checker, &mut owner, &spin, 1);
    let err = checker
        .acquire(&mut owner, &sleep, XNEW, site(2), None)
        .expect_err("sleep lock under spin");
    assert!(matches!(err, UsageError::SleepUnderSpin { .. }));
    assert_eq!(owner.held_count(), 1);
}

#[test]
fn spin_and_sleep_lists_are_separate() {
    let (checker, _sink) = checker();
    let sleep = mutex(&checker, "proc");
    let spin = checker.init("sched lock", &SPIN_MUTEX, LockFlags::empty()).expect("spin");
    let mut owner = checker.new_owner("t");
    take(&checker, &mut owner, &sleep, 1);
    assert!(take(&checker, &mut owner, &spin, 2).is_clean());
    assert_eq!(owner.sleep.len(), 1);
    assert_eq!(owner.spin.len(), 1);
}

// ── Instance bookkeeping ────────────────────────────────────

#[test]
fn recursion_unwinds_to_empty_list() {
    let (checker, _sink) = checker();
    let l = checker.init("M", &SLEEP_MUTEX, LockFlags::RECURSABLE).expect("M");
    let mut owner = checker.new_owner("t");

    for line in 1..=3 {
        assert!(take(&checker, &mut owner, &l, line).is_clean());
    }
    assert_eq!(owner.held_count(), 1);
    checker
        .assert_lock(&owner, &l, LockAssertion::XLOCKED | LockAssertion::RECURSED, site(4))
        .expect("recursed exclusive hold");
    assert_eq!(checker.witness_by_name("M").map(|w| w.refcount), Some(1));

    for line in 5..=7 {
        drop_lock(&checker, &mut owner, &l, line);
    }
    assert_eq!(owner.held_count(), 0);
    checker
        .assert_lock(&owner, &l, LockAssertion::UNLOCKED, site(8))
        .expect("unlocked after matching releases");
    assert_eq!(checker.witness_by_name("M").map(|w| w.refcount), Some(1));
}

#[test]
fn recursing_a_non_recursive_lock_is_refused() {
    let (checker, _sink) = checker();
    let l = mutex(&checker, "plain");
    let mut owner = checker.new_owner("t");
    take(&checker, &mut owner, &l, 1);
    let err = checker
        .acquire(&mut owner, &l, XNEW, site(2), None)
        .expect_err("recursion on non-recursive lock");
    assert!(matches!(err, UsageError::RecursedNonRecursive { .. }));
}

#[test]
fn shared_exclusive_mismatches_are_refused() {
    let (checker, sink) = checker();
    let rw = checker.init("tree", &RW_LOCK, LockFlags::RECURSABLE).expect("rw");
    let mut owner = checker.new_owner("t");
    checker
        .acquire(&mut owner, &rw, SNEW, site(1), None)
        .expect("shared acquire");

    let err = checker
        .acquire(&mut owner, &rw, XNEW, site(2), None)
        .expect_err("exclusive over shared");
    assert!(matches!(err, UsageError::SharedToExclusive { held, .. } if held == site(1)));
    assert!(sink.contains("share->excl: exclusive lock of (rw) tree @ tests.rs:2"));

    let err = checker
        .release(&mut owner, &rw, EXCL, site(3))
        .expect_err("exclusive unlock of shared hold");
    assert_eq!(err.code(), "share->uexcl");

    checker
        .release(&mut owner, &rw, AcquireFlags::empty(), site(4))
        .expect("shared release");
    let err = checker
        .release(&mut owner, &rw, AcquireFlags::empty(), site(5))
        .expect_err("not held");
    assert!(matches!(err, UsageError::NotLocked { .. }));
}

#[test]
fn upgrade_and_downgrade_flip_mode_in_place() {
    let (checker, _sink) = checker();
    let rw = checker.init("tree", &RW_LOCK, LockFlags::RECURSABLE).expect("rw");
    let mut owner = checker.new_owner("t");
    checker
        .acquire(&mut owner, &rw, SNEW, site(1), None)
        .expect("shared acquire");

    checker.upgrade(&mut owner, &rw, site(2)).expect("upgrade");
    checker
        .assert_lock(&owner, &rw, LockAssertion::XLOCKED, site(3))
        .expect("now exclusive");
    let err = checker.upgrade(&mut owner, &rw, site(4)).expect_err("already exclusive");
    assert!(matches!(
        err,
        UsageError::Upgrade {
            problem: TransitionProblem::WrongMode,
            ..
        }
    ));

    checker.downgrade(&mut owner, &rw, site(5)).expect("downgrade");
    checker
        .assert_lock(&owner, &rw, LockAssertion::SLOCKED, site(6))
        .expect("shared again");

    checker
        .acquire(&mut owner, &rw, SNEW, site(7), None)
        .expect("shared recursion");
    let err = checker.upgrade(&mut owner, &rw, site(8)).expect_err("recursed");
    assert!(matches!(
        err,
        UsageError::Upgrade {
            problem: TransitionProblem::Recursed(1),
            ..
        }
    ));

    let m = mutex(&checker, "plain");
    let err = checker.upgrade(&mut owner, &m, site(9)).expect_err("mutexes do not upgrade");
    assert!(matches!(
        err,
        UsageError::Upgrade {
            problem: TransitionProblem::NotUpgradable,
            ..
        }
    ));
}

#[test]
fn warn_lists_offending_locks() {
    let (checker, sink) = checker();
    let sx = checker.init("allproc", &SX_LOCK, LockFlags::empty()).expect("sx");
    let m = mutex(&checker, "proc lock");
    let mut owner = checker.new_owner("t");
    take(&checker, &mut owner, &sx, 1);
    checker
        .acquire(&mut owner, &m, XNEW | AcquireFlags::NOSLEEP, site(2), None)
        .expect("mutex under sx");

    assert_eq!(checker.warn(&owner, WarnFlags::SLEEPOK, None, "sleeping"), 1);
    assert!(sink.contains("sleeping with the following non-sleepable locks held:"));
    assert!(sink.contains("exclusive sleep mutex proc lock r = 0"));

    assert_eq!(checker.warn(&owner, WarnFlags::empty(), Some(&m), "waiting"), 1);
    assert!(sink.contains("exclusive sx allproc r = 0"));

    drop_lock(&checker, &mut owner, &m, 3);
    assert_eq!(checker.warn(&owner, WarnFlags::SLEEPOK, None, "sleeping"), 0);
}

#[test]
fn assertions_check_hold_state() {
    let (checker, _sink) = checker();
    let m = mutex(&checker, "m");
    let mut owner = checker.new_owner("t");

    let err = checker
        .assert_lock(&owner, &m, LockAssertion::LOCKED, site(1))
        .expect_err("not held");
    assert!(matches!(err, UsageError::AssertionFailed { detail: "not locked", .. }));

    take(&checker, &mut owner, &m, 2);
    let err = checker
        .assert_lock(&owner, &m, LockAssertion::UNLOCKED, site(3))
        .expect_err("held");
    assert!(matches!(err, UsageError::AssertionFailed { detail: "locked", .. }));
    let err = checker
        .assert_lock(&owner, &m, LockAssertion::SLOCKED, site(4))
        .expect_err("held exclusively");
    assert!(matches!(err, UsageError::AssertionFailed { detail: "exclusively locked", .. }));
    checker
        .assert_lock(&owner, &m, LockAssertion::LOCKED | LockAssertion::NOTRECURSED, site(5))
        .expect("held once");

    let err = checker
        .assert_lock(&owner, &m, LockAssertion::SLOCKED | LockAssertion::XLOCKED, site(6))
        .expect_err("contradictory assertion");
    assert!(matches!(err, UsageError::InvalidAssertion { .. }));
}

#[test]
fn norelease_blocks_release_until_cleared() {
    let (checker, sink) = checker();
    let m = mutex(&checker, "giant");
    let mut owner = checker.new_owner("t");
    take(&checker, &mut owner, &m, 1);
    checker.norelease(&mut owner, &m).expect("mark norelease");

    let err = checker
        .release(&mut owner, &m, EXCL, site(2))
        .expect_err("forbidden unlock");
    assert!(matches!(err, UsageError::ForbiddenUnlock { .. }));
    assert!(sink.contains("forbidden unlock of (sleep mutex) giant @ tests.rs:2"));
    assert_eq!(owner.held_count(), 1);

    checker.releaseok(&mut owner, &m).expect("clear norelease");
    drop_lock(&checker, &mut owner, &m, 3);
    assert!(!owner.holds_any());

    let err = checker.norelease(&mut owner, &m).expect_err("not held");
    assert!(matches!(err, UsageError::NotLocked { .. }));
}

#[test]
fn save_and_restore_acquisition_site() {
    let (checker, _sink) = checker();
    let m = mutex(&checker, "vnode interlock");
    let mut owner = checker.new_owner("t");
    take(&checker, &mut owner, &m, 1);

    let saved = checker.save(&owner, &m).expect("held").expect("tracked");
    assert_eq!(saved, site(1));
    checker
        .restore(&mut owner, &m, site(99))
        .expect("restore held lock");
    assert!(checker.list_locks(&owner)[0].ends_with("locked @ tests.rs:99"));
    let info = checker.witness_by_name("vnode interlock").expect("enrolled");
    assert_eq!(info.last_acquired.map(|s| s.line), Some(99));

    drop_lock(&checker, &mut owner, &m, 2);
    assert!(checker.save(&owner, &m).is_err());
}

#[test]
fn list_locks_formats_each_instance() {
    let (checker, _sink) = checker();
    let vp = checker
        .init_typed("vp1", "vnode", &SLEEP_MUTEX, LockFlags::empty())
        .expect("vp1");
    let mut owner = checker.new_owner("t");
    take(&checker, &mut owner, &vp, 7);
    let lines = checker.list_locks(&owner);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("exclusive sleep mutex vp1 (vnode) r = 0 (#"));
    assert!(lines[0].ends_with(") locked @ tests.rs:7"));

    let held = checker.held(&owner);
    assert_eq!(held[0].type_name, "vnode");
    assert_eq!(held[0].site.line, 7);
}

#[test]
fn dropped_owner_returns_blocks() {
    let (checker, sink) = checker_with(WitnessConfig {
        lock_blocks: 2,
        ..WitnessConfig::small()
    });
    let m = mutex(&checker, "leaked");
    {
        let mut owner = checker.new_owner("worker");
        take(&checker, &mut owner, &m, 1);
        assert_eq!(checker.inner.graph.lock().pool.available(), 1);
    }
    assert_eq!(checker.inner.graph.lock().pool.available(), 2);
    assert!(sink.contains("thread \"worker\" exiting with the following locks held:"));
    assert!(sink.contains("exclusive sleep mutex leaked r = 0"));
}

// ── Failure model ───────────────────────────────────────────

#[test]
fn full_witness_table_fails_open() {
    let (checker, sink) = checker_with(WitnessConfig {
        witness_capacity: 2,
        ..WitnessConfig::small()
    });
    let a = mutex(&checker, "A");
    let _b = mutex(&checker, "B");
    let c = mutex(&checker, "C");
    assert!(c.witness().is_none());
    assert_eq!(
        checker.state(),
        CheckerState::Disabled(DisableReason::WitnessTableFull { capacity: 2 })
    );
    assert_eq!(checker.enroll("D", &SLEEP_MUTEX), Ok(None));
    assert_eq!(sink.count("witness: disabled"), 1);

    let mut owner = checker.new_owner("t");
    assert!(take(&checker, &mut owner, &c, 1).is_clean());
    assert!(take(&checker, &mut owner, &a, 2).is_clean());
    drop_lock(&checker, &mut owner, &a, 3);
    drop_lock(&checker, &mut owner, &c, 4);
    assert!(!checker.set_mode(CheckMode::Enabled));
}

#[test]
fn empty_block_pool_fails_open() {
    let (checker, sink) = checker_with(WitnessConfig {
        lock_blocks: 1,
        ..WitnessConfig::small()
    });
    let locks: Vec<_> = (0..=BLOCK_SLOTS).map(|i| mutex(&checker, &format!("L{i}"))).collect();
    let mut owner = checker.new_owner("t");
    for (line, lock) in locks.iter().enumerate() {
        assert!(take(&checker, &mut owner, lock, line as u32).is_clean());
    }
    assert!(matches!(
        checker.state(),
        CheckerState::Disabled(DisableReason::BlockPoolExhausted { capacity: 1 })
    ));
    assert!(sink.contains("lock list block pool exhausted"));
    assert_eq!(owner.held_count(), BLOCK_SLOTS);

    for lock in locks.iter().rev() {
        drop_lock(&checker, &mut owner, lock, 100);
    }
    assert!(!owner.holds_any());
}

#[test]
fn graph_contradiction_disables_checker() {
    let (checker, sink) = checker();
    let a = mutex(&checker, "A");
    let b = mutex(&checker, "B");
    let (wa, wb) = (a.witness().expect("A"), b.witness().expect("B"));
    checker.inner.matrix.corrupt(wa, wb, RelationFlags::ANCESTOR);

    let mut owner = checker.new_owner("t");
    assert!(in_order(&checker, &mut owner, &a, &b).is_clean());
    assert!(matches!(
        checker.state(),
        CheckerState::Disabled(DisableReason::GraphContradiction(Contradiction::Asymmetric { .. }))
    ));
    assert_eq!(sink.count("graph contradiction"), 1);
    assert!(in_order(&checker, &mut owner, &b, &a).is_clean());
}

#[test]
fn suspended_checker_keeps_bookkeeping_only() {
    let (checker, sink) = checker();
    let a = mutex(&checker, "A");
    let b = mutex(&checker, "B");
    let mut owner = checker.new_owner("t");
    in_order(&checker, &mut owner, &a, &b);

    assert!(checker.set_mode(CheckMode::Suspended));
    assert_eq!(checker.state(), CheckerState::Suspended);
    take(&checker, &mut owner, &b, 10);
    assert!(take(&checker, &mut owner, &a, 11).is_clean());
    assert_eq!(owner.held_count(), 2);
    drop_lock(&checker, &mut owner, &a, 12);
    drop_lock(&checker, &mut owner, &b, 13);
    assert!(!sink.contains("reversal"));

    assert!(checker.set_mode(CheckMode::Enabled));
    assert!(!in_order(&checker, &mut owner, &b, &a).is_clean());

    assert!(checker.set_mode(CheckMode::Off));
    assert_eq!(checker.state(), CheckerState::Disabled(DisableReason::Operator));
    assert!(!checker.set_mode(CheckMode::Enabled));
}

#[test]
fn enrollment_validates_names_and_classes() {
    let (checker, _sink) = checker();
    mutex(&checker, "q");
    let err = checker
        .init("q", &SPIN_MUTEX, LockFlags::empty())
        .expect_err("class change");
    assert!(matches!(
        err,
        UsageError::ClassMismatch {
            existing: "sleep mutex",
            requested: "spin mutex",
            ..
        }
    ));
    assert_eq!(checker.enroll("", &SLEEP_MUTEX), Err(UsageError::EmptyName));
    let long = "x".repeat(MAX_NAME_LEN + 1);
    assert!(matches!(
        checker.enroll(&long, &SLEEP_MUTEX),
        Err(UsageError::NameTooLong { .. })
    ));
}

#[test]
fn destroy_makes_witness_dormant() {
    let (checker, _sink) = checker();
    let x = mutex(&checker, "x");
    let mut owner = checker.new_owner("t");
    take(&checker, &mut owner, &x, 1);
    drop_lock(&checker, &mut owner, &x, 2);
    checker.destroy(&x);

    let info = checker.witness_by_name("x").expect("slot is kept");
    assert_eq!(info.refcount, 0);
    assert_eq!(info.last_acquired, None);

    let again = mutex(&checker, "x");
    assert_eq!(again.witness(), x.witness());
}

#[test]
fn skip_spin_leaves_spin_locks_untracked() {
    let (checker, _sink) = checker_with(WitnessConfig {
        skip_spin: true,
        ..WitnessConfig::small()
    });
    let spin = checker.init("sched lock", &SPIN_MUTEX, LockFlags::empty()).expect("spin");
    assert!(spin.witness().is_none());
    let mut owner = checker.new_owner("t");
    take(&checker, &mut owner, &spin, 1);
    assert!(!owner.holds_any());
}

// ── Dumps ───────────────────────────────────────────────────

#[test]
fn dumps_describe_graph() {
    let (checker, _sink) = checker_with(WitnessConfig {
        order_hints: vec![OrderHint {
            class: "sleep mutex".to_owned(),
            names: vec!["idle".to_owned()],
        }],
        ..WitnessConfig::small()
    });
    let a = mutex(&checker, "A");
    let b = mutex(&checker, "B");
    let mut owner = checker.new_owner("t");
    in_order(&checker, &mut owner, &a, &b);

    let dot = checker.full_graph();
    assert!(dot.starts_with("digraph witness {\n"));
    assert!(dot.contains("  \"A\" -> \"B\";\n"));

    let tree = checker.display_tree();
    assert!(tree.starts_with("Sleep locks:\nA (type: sleep mutex, depth: 0) -- last acquired @ tests.rs:1\n"));
    assert!(tree.contains(" B (type: sleep mutex, depth: 1) -- last acquired @ tests.rs:2\n"));
    assert!(tree.contains("Locks which were never acquired:\nidle (type: sleep mutex, depth: 0)\n"));

    in_order(&checker, &mut owner, &b, &a);
    let stacks = checker.bad_stacks();
    assert!(stacks.starts_with("Number of known direct relationships is 2\n"));
    assert!(stacks.contains("*** Lock order reversal between \"A\"(sleep mutex) and \"B\"(sleep mutex)!"));
    assert!(stacks.contains("Lock order \"B\"(sleep mutex) -> \"A\"(sleep mutex) first seen at:"));

    let snapshot = checker.snapshot();
    assert_eq!(snapshot.state, "active");
    assert_eq!(snapshot.witnesses.len(), 3);
    assert_eq!(snapshot.edges.len(), 1);
    assert_eq!(snapshot.edges[0].parent, "A");
    assert_eq!(snapshot.reversals.len(), 1);
    assert_eq!(snapshot.generation, checker.generation());
}

#[test]
fn bad_stacks_restarts_when_graph_changes() {
    let stacks = Arc::new(HookedStacks::default());
    let checker = OrderChecker::new(WitnessConfig::small(), Arc::new(MemorySink::new()), stacks.clone());
    let a = mutex(&checker, "A");
    let b = mutex(&checker, "B");
    let c = mutex(&checker, "C");
    let d = mutex(&checker, "D");
    let mut owner = checker.new_owner("t");
    in_order(&checker, &mut owner, &a, &b);
    in_order(&checker, &mut owner, &b, &a);

    let late = checker.clone();
    *stacks.hook.lock() = Some(Box::new(move || {
        let mut other = late.new_owner("late");
        in_order(&late, &mut other, &c, &d);
        in_order(&late, &mut other, &d, &c);
    }));
    let renders = stacks.renders.load(Ordering::Relaxed);
    let generation = checker.generation();

    let out = checker.bad_stacks();
    assert!(checker.generation() > generation);
    // A/B twice, two more for the report raised inside the hook, then both
    // pairs on the second pass.
    assert_eq!(stacks.renders.load(Ordering::Relaxed) - renders, 8);
    assert!(out.starts_with("Number of known direct relationships is 4\n"));
    assert!(out.contains("*** Lock order reversal between \"A\"(sleep mutex) and \"B\"(sleep mutex)!"));
    assert!(out.contains("*** Lock order reversal between \"C\"(sleep mutex) and \"D\"(sleep mutex)!"));
    assert_eq!(out.matches("*** Lock order reversal").count(), 2);
    assert_eq!(out, checker.bad_stacks());
}

#[test]
fn repeated_subtree_is_marked() {
    let (checker, _sink) = checker();
    let a = mutex(&checker, "A");
    let b = mutex(&checker, "B");
    let c = mutex(&checker, "C");
    let mut owner = checker.new_owner("t");
    in_order(&checker, &mut owner, &a, &c);
    in_order(&checker, &mut owner, &b, &c);
    let tree = checker.display_tree();
    assert!(tree.contains(" C (type: sleep mutex, depth: 1) -- last acquired"));
    assert!(tree.contains(" C (type: sleep mutex, depth: 1) -- (already displayed)\n"));
}
