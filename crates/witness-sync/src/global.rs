use std::cell::RefCell;
use std::sync::{Arc, OnceLock};
use tracing::debug;
use witness::{LockOwner, NoStacks, OrderChecker, TracingSink, UsageError, WarnFlags, WitnessConfig};

static CHECKER: OnceLock<OrderChecker> = OnceLock::new();

thread_local! {
    static OWNER: RefCell<Option<LockOwner>> = const { RefCell::new(None) };
}

/// Make `checker` the process-wide default.
///
/// Must happen before the first lock is created; afterwards the default is
/// fixed and `checker` is handed back.
pub fn install(checker: OrderChecker) -> Result<(), OrderChecker> {
    CHECKER.set(checker)
}

/// The process-wide checker, created with [`WitnessConfig::default`] and a
/// [`TracingSink`] on first use if none was installed.
pub fn checker() -> &'static OrderChecker {
    CHECKER.get_or_init(|| {
        debug!("installing default lock-order checker");
        OrderChecker::new(WitnessConfig::default(), Arc::new(TracingSink), Arc::new(NoStacks))
    })
}

fn owner_name() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => name.to_owned(),
        None => format!("{:?}", thread.id()),
    }
}

/// Run `f` against this thread's owner, creating it on first use.
///
/// `None` while the thread is being torn down or if the owner is already
/// borrowed further up the stack.
pub(crate) fn with_owner<R>(f: impl FnOnce(&OrderChecker, &mut LockOwner) -> R) -> Option<R> {
    let checker = checker();
    OWNER
        .try_with(|slot| {
            let mut slot = slot.try_borrow_mut().ok()?;
            let owner = slot.get_or_insert_with(|| checker.new_owner(&owner_name()));
            Some(f(checker, owner))
        })
        .ok()
        .flatten()
}

/// Misuse of a lock is fatal.
pub(crate) fn fatal<T>(result: Option<Result<T, UsageError>>) -> Option<T> {
    match result {
        Some(Ok(value)) => Some(value),
        Some(Err(err)) => panic!("witness: {err}"),
        None => None,
    }
}

/// Locks this thread holds, most recent first.
pub fn held_locks() -> Vec<String> {
    with_owner(|checker, owner| checker.list_locks(owner)).unwrap_or_default()
}

/// Report the locks this thread holds ahead of an operation that may
/// block. Returns how many were reported.
pub fn warn_held(flags: WarnFlags, message: &str) -> usize {
    with_owner(|checker, owner| checker.warn(owner, flags, None, message)).unwrap_or(0)
}
