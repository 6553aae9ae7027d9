pub mod duplicate_type;
pub mod interlock_handoff;
pub mod lock_order_inversion;
pub mod recursion;

/// Run `f` on a named thread and wait for it, so every step gets its own
/// lock owner and leaves it behind when the thread exits.
pub(crate) fn on_thread<F>(name: &str, f: F) -> Result<(), String>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(f)
        .map_err(|e| format!("spawn {name}: {e}"))?
        .join()
        .map_err(|_| format!("thread {name} panicked"))
}
