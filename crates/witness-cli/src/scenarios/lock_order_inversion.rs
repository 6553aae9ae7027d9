use std::sync::Arc;
use witness_sync::Mutex;

use super::on_thread;

/// Two threads take the same pair of mutexes in opposite orders, one after
/// the other, so the inversion is caught without ever deadlocking.
pub fn run() -> Result<(), String> {
    let left = Arc::new(Mutex::new("demo.shared.left", ()));
    let right = Arc::new(Mutex::new("demo.shared.right", ()));

    let (first, second) = (Arc::clone(&left), Arc::clone(&right));
    on_thread("worker.alpha", move || {
        let _first = first.lock();
        let _second = second.lock();
        println!("worker.alpha took demo.shared.left then demo.shared.right");
    })?;

    let (first, second) = (Arc::clone(&right), Arc::clone(&left));
    on_thread("worker.beta", move || {
        let _first = first.lock();
        let _second = second.lock();
        println!("worker.beta took demo.shared.right then demo.shared.left");
    })?;
    Ok(())
}
