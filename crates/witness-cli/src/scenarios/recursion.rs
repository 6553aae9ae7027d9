use witness_sync::{held_locks, RecursiveMutex, RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};

use super::on_thread;

/// Recursive holds count once and unwind to nothing.
pub fn run() -> Result<(), String> {
    on_thread("worker.recursion", || {
        let giant = RecursiveMutex::new("demo.giant", ());
        let outer = giant.lock();
        let middle = giant.lock();
        let inner = giant.lock();
        giant.assert_recursed();
        print_held("giant taken three times");
        drop((inner, middle, outer));

        let tree = RwLock::new("demo.tree", 0u32);
        let a = tree.read();
        let b = tree.read();
        print_held("tree read twice");
        drop((b, a));

        let upgradable = tree.upgradable_read();
        let mut write = RwLockUpgradableReadGuard::upgrade(upgradable);
        *write += 1;
        print_held("tree upgraded");
        let read = RwLockWriteGuard::downgrade(write);
        print_held("tree downgraded");
        drop(read);
        print_held("all released");
    })
}

fn print_held(step: &str) {
    println!("{step}:");
    for line in held_locks() {
        println!("  {line}");
    }
}
