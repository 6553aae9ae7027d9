use witness_sync::{LockFlags, Mutex};

use super::on_thread;

/// Two locks of one type held together, with and without DUPOK.
pub fn run() -> Result<(), String> {
    on_thread("worker.rename", || {
        let from = Mutex::typed("vnode /tmp/a", "demo.vnode", LockFlags::empty(), ());
        let to = Mutex::typed("vnode /tmp/b", "demo.vnode", LockFlags::empty(), ());
        let _from = from.lock();
        let _to = to.lock();
        println!("worker.rename holds two demo.vnode locks");
    })?;

    on_thread("worker.bufobj", || {
        let a = Mutex::typed("bufobj 1", "demo.bufobj", LockFlags::DUPOK, ());
        let b = Mutex::typed("bufobj 2", "demo.bufobj", LockFlags::DUPOK, ());
        let _a = a.lock();
        let _b = b.lock();
        println!("worker.bufobj holds two demo.bufobj locks, marked DUPOK");
    })
}
