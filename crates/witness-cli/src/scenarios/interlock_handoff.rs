use witness_sync::Mutex;

use super::on_thread;

/// An item is normally locked before its list; a lookup walks the list and
/// hands the list lock off for the item's, which is not a reversal.
pub fn run() -> Result<(), String> {
    on_thread("worker.handoff", || {
        let list = Mutex::new("demo.list", Vec::from([1, 2, 3]));
        let item = Mutex::new("demo.item", 0);
        {
            let mut value = item.lock();
            let items = list.lock();
            *value = items.len();
        }

        let items = list.lock();
        let found = items.iter().any(|value| *value == 2);
        let value = item.lock_handoff(items);
        println!("worker.handoff found={found} item={}", *value);
    })
}
