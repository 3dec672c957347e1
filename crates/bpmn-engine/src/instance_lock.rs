use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bpmn_types::InstanceId;

/// Per-instance advisory locks (§5 "per-instance advisory lock"): two
/// tokens belonging to the same instance never mutate its variables or
/// join-state concurrently, while unrelated instances proceed fully in
/// parallel across the worker pool.
///
/// Lock Audit: `locks` is held only long enough to get-or-insert an
/// instance's `Arc<Mutex<()>>` entry, never across the dispatch work the
/// per-instance mutex itself guards.
#[derive(Default)]
pub struct InstanceLocks {
    locks: Mutex<HashMap<InstanceId, Arc<Mutex<()>>>>,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, instance_id: &InstanceId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("instance lock registry poisoned");
        locks.entry(instance_id.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Run `f` while holding `instance_id`'s advisory lock.
    pub fn with_lock<T>(&self, instance_id: &InstanceId, f: impl FnOnce() -> T) -> T {
        let handle = self.handle(instance_id);
        let _guard = handle.lock().expect("per-instance advisory lock poisoned");
        f()
    }

    /// Drop the registry entry for a terminated instance so the map
    /// doesn't grow without bound over a long-running engine's lifetime.
    pub fn forget(&self, instance_id: &InstanceId) {
        let mut locks = self.locks.lock().expect("instance lock registry poisoned");
        locks.remove(instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn same_instance_serializes_concurrent_access() {
        let locks = Arc::new(InstanceLocks::new());
        let instance_id = InstanceId::generate();
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let instance_id = instance_id.clone();
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    locks.with_lock(&instance_id, || {
                        let before = counter.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(before, 0, "overlapping access to the same instance");
                        counter.fetch_sub(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn forget_drops_the_registry_entry() {
        let locks = InstanceLocks::new();
        let instance_id = InstanceId::generate();
        locks.with_lock(&instance_id, || {});
        assert_eq!(locks.locks.lock().unwrap().len(), 1);
        locks.forget(&instance_id);
        assert_eq!(locks.locks.lock().unwrap().len(), 0);
    }
}
