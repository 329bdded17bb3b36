//! Per-node lock registry: serializes the read-modify-write of one node's control state
//! while leaving different nodes fully parallel.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Lazily created mutex per node id.
#[derive(Debug, Default)]
pub struct NodeLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NodeLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding `node_id`'s lock.
    ///
    /// The registry mutex is released before waiting on the node lock, so a slow node
    /// never blocks callers for other nodes. The entry is removed again once no other
    /// caller holds or waits on it.
    pub fn with_node<R>(&self, node_id: &str, f: impl FnOnce() -> R) -> R {
        let node_lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(node_id.to_string()).or_default())
        };
        let out = {
            let _guard = node_lock.lock();
            f()
        };

        // New clones are only taken under the registry lock, so a count of two
        // (map + ours) cannot grow while we hold it.
        let mut locks = self.locks.lock();
        if Arc::strong_count(&node_lock) == 2 {
            locks.remove(node_id);
        }
        out
    }

    /// Number of node ids with a registered lock.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn same_node_calls_never_overlap() {
        let locks = Arc::new(NodeLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    for _ in 0..20 {
                        locks.with_node("node-a", || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_inside.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(Duration::from_micros(50));
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_nodes_do_not_block_each_other() {
        let locks = NodeLocks::new();
        let value = locks.with_node("a", || {
            locks.with_node("b", || {
                assert_eq!(locks.len(), 2);
                42
            })
        });
        assert_eq!(value, 42);
        assert!(locks.is_empty());
    }

    #[test]
    fn registry_does_not_grow_with_distinct_nodes() {
        let locks = NodeLocks::new();
        for i in 0..5_000 {
            locks.with_node(&format!("node-{i}"), || ());
            assert!(locks.len() <= 1);
        }
        assert!(locks.is_empty());
    }

    #[test]
    fn entry_kept_while_a_waiter_is_queued() {
        let locks = Arc::new(NodeLocks::new());
        let (entered_tx, entered_rx) = crossbeam_channel::bounded::<()>(0);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

        let holder = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                locks.with_node("busy", || {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                });
            })
        };
        entered_rx.recv().unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || locks.with_node("busy", || 7))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(locks.len(), 1);

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert_eq!(waiter.join().unwrap(), 7);
        assert!(locks.is_empty());
    }
}
