//! Barriers hosted by one node, keyed by barrier id.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::ClusterBarrier;

#[derive(Default)]
struct RegistryState {
    barriers: HashMap<String, Arc<ClusterBarrier>>,
    closed: bool,
}

/// Named barriers with creation notification
#[derive(Default)]
pub struct BarrierRegistry {
    state: Mutex<RegistryState>,
    created: Condvar,
}

impl BarrierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a barrier. Returns false if the id is already taken.
    pub fn create(
        &self,
        barrier_id: &str,
        participants: &BTreeMap<String, BTreeSet<String>>,
        timeout: Duration,
    ) -> bool {
        self.insert(Arc::new(ClusterBarrier::new(barrier_id, participants, timeout)))
    }

    /// Register a prebuilt barrier. Returns false if the id is already taken.
    pub fn insert(&self, barrier: Arc<ClusterBarrier>) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.barriers.contains_key(barrier.id()) {
            return false;
        }

        tracing::debug!("Barrier '{}' created", barrier.id());
        state.barriers.insert(barrier.id().to_string(), barrier);
        self.created.notify_all();
        true
    }

    pub fn get(&self, barrier_id: &str) -> Option<Arc<ClusterBarrier>> {
        self.state.lock().barriers.get(barrier_id).cloned()
    }

    pub fn is_available(&self, barrier_id: &str) -> bool {
        self.state
            .lock()
            .barriers
            .get(barrier_id)
            .map(|barrier| barrier.is_active())
            .unwrap_or(false)
    }

    /// Block until the barrier exists. Returns false if the registry was
    /// closed or the timeout expired first.
    pub fn wait_until_created(&self, barrier_id: &str, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        let deadline = std::time::Instant::now() + timeout;

        loop {
            if state.barriers.contains_key(barrier_id) {
                return true;
            }
            if state.closed {
                return false;
            }
            if self.created.wait_until(&mut state, deadline).timed_out() {
                return state.barriers.contains_key(barrier_id);
            }
        }
    }

    /// Remove and deactivate a barrier
    pub fn release(&self, barrier_id: &str) -> bool {
        let barrier = self.state.lock().barriers.remove(barrier_id);
        match barrier {
            Some(barrier) => {
                barrier.deactivate();
                tracing::debug!("Barrier '{}' released", barrier_id);
                true
            }
            None => false,
        }
    }

    /// Remove a node's callers from every barrier
    pub fn remove_node(&self, node_id: &str) {
        let barriers: Vec<Arc<ClusterBarrier>> =
            self.state.lock().barriers.values().cloned().collect();
        for barrier in barriers {
            barrier.remove_node(node_id);
        }
    }

    /// Deactivate everything and refuse new barriers
    pub fn deactivate_all(&self) {
        let barriers: Vec<Arc<ClusterBarrier>> = {
            let mut state = self.state.lock();
            state.closed = true;
            self.created.notify_all();
            state.barriers.drain().map(|(_, barrier)| barrier).collect()
        };

        for barrier in barriers {
            barrier.deactivate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn participants() -> BTreeMap<String, BTreeSet<String>> {
        BTreeMap::from([("node-a".to_string(), BTreeSet::from(["node-a".to_string()]))])
    }

    #[test]
    fn test_create_and_release() {
        let registry = BarrierRegistry::new();
        assert!(registry.create("sync", &participants(), Duration::from_secs(1)));
        assert!(!registry.create("sync", &participants(), Duration::from_secs(1)));
        assert!(registry.is_available("sync"));

        assert!(registry.release("sync"));
        assert!(!registry.is_available("sync"));
        assert!(!registry.release("sync"));
    }

    #[test]
    fn test_wait_until_created() {
        let registry = Arc::new(BarrierRegistry::new());

        let waiter = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.wait_until_created("late", Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(30));
        registry.create("late", &participants(), Duration::from_secs(1));
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_close_wakes_creation_waiters() {
        let registry = Arc::new(BarrierRegistry::new());

        let waiter = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.wait_until_created("never", Duration::from_secs(10)))
        };

        thread::sleep(Duration::from_millis(30));
        registry.deactivate_all();
        assert!(!waiter.join().unwrap());
        assert!(!registry.create("never", &participants(), Duration::from_secs(1)));
    }
}
