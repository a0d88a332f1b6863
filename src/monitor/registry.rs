use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;
use crate::conduit::Conduit;

/// The set of live conduits. Conduits register themselves when they are created and deregister
///  when they are closed.
#[derive(Default)]
pub struct ConduitRegistry {
    next_id: AtomicU64,
    conduits: Mutex<Vec<Arc<Conduit>>>,
}

impl ConduitRegistry {
    pub fn new() -> Arc<ConduitRegistry> {
        Default::default()
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, conduit: Arc<Conduit>) {
        debug!("registering conduit #{}", conduit.id());
        self.conduits.lock().unwrap().push(conduit);
    }

    /// returns `true` if the conduit was registered
    pub(crate) fn deregister(&self, conduit_id: u64) -> bool {
        let mut conduits = self.conduits.lock().unwrap();
        let len_before = conduits.len();
        conduits.retain(|c| c.id() != conduit_id);

        let removed = conduits.len() < len_before;
        if removed {
            debug!("deregistered conduit #{}", conduit_id);
        }
        removed
    }

    /// The conduit at a given position. Positions shift when conduits are deregistered, which
    ///  is fine for round robin scanning.
    pub fn get(&self, index: usize) -> Option<Arc<Conduit>> {
        self.conduits.lock().unwrap().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.conduits.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<Conduit>> {
        self.conduits.lock().unwrap().clone()
    }

    pub fn close_all(&self) {
        // closing deregisters, so the lock must not be held
        for conduit in self.snapshot() {
            conduit.close();
        }
    }
}
