//! C6: the per-layer collection of [`WorkerReference`]s.
//!
//! A `generational_arena::Arena` plus a stable `Index`-based id, the same shape used
//! elsewhere in this crate for entity ids -- here the arena holds connected workers instead
//! of entities, and [`WorkerId`] (`src/worker.rs`) is the stable handle into it. A [`Bridge`]
//! is created lazily per layer on first successful authentication; [`BridgeSet`] is the
//! `Vec<Option<Bridge>>` the orchestrator indexes by layer.

use std::net::SocketAddr;

use generational_arena::Arena;

use crate::worker::{WorkerId, WorkerReference};

/// All [`WorkerReference`]s belonging to one layer.
#[derive(Default)]
pub struct Bridge {
    workers: Arena<WorkerReference>,
}

impl Bridge {
    pub fn new() -> Self {
        Self { workers: Arena::new() }
    }

    pub fn insert(&mut self, reference: WorkerReference) -> WorkerId {
        WorkerId(self.workers.insert(reference))
    }

    pub fn remove(&mut self, id: WorkerId) -> Option<WorkerReference> {
        self.workers.remove(id.0)
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerReference> {
        self.workers.get(id.0)
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut WorkerReference> {
        self.workers.get_mut(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (WorkerId, &WorkerReference)> {
        self.workers.iter().map(|(idx, w)| (WorkerId(idx), w))
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<WorkerId> {
        self.workers.iter().find(|(_, w)| w.addr == addr).map(|(idx, _)| WorkerId(idx))
    }
}

/// One [`Bridge`] slot per configured layer, populated lazily.
pub struct BridgeSet {
    bridges: Vec<Option<Bridge>>,
}

impl BridgeSet {
    pub fn new(layer_count: usize) -> Self {
        Self { bridges: (0..layer_count).map(|_| None).collect() }
    }

    /// Returns the bridge for `layer_index`, creating it on first use.
    pub fn bridge_mut(&mut self, layer_index: usize) -> &mut Bridge {
        self.bridges[layer_index].get_or_insert_with(Bridge::new)
    }

    pub fn bridge(&self, layer_index: usize) -> Option<&Bridge> {
        self.bridges.get(layer_index).and_then(|b| b.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Bridge)> {
        self.bridges.iter().enumerate().filter_map(|(idx, b)| b.as_ref().map(|b| (idx, b)))
    }

    /// Finds which (layer, worker) a peer address belongs to, across every bridge.
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<(usize, WorkerId)> {
        self.iter().find_map(|(layer_index, bridge)| bridge.find_by_addr(addr).map(|w| (layer_index, w)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{TrafficCounters, WorkerKind};
    use std::time::Instant;

    fn reference(addr: SocketAddr) -> WorkerReference {
        WorkerReference {
            layer_id: 1,
            client_hash: 42,
            kind: WorkerKind::Server,
            addr,
            traffic: TrafficCounters::default(),
            connected_at: Instant::now(),
        }
    }

    #[test]
    fn bridges_created_lazily_per_layer() {
        let mut set = BridgeSet::new(3);
        assert!(set.bridge(0).is_none());
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let id = set.bridge_mut(0).insert(reference(addr));
        assert!(set.bridge(0).is_some());
        assert_eq!(set.find_by_addr(addr), Some((0, id)));
    }

    #[test]
    fn remove_frees_the_slot() {
        let mut set = BridgeSet::new(1);
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let id = set.bridge_mut(0).insert(reference(addr));
        assert!(set.bridge_mut(0).remove(id).is_some());
        assert!(set.bridge(0).unwrap().is_empty());
    }
}
