//! Per-layer worker bookkeeping: which workers own how many entities, ordered so the
//! least-loaded worker can be found in `O(log n)`.
//!
//! A side `BTreeSet` keyed by `(entity_count, worker_id)` over the arena contents gives an
//! ordered view without re-sorting; re-keying on every density change is just a remove of the
//! old tuple followed by an insert of the new one.

use std::collections::BTreeSet;

use ahash::AHashMap;

use crate::world::cell::CellCoord;
use crate::worker::WorkerId;

/// A worker's ordinal within its layer's density ordering, for tie-breaking
/// `(entity_count, ordinal)` tuples deterministically. Derived from the `generational_arena`
/// index so it stays stable across insertions/removals elsewhere in the arena.
fn order_key(id: WorkerId) -> (u64, u64) {
    let (index, generation) = id.0.into_raw_parts();
    (index as u64, generation as u64)
}

#[derive(Debug, Clone, Default)]
pub struct WorkerCellsInfo {
    pub entity_count: u32,
    pub coordinates_owned: Vec<CellCoord>,
}

impl WorkerCellsInfo {
    fn contains(&self, cell: CellCoord) -> bool {
        self.coordinates_owned.contains(&cell)
    }

    fn add_cell(&mut self, cell: CellCoord) {
        self.coordinates_owned.push(cell);
    }

    fn remove_cell(&mut self, cell: CellCoord) {
        self.coordinates_owned.retain(|&c| c != cell);
    }
}

/// Per-layer worker registry plus the ordered density index used to pick the least-loaded
/// worker (the front of the index) and to test rebalance-target eligibility.
#[derive(Debug, Clone, Default)]
pub struct LayerState {
    pub workers: AHashMap<WorkerId, WorkerCellsInfo>,
    /// `(entity_count, order_key(worker))`, ascending -- first element is least loaded.
    density_index: BTreeSet<(u32, (u64, u64))>,
}

impl LayerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_worker(&mut self, id: WorkerId) {
        self.workers.entry(id).or_default();
        self.density_index.insert((0, order_key(id)));
    }

    pub fn unregister_worker(&mut self, id: WorkerId) -> Option<WorkerCellsInfo> {
        let info = self.workers.remove(&id)?;
        self.density_index.remove(&(info.entity_count, order_key(id)));
        Some(info)
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerCellsInfo> {
        self.workers.get(&id)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// The worker at the front of the density index -- the least loaded in this layer.
    pub fn least_loaded(&self) -> Option<WorkerId> {
        self.density_index.iter().next().and_then(|&(_, key)| self.worker_for_key(key))
    }

    fn worker_for_key(&self, key: (u64, u64)) -> Option<WorkerId> {
        self.workers.keys().copied().find(|&w| order_key(w) == key)
    }

    /// Assign `cell` to `owner`, bumping its entity count by `delta_entities` and re-keying it
    /// in the density index.
    pub fn assign_cell(&mut self, owner: WorkerId, cell: CellCoord, delta_entities: u32) {
        let Some(info) = self.workers.get_mut(&owner) else {
            return;
        };
        self.density_index.remove(&(info.entity_count, order_key(owner)));
        if !info.contains(cell) {
            info.add_cell(cell);
        }
        info.entity_count += delta_entities;
        self.density_index.insert((info.entity_count, order_key(owner)));
    }

    /// Move `cell` from `from` to `to`, transferring `entity_count` entities' worth of load.
    pub fn transfer_cell(&mut self, from: WorkerId, to: WorkerId, cell: CellCoord, entity_count: u32) {
        if let Some(info) = self.workers.get_mut(&from) {
            self.density_index.remove(&(info.entity_count, order_key(from)));
            info.remove_cell(cell);
            info.entity_count = info.entity_count.saturating_sub(entity_count);
            self.density_index.insert((info.entity_count, order_key(from)));
        }
        self.assign_cell(to, cell, entity_count);
    }

    /// Adjust a worker's entity count without changing cell ownership (e.g. an entity
    /// add/remove inside a cell it already owns).
    pub fn adjust_count(&mut self, owner: WorkerId, delta: i32) {
        let Some(info) = self.workers.get_mut(&owner) else {
            return;
        };
        self.density_index.remove(&(info.entity_count, order_key(owner)));
        info.entity_count = if delta >= 0 {
            info.entity_count.saturating_add(delta as u32)
        } else {
            info.entity_count.saturating_sub((-delta) as u32)
        };
        self.density_index.insert((info.entity_count, order_key(owner)));
    }

    /// Workers ordered from least to most loaded, for the rebalance scan.
    pub fn ascending(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.density_index.iter().filter_map(move |&(_, key)| self.worker_for_key(key))
    }

    /// Workers at or above `threshold` entities, in no particular order, for finding an
    /// `over_limit` worker.
    pub fn over_threshold(&self, threshold: u32) -> impl Iterator<Item = WorkerId> + '_ {
        self.workers
            .iter()
            .filter(move |(_, info)| info.entity_count >= threshold)
            .map(|(&id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use generational_arena::Arena;

    fn fresh_ids(n: usize) -> Vec<WorkerId> {
        let mut arena: Arena<()> = Arena::new();
        (0..n).map(|_| WorkerId(arena.insert(()))).collect()
    }

    #[test]
    fn least_loaded_is_always_front_of_index() {
        let ids = fresh_ids(3);
        let mut layer = LayerState::new();
        for &id in &ids {
            layer.register_worker(id);
        }
        layer.assign_cell(ids[0], CellCoord::new(0, 0), 5);
        layer.assign_cell(ids[1], CellCoord::new(1, 0), 1);
        assert_eq!(layer.least_loaded(), Some(ids[2]));
    }

    #[test]
    fn transfer_moves_load_between_workers() {
        let ids = fresh_ids(2);
        let mut layer = LayerState::new();
        for &id in &ids {
            layer.register_worker(id);
        }
        let cell = CellCoord::new(5, 5);
        layer.assign_cell(ids[0], cell, 20);
        layer.transfer_cell(ids[0], ids[1], cell, 20);
        assert_eq!(layer.get(ids[0]).unwrap().entity_count, 0);
        assert_eq!(layer.get(ids[1]).unwrap().entity_count, 20);
        assert!(!layer.get(ids[0]).unwrap().coordinates_owned.contains(&cell));
        assert!(layer.get(ids[1]).unwrap().coordinates_owned.contains(&cell));
    }
}
