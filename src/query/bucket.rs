//! One frequency bucket of installed query subscriptions, plus its outdated-slot free list.
//!
//! The frequency-bucket arrays use a mutex only for free-list push/pop (a short critical
//! section); the per-slot outdated flag is set without a lock and read by the main thread on
//! the next tick. A dense backing `Vec` with a side free list, the same storage split used
//! elsewhere in this crate for slab-like collections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::entity::EntityId;
use crate::mask::ComponentId;

/// `(entity_id, component_id, query_version)`.
#[derive(Debug, Clone, Copy)]
pub struct EntityQueryEntry {
    pub entity: EntityId,
    pub component: ComponentId,
    pub query_version: u64,
}

struct Slot {
    entry: EntityQueryEntry,
    /// Set without a lock (from the parallel evaluation phase); read by the main thread on
    /// the next tick's reap pass. Never read concurrently with its own write in the same
    /// phase, so `Relaxed` is enough.
    outdated: AtomicBool,
}

/// Subscriptions re-evaluated at `hz` times per second.
pub struct FrequencyBucket {
    hz: u32,
    slots: Vec<Option<Slot>>,
    free_list: Mutex<Vec<usize>>,
    prev_tick_index: u64,
}

impl FrequencyBucket {
    pub fn new(hz: u32) -> Self {
        Self {
            hz,
            slots: Vec::new(),
            free_list: Mutex::new(Vec::new()),
            prev_tick_index: 0,
        }
    }

    pub fn period_ms(&self) -> u64 {
        1000 / self.hz as u64
    }

    /// Fires once per elapsed period boundary: `floor(elapsed/P) > floor(prev_elapsed/P)`.
    pub fn should_fire(&mut self, elapsed_ms: u64) -> bool {
        let period = self.period_ms().max(1);
        let tick_index = elapsed_ms / period;
        let fires = tick_index > self.prev_tick_index;
        self.prev_tick_index = tick_index;
        fires
    }

    /// Installs an entry, preferring a free-listed slot (left behind by reaping an outdated
    /// entry) over growing the backing `Vec`.
    pub fn insert(&mut self, entry: EntityQueryEntry) -> usize {
        let reused = self.free_list.lock().expect("bucket free-list mutex poisoned").pop();
        if let Some(idx) = reused {
            self.slots[idx] = Some(Slot { entry, outdated: AtomicBool::new(false) });
            return idx;
        }
        self.slots.push(Some(Slot { entry, outdated: AtomicBool::new(false) }));
        self.slots.len() - 1
    }

    pub fn mark_outdated(&self, idx: usize) {
        if let Some(Some(slot)) = self.slots.get(idx) {
            slot.outdated.store(true, Ordering::Relaxed);
        }
    }

    /// Clears every slot marked outdated since the last reap, returning its index to the free
    /// list for the next `insert` to prefer.
    pub fn reap_outdated(&mut self) {
        let mut free = self.free_list.lock().expect("bucket free-list mutex poisoned");
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            let is_outdated = slot.as_ref().map(|s| s.outdated.load(Ordering::Relaxed)).unwrap_or(false);
            if is_outdated {
                *slot = None;
                free.push(idx);
            }
        }
    }

    pub fn live_entries(&self) -> impl Iterator<Item = (usize, EntityQueryEntry)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().filter(|s| !s.outdated.load(Ordering::Relaxed)).map(|s| (idx, s.entry)))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
