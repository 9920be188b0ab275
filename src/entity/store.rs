use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;

use crate::entity::record::EntityRecord;
use crate::entity::EntityId;
use crate::error::OpOutcome;
use crate::mask::ComponentId;
use crate::worker::WorkerId;

/// Components an entity is created with, as sent in `RuntimeAddEntity`.
#[derive(Debug, Clone, Default)]
pub struct AddEntityPayload {
    pub components: Vec<(ComponentId, Vec<u8>)>,
}

/// Outcome of [`EntityStore::update_component`], distinguishing "dropped because stale"
/// from "dropped because preconditions weren't met" so the orchestrator can log each at the
/// right level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateComponentResult {
    Applied { position_changed: bool },
    NotFound,
    ComponentNotPresent,
}

/// C3: the authoritative `EntityId -> Entity` map.
#[derive(Default)]
pub struct EntityStore {
    next_id: AtomicU64,
    entities: AHashMap<EntityId, EntityRecord>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `reserve_ids(n)`: returns a half-open range `[begin, begin+n)` that no other
    /// reservation will ever return. `Ordering::Relaxed` is enough since the
    /// whole store is only ever mutated from the main tick thread; this is an
    /// atomic purely so `reserve_ids` can take `&self` rather than `&mut self` and be
    /// called from a request handler that only has shared access to the store.
    pub fn reserve_ids(&self, n: u64) -> Option<Range<u64>> {
        if n == 0 {
            return None;
        }
        let begin = self.next_id.fetch_add(n, Ordering::Relaxed);
        Some(begin..begin + n)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn get(&self, id: EntityId) -> Option<&EntityRecord> {
        self.entities.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut EntityRecord> {
        self.entities.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &EntityRecord)> {
        self.entities.iter().map(|(&id, e)| (id, e))
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `add_entity(w, id, payload)`: fails if `id` already exists.
    pub fn add_entity(&mut self, id: EntityId, payload: AddEntityPayload) -> OpOutcome {
        if self.entities.contains_key(&id) {
            return OpOutcome::PreconditionFailed;
        }
        let mut record = EntityRecord::new();
        for (cid, bytes) in payload.components {
            record.set_component(cid, bytes);
        }
        self.entities.insert(id, record);
        OpOutcome::Applied
    }

    /// `remove_entity(w, id)`. Cell membership/layer counts are the caller's (world
    /// controller's) responsibility to update before or after this call; see
    /// [`crate::orchestrator::Runtime`] for the ordering.
    pub fn remove_entity(&mut self, id: EntityId) -> Option<EntityRecord> {
        self.entities.remove(&id)
    }

    /// `add_component(w, id, cid, p)`: preconditions "entity exists; mask[cid]==false".
    pub fn add_component(&mut self, id: EntityId, cid: ComponentId, payload: Vec<u8>) -> OpOutcome {
        let Some(record) = self.get_mut(id) else {
            return OpOutcome::PreconditionFailed;
        };
        if record.has_component(cid) {
            return OpOutcome::PreconditionFailed;
        }
        record.set_component(cid, payload);
        OpOutcome::Applied
    }

    /// `remove_component(w, id, cid)`: preconditions "entity exists; mask[cid]==true".
    pub fn remove_component(&mut self, id: EntityId, cid: ComponentId) -> OpOutcome {
        let Some(record) = self.get_mut(id) else {
            return OpOutcome::PreconditionFailed;
        };
        if !record.has_component(cid) {
            return OpOutcome::PreconditionFailed;
        }
        record.clear_component(cid);
        OpOutcome::Applied
    }

    /// `update_component(w, id, cid, p, pos?)`.
    ///
    /// The authority check ("is the caller authoritative for `(id, layer_of(cid))`") is
    /// performed by the caller (the orchestrator, which can see both this store and the
    /// world controller's current owner map); by the time this is called the update has
    /// already been authorized, so this only checks the store-local preconditions.
    pub fn update_component(
        &mut self,
        id: EntityId,
        cid: ComponentId,
        payload: Vec<u8>,
        new_pos: Option<(i32, i32)>,
        position_worker: Option<WorkerId>,
    ) -> UpdateComponentResult {
        let Some(record) = self.get_mut(id) else {
            return UpdateComponentResult::NotFound;
        };
        if !record.has_component(cid) {
            return UpdateComponentResult::ComponentNotPresent;
        }
        record.set_component(cid, payload);
        let position_changed = if let Some(pos) = new_pos {
            let changed = pos != record.position;
            record.position = pos;
            if let Some(w) = position_worker {
                record.position_worker = Some(w);
            }
            changed
        } else {
            false
        };
        UpdateComponentResult::Applied { position_changed }
    }

    pub fn set_cell_ref(&mut self, id: EntityId, cell: Option<crate::world::cell::CellCoord>) {
        if let Some(record) = self.get_mut(id) {
            record.cell_ref = cell;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_ids_never_overlaps() {
        let store = EntityStore::new();
        let a = store.reserve_ids(10).unwrap();
        let b = store.reserve_ids(5).unwrap();
        assert_eq!(a, 0..10);
        assert_eq!(b, 10..15);
    }

    #[test]
    fn add_entity_fails_if_id_exists() {
        let mut store = EntityStore::new();
        let id = EntityId(1);
        assert_eq!(store.add_entity(id, AddEntityPayload::default()), OpOutcome::Applied);
        assert_eq!(
            store.add_entity(id, AddEntityPayload::default()),
            OpOutcome::PreconditionFailed
        );
    }

    #[test]
    fn mask_and_payload_stay_in_lockstep() {
        let mut store = EntityStore::new();
        let id = EntityId(1);
        store.add_entity(id, AddEntityPayload::default());
        assert_eq!(store.add_component(id, 3, vec![1, 2, 3]), OpOutcome::Applied);
        let record = store.get(id).unwrap();
        assert!(record.has_component(3));
        assert_eq!(record.payload(3), Some(&[1u8, 2, 3][..]));

        assert_eq!(store.remove_component(id, 3), OpOutcome::Applied);
        let record = store.get(id).unwrap();
        assert!(!record.has_component(3));
        assert_eq!(record.payload(3), None);
    }

    #[test]
    fn update_component_requires_presence() {
        let mut store = EntityStore::new();
        let id = EntityId(1);
        store.add_entity(id, AddEntityPayload::default());
        let result = store.update_component(id, 0, vec![9], None, None);
        assert_eq!(result, UpdateComponentResult::ComponentNotPresent);
    }

    #[test]
    fn removed_entity_is_invisible_to_lookups() {
        let mut store = EntityStore::new();
        let id = EntityId(1);
        store.add_entity(id, AddEntityPayload::default());
        store.remove_entity(id);
        assert!(!store.contains(id));
        assert!(store.get(id).is_none());
    }
}
