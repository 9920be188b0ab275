use crate::config::LayerId;
use crate::entity::query_slot::ComponentQuerySlot;
use crate::mask::{ComponentId, ComponentMask, MAX_COMPONENTS};
use crate::worker::WorkerId;
use crate::world::cell::CellCoord;

/// The authoritative record for one entity.
///
/// `mask` and `payloads` are kept in lockstep by every mutator in [`super::EntityStore`]
/// (the invariant that `mask[i]` is set iff `payloads[i]` holds live component bytes); nothing outside this
/// module may touch either field.
pub struct EntityRecord {
    mask: ComponentMask,
    payloads: Box<[Vec<u8>; MAX_COMPONENTS]>,
    queries: Box<[ComponentQuerySlot; MAX_COMPONENTS]>,
    pub position: (i32, i32),
    pub cell_ref: Option<CellCoord>,
    pub position_worker: Option<WorkerId>,
}

impl EntityRecord {
    pub(super) fn new() -> Self {
        Self {
            mask: ComponentMask::EMPTY,
            payloads: Box::new(std::array::from_fn(|_| Vec::new())),
            queries: Box::new(std::array::from_fn(|_| ComponentQuerySlot::default())),
            position: (0, 0),
            cell_ref: None,
            position_worker: None,
        }
    }

    pub fn mask(&self) -> ComponentMask {
        self.mask
    }

    pub fn has_component(&self, id: ComponentId) -> bool {
        self.mask.contains(id)
    }

    pub fn payload(&self, id: ComponentId) -> Option<&[u8]> {
        self.mask.contains(id).then(|| self.payloads[id as usize].as_slice())
    }

    pub fn query_slot(&self, id: ComponentId) -> &ComponentQuerySlot {
        &self.queries[id as usize]
    }

    pub fn query_slot_mut(&mut self, id: ComponentId) -> &mut ComponentQuerySlot {
        &mut self.queries[id as usize]
    }

    pub(super) fn set_component(&mut self, id: ComponentId, payload: Vec<u8>) {
        self.mask.set(id);
        self.payloads[id as usize] = payload;
    }

    pub(super) fn clear_component(&mut self, id: ComponentId) {
        self.mask.clear(id);
        self.payloads[id as usize].clear();
    }

    /// Which layers (by id) this entity currently has at least one present component of,
    /// given the `component -> layer` map. Used when emitting `AuthorityLost` on removal
    /// and on cell handoff.
    pub fn present_layers(&self, config: &crate::config::Config) -> Vec<LayerId> {
        let mut layers: Vec<LayerId> = self
            .mask
            .iter()
            .filter_map(|cid| config.layer_of(cid))
            .map(|layer| layer.id)
            .collect();
        layers.sort_unstable();
        layers.dedup();
        layers
    }
}
