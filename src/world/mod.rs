//! C4: the spatial partitioner (sparse cell grid, per-layer worker ownership, rebalancer).
//!
//! The grid is a slab plus side index pair (see `cell.rs`); the per-layer state follows the
//! same resource-map-of-typed-slots shape, with [`WorldController`] keeping one
//! [`layer::LayerState`] per configured layer, indexed by the layer's dense index rather
//! than a type id.

pub mod cell;
pub mod layer;
pub mod rebalance;

use generational_arena::Arena;
use tracing::warn;

use crate::config::Config;
use crate::entity::{EntityId, EntityStore};
use crate::world::cell::{CellCoord, Grid};
use crate::world::layer::LayerState;
use crate::world::rebalance::{plan_rebalance, ControllerEvent, RebalanceFailureReason};
use crate::worker::WorkerId;

/// Ties the cell grid to per-layer worker ownership and exposes the entity-placement and
/// rebalance operations the orchestrator drives each tick.
pub struct WorldController {
    grid: Grid,
    layers: Vec<LayerState>,
}

impl WorldController {
    pub fn new(config: &Config) -> Self {
        Self {
            grid: Grid::new(config.layer_count()),
            layers: (0..config.layer_count()).map(|_| LayerState::new()).collect(),
        }
    }

    pub fn layer_state(&self, layer_index: usize) -> Option<&LayerState> {
        self.layers.get(layer_index)
    }

    pub fn cell(&self, coord: CellCoord) -> Option<&cell::WorldCell> {
        self.grid.get(coord)
    }

    /// Every existing cell within the inclusive rectangle `[min, max]`, for the interest-query
    /// engine's spatial seeding: box/area/radius nodes each resolve to a range query.
    pub fn cells_in_rect(&self, min: CellCoord, max: CellCoord) -> impl Iterator<Item = &cell::WorldCell> {
        self.grid.cells_in_rect(min, max)
    }

    /// Registers a newly-authenticated worker against its layer's density index, giving it
    /// zero owned cells. Cells flow to it either through cell-initialization (if it becomes
    /// least-loaded) or a future rebalance pass.
    pub fn register_worker(&mut self, layer_index: usize, worker: WorkerId) {
        if let Some(layer) = self.layers.get_mut(layer_index) {
            layer.register_worker(worker);
        }
    }

    /// A worker disconnected or timed out: every cell it owned in `layer_index` has its
    /// `layer_owner` slot nulled and is logged as a warning; the worker's per-layer state is
    /// dropped.
    pub fn unregister_worker(&mut self, config: &Config, layer_index: usize, worker: WorkerId) {
        let Some(layer) = self.layers.get_mut(layer_index) else {
            return;
        };
        let Some(info) = layer.unregister_worker(worker) else {
            return;
        };
        for cell in info.coordinates_owned {
            if let Some(c) = self.grid.get_mut(cell) {
                c.layer_owner[layer_index] = None;
            }
        }
        let layer_id = config.layer_by_index(layer_index).map(|l| l.id);
        warn!(?layer_id, worker_entity_count = info.entity_count, "worker disconnected, cells reassigned to null owner");
    }

    /// Ensures the cell containing `pos` exists, running cell-initialization (least-loaded
    /// assignment per spatial layer) the first time it's touched.
    fn touch_cell(&mut self, config: &Config, pos: (i32, i32)) -> CellCoord {
        let coord = world_coord(config, pos);
        let (_, was_created) = self.grid.get_or_create(coord);
        if was_created {
            for (layer_index, layer_cfg) in config.layers.iter().enumerate() {
                if !layer_cfg.use_spatial_area {
                    continue;
                }
                let Some(owner) = self.layers[layer_index].least_loaded() else {
                    continue;
                };
                self.layers[layer_index].assign_cell(owner, coord, 0);
                if let Some(c) = self.grid.get_mut(coord) {
                    c.layer_owner[layer_index] = Some(owner);
                }
            }
        }
        coord
    }

    /// `insert_entity(e, pos)`: places a newly-added entity into its cell, bumping every
    /// owning layer's entity count.
    pub fn insert_entity(&mut self, config: &Config, entity: EntityId, pos: (i32, i32)) -> CellCoord {
        let coord = self.touch_cell(config, pos);
        if let Some(c) = self.grid.get_mut(coord) {
            c.entities.insert(entity);
            for (layer_index, owner) in c.layer_owner.clone().into_iter().enumerate() {
                if let Some(owner) = owner {
                    self.layers[layer_index].assign_cell(owner, coord, 1);
                }
            }
        }
        coord
    }

    /// `remove_entity`: drops membership from its current cell and decrements owning layers'
    /// entity counts. Returns the cell it was removed from, if any.
    pub fn remove_entity(&mut self, coord: Option<CellCoord>, entity: EntityId) {
        let Some(coord) = coord else { return };
        let owners: Vec<Option<WorkerId>> = match self.grid.get_mut(coord) {
            Some(c) => {
                c.entities.shift_remove(&entity);
                c.layer_owner.clone()
            }
            None => return,
        };
        for (layer_index, owner) in owners.into_iter().enumerate() {
            if let Some(owner) = owner {
                self.layers[layer_index].adjust_count(owner, -1);
            }
        }
    }

    /// Applies a position update. Returns `Some(new_coord)` with the events to emit if the
    /// entity actually crossed into a new cell (hysteresis test passed); `None` if it stayed
    /// in its current cell.
    pub fn move_entity(
        &mut self,
        config: &Config,
        entities: &EntityStore,
        entity: EntityId,
        current: CellCoord,
        new_pos: (i32, i32),
        events: &mut Vec<ControllerEvent>,
    ) -> Option<CellCoord> {
        let candidate = world_coord(config, new_pos);
        if candidate == current {
            return None;
        }
        let world_length = config.deployment.maximum_world_length;
        let cell_length = config.deployment.worker_length;
        let centered = config.deployment.uses_centralized_world_origin;
        if !cell::crosses_hysteresis(new_pos, current, candidate, world_length, cell_length, centered) {
            return None;
        }

        let new_coord = self.touch_cell(config, new_pos);
        let old_owners: Vec<Option<WorkerId>> = self.grid.get(current).map(|c| c.layer_owner.clone()).unwrap_or_default();

        if let Some(c) = self.grid.get_mut(current) {
            c.entities.shift_remove(&entity);
        }
        let new_owners: Vec<Option<WorkerId>> = if let Some(c) = self.grid.get_mut(new_coord) {
            c.entities.insert(entity);
            c.layer_owner.clone()
        } else {
            Vec::new()
        };

        for (layer_index, layer_cfg) in config.layers.iter().enumerate() {
            let old_owner = old_owners.get(layer_index).copied().flatten();
            let new_owner = new_owners.get(layer_index).copied().flatten();
            if old_owner.is_some() {
                self.layers[layer_index].adjust_count(old_owner.unwrap(), -1);
            }
            if let Some(owner) = new_owner {
                self.layers[layer_index].adjust_count(owner, 1);
            }
            if old_owner == new_owner {
                continue;
            }
            let Some(record) = entities.get(entity) else { continue };
            let has_any_component_of_layer = layer_cfg.components.iter().any(|c| record.has_component(c.id));
            if !has_any_component_of_layer {
                continue;
            }
            if let Some(old) = old_owner {
                events.push(ControllerEvent::AuthorityLost { entity, layer: layer_cfg.id, worker: old });
            }
            if let Some(new) = new_owner {
                events.push(ControllerEvent::AuthorityGain { entity, layer: layer_cfg.id, worker: new });
                for comp in &layer_cfg.components {
                    if let Some(payload) = record.payload(comp.id) {
                        events.push(ControllerEvent::ReinstallComponent {
                            entity,
                            component: comp.id,
                            payload: payload.to_vec(),
                            worker: new,
                        });
                    }
                }
            }
        }
        Some(new_coord)
    }

    /// One rebalance pass across every spatial layer with at least two workers, emitting
    /// `ControllerEvent`s for each cell handoff plus `RequestAdditionalWorker` for layers that
    /// remain over capacity with nowhere to put their load. `rand_skip` supplies the "small
    /// random skip" per layer. Every migrated entity gets a `ReinstallComponent` alongside its
    /// `AuthorityGain`, same as the hysteresis path in `move_entity`, so the new owner can
    /// rebuild its local mirror instead of holding authority over components it has no bytes
    /// for.
    pub fn rebalance_tick(&mut self, config: &Config, entities: &EntityStore, rand_skip: impl Fn() -> usize, events: &mut Vec<ControllerEvent>) {
        for (layer_index, layer_cfg) in config.layers.iter().enumerate() {
            if !layer_cfg.use_spatial_area {
                continue;
            }
            let layer = &self.layers[layer_index];
            if layer.worker_count() < 2 {
                continue;
            }
            let Some(threshold) = layer_cfg.maximum_entities_per_worker else {
                continue;
            };
            let grid = &self.grid;
            let plan = plan_rebalance(layer, |c| grid.get(c).map(|cell| cell.entities.len() as u32).unwrap_or(0), threshold, rand_skip());
            let Some(plan) = plan else { continue };

            for (from, to, cell_coord, count) in plan.moves {
                self.layers[layer_index].transfer_cell(from, to, cell_coord, count);
                if let Some(c) = self.grid.get_mut(cell_coord) {
                    c.layer_owner[layer_index] = Some(to);
                    for &entity in c.entities.clone().iter() {
                        events.push(ControllerEvent::AuthorityLost { entity, layer: layer_cfg.id, worker: from });
                        events.push(ControllerEvent::AuthorityGain { entity, layer: layer_cfg.id, worker: to });
                        let Some(record) = entities.get(entity) else { continue };
                        for comp in &layer_cfg.components {
                            if let Some(payload) = record.payload(comp.id) {
                                events.push(ControllerEvent::ReinstallComponent {
                                    entity,
                                    component: comp.id,
                                    payload: payload.to_vec(),
                                    worker: to,
                                });
                            }
                        }
                    }
                }
            }
            if plan.still_over_limit == Some(RebalanceFailureReason::NotEnoughSpace) {
                if layer_cfg.maximum_workers.map(|m| m > 0).unwrap_or(false) {
                    events.push(ControllerEvent::RequestAdditionalWorker {
                        layer: layer_cfg.id,
                        reason: RebalanceFailureReason::NotEnoughSpace,
                    });
                }
            }
        }
    }
}

fn world_coord(config: &Config, pos: (i32, i32)) -> CellCoord {
    cell::world_to_cell(
        pos,
        config.deployment.maximum_world_length,
        config.deployment.worker_length,
        config.deployment.uses_centralized_world_origin,
    )
}

/// Allocates [`WorkerId`]s for the world controller's worker-ownership bookkeeping. Owned by
/// [`crate::bridge::Bridge`] in practice (see its doc comment), re-exported here only so
/// tests in this module can mint ids without depending on `bridge`.
#[cfg(test)]
fn test_worker_arena() -> Arena<()> {
    Arena::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AttributeType, ComponentConfig, DeploymentConfig, LayerConfig};
    use indexmap::IndexMap;
    use smol_str::SmolStr;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_config(max_per_worker: Option<u32>) -> Config {
        let deployment = DeploymentConfig {
            maximum_world_length: 1024,
            worker_length: 64,
            uses_centralized_world_origin: true,
            runtime_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            client_worker_listen_port: 9000,
            server_worker_listen_port: 9001,
            inspector_listen_port: 9002,
            thread_pool_size: -1,
        };
        let mut attributes = IndexMap::new();
        attributes.insert(SmolStr::new("x"), AttributeType::I32);
        let layers = vec![LayerConfig {
            name: SmolStr::new("spatial"),
            id: 1,
            user_layer: true,
            use_spatial_area: true,
            maximum_entities_per_worker: max_per_worker,
            maximum_workers: Some(4),
            components: vec![ComponentConfig {
                name: SmolStr::new("pos"),
                id: 0,
                layer_name: SmolStr::new("spatial"),
                attributes,
            }],
        }];
        Config::new(deployment, layers, vec![]).unwrap()
    }

    #[test]
    fn cell_initialization_assigns_least_loaded_worker() {
        let config = test_config(Some(1000));
        let mut controller = WorldController::new(&config);
        let mut arena = test_worker_arena();
        let w = WorkerId(arena.insert(()));
        controller.register_worker(0, w);

        let entity = EntityId(1);
        let coord = controller.insert_entity(&config, entity, (0, 0));
        assert_eq!(coord, CellCoord::new(8, 8));
        let cell = controller.cell(coord).unwrap();
        assert_eq!(cell.layer_owner[0], Some(w));
        assert!(cell.entities.contains(&entity));
    }
}
