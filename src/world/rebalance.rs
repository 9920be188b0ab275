//! Density-pressure cell rebalancing and the events it (and cell/position updates) emit
//! toward workers.
//!
//! Rather than the world controller calling back into worker/bridge code directly, ownership
//! changes are appended to a plain `Vec<ControllerEvent>` that the orchestrator drains once
//! per tick and turns into outbound wire messages -- message passing in place of captured
//! callbacks.

use ahash::AHashMap;

use crate::config::LayerId;
use crate::entity::EntityId;
use crate::mask::ComponentId;
use crate::world::cell::CellCoord;
use crate::worker::WorkerId;

/// Threshold fraction of `maximum_entities_per_worker` a rebalance target must stay under
/// after accepting a cell -- the same 0.7 factor as the hysteresis ratio, but a distinct
/// constant since the two guard unrelated things.
pub const REBALANCE_GUARD_RATIO: f64 = 0.7;

/// Something the rest of the runtime needs to tell a worker about as a result of world
/// controller bookkeeping. Carries everything the orchestrator needs to build the wire
/// message without looking anything back up.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    AuthorityLost { entity: EntityId, layer: LayerId, worker: WorkerId },
    AuthorityGain { entity: EntityId, layer: LayerId, worker: WorkerId },
    /// Sent alongside `AuthorityGain`, once per component of the layer present on the entity,
    /// so the new owner can reconstruct its local mirror.
    ReinstallComponent { entity: EntityId, component: ComponentId, payload: Vec<u8>, worker: WorkerId },
    /// A layer's `over_limit` worker found no eligible rebalance target; the spawner should
    /// be asked for another worker if the layer allows more.
    RequestAdditionalWorker { layer: LayerId, reason: RebalanceFailureReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceFailureReason {
    /// Every candidate cell on the overloaded worker was itself too hot to hand off (its own
    /// entity count meets or exceeds the layer's `maximum_entities_per_worker`), or no other
    /// worker could accept it under the 70% guard.
    NotEnoughSpace,
}

/// One rebalance pass over a single layer's [`super::layer::LayerState`].
///
/// `over_threshold_skip` implements "a small random skip discourages thundering handoff": the
/// caller passes a small random count of over-limit workers to skip before picking the one to
/// actually rebalance this tick, so many simultaneously-hot workers don't all dump cells onto
/// the same target in the same tick.
pub struct RebalancePlan {
    /// `(from, to, cell, cell_entity_count)` moves to apply.
    pub moves: Vec<(WorkerId, WorkerId, CellCoord, u32)>,
    /// Set when the overloaded worker ends the pass still at or above the limit with no
    /// eligible target found for at least one of its cells.
    pub still_over_limit: Option<RebalanceFailureReason>,
}

/// Runs one rebalance pass against `layer` for the worker found `threshold` or above entity
/// count, skipping `skip` such workers first (the "small random skip").
///
/// Returns `None` if no worker is over `threshold` after skipping (nothing to do this tick).
pub fn plan_rebalance(
    layer: &crate::world::layer::LayerState,
    cell_lookup: impl Fn(CellCoord) -> u32,
    threshold: u32,
    skip: usize,
) -> Option<RebalancePlan> {
    let overloaded: WorkerId = layer.over_threshold(threshold).nth(skip)?;
    let info = layer.get(overloaded)?;
    let mut moves = Vec::new();
    let mut still_hot = false;
    // Entities tentatively handed to each target so far this pass -- `layer` itself isn't
    // mutated until the caller applies `moves`, so without this the guard would re-check
    // every candidate cell against the same stale pre-pass count and let a single target
    // accept far more than its 70% share in one tick.
    let mut planned: AHashMap<WorkerId, u32> = AHashMap::default();

    for &cell in &info.coordinates_owned {
        let cell_count = cell_lookup(cell);
        if cell_count >= threshold {
            // Unsplittably hot: moving this cell alone wouldn't relieve the worker without
            // immediately overloading whoever receives it.
            still_hot = true;
            continue;
        }
        let target = layer.ascending().filter(|&w| w != overloaded).find(|&t| {
            let t_count = layer.get(t).map(|i| i.entity_count).unwrap_or(0) + planned.get(&t).copied().unwrap_or(0);
            (t_count as f64 + cell_count as f64) < REBALANCE_GUARD_RATIO * threshold as f64
        });
        match target {
            Some(t) => {
                *planned.entry(t).or_insert(0) += cell_count;
                moves.push((overloaded, t, cell, cell_count));
            }
            None => still_hot = true,
        }
    }

    let still_over_limit = if still_hot {
        Some(RebalanceFailureReason::NotEnoughSpace)
    } else {
        None
    };

    Some(RebalancePlan { moves, still_over_limit })
}
