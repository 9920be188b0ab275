//! Query predicate trees and their evaluation against current world state.
//!
//! A recursive filter-combinator tree, the same shape as a type-level query filter but
//! evaluated at runtime since these queries are installed over the wire, not known at
//! compile time.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::entity::{EntityId, EntityStore};
use crate::mask::ComponentMask;
use crate::world::cell;
use crate::world::WorldController;

/// One of the seven frequencies a [`ComponentQuery`] may re-evaluate at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frequency {
    Hz50,
    Hz40,
    Hz30,
    Hz20,
    Hz10,
    Hz5,
    Hz1,
}

impl Frequency {
    pub const ALL: [Frequency; 7] = [
        Frequency::Hz50,
        Frequency::Hz40,
        Frequency::Hz30,
        Frequency::Hz20,
        Frequency::Hz10,
        Frequency::Hz5,
        Frequency::Hz1,
    ];

    pub fn hz(self) -> u32 {
        match self {
            Frequency::Hz50 => 50,
            Frequency::Hz40 => 40,
            Frequency::Hz30 => 30,
            Frequency::Hz20 => 20,
            Frequency::Hz10 => 10,
            Frequency::Hz5 => 5,
            Frequency::Hz1 => 1,
        }
    }

    pub fn period_ms(self) -> u64 {
        1000 / self.hz() as u64
    }
}

/// An axis-aligned rectangle in world coordinates, inclusive on both corners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxArea {
    pub min: (i32, i32),
    pub max: (i32, i32),
}

/// A `width x height` rectangle centered on the query's invocation point (the querying
/// entity's current position at evaluation time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CenteredArea {
    pub width: u32,
    pub height: u32,
}

/// One node of a [`ComponentQuery`]'s predicate tree. Each node carries exactly one
/// constraint; composition happens through `And`/`Or`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueryInstruction {
    ComponentsRequired(ComponentMask),
    Box(BoxArea),
    Area(CenteredArea),
    /// Bounded integer radius, in world units, around the invocation point.
    Radius(i32),
    And(std::boxed::Box<QueryInstruction>, std::boxed::Box<QueryInstruction>),
    /// Implemented with real set-union semantics (see `DESIGN.md`'s open-question notes).
    Or(std::boxed::Box<QueryInstruction>, std::boxed::Box<QueryInstruction>),
}

/// A standing predicate installed by a worker on one of its authoritative entities: what to
/// match (`root`), what to return from matches (`component_mask`), and how often to
/// re-evaluate (`frequency`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentQuery {
    pub root: QueryInstruction,
    pub component_mask: ComponentMask,
    pub frequency: Frequency,
}

/// Everything [`QueryInstruction::evaluate`] needs to read without owning it: the static
/// config, the live entity store and world grid, and the invocation point (the querying
/// entity's position at the moment of re-evaluation).
pub struct EvalContext<'a> {
    pub config: &'a Config,
    pub world: &'a WorldController,
    pub entities: &'a EntityStore,
    pub origin: (i32, i32),
}

impl QueryInstruction {
    /// Evaluates this node against `candidate`: `None` means no spatial/mask constraint has
    /// seeded the set yet (this node may seed it); `Some(set)` means a prior node already
    /// produced a candidate set that this node narrows -- the first spatial constraint seen
    /// seeds the set, and subsequent spatial/mask nodes intersect into it.
    pub fn evaluate(&self, ctx: &EvalContext, candidate: Option<&IndexSet<EntityId>>) -> IndexSet<EntityId> {
        match self {
            QueryInstruction::ComponentsRequired(mask) => components_required(ctx, candidate, *mask),
            QueryInstruction::Box(area) => spatial_filter(ctx, candidate, area.min, area.max),
            QueryInstruction::Area(area) => {
                let (w, h) = (area.width as i32, area.height as i32);
                let min = (ctx.origin.0 - w / 2, ctx.origin.1 - h / 2);
                let max = (ctx.origin.0 + w / 2, ctx.origin.1 + h / 2);
                spatial_filter(ctx, candidate, min, max)
            }
            QueryInstruction::Radius(radius) => spatial_filter_radius(ctx, candidate, ctx.origin, *radius),
            QueryInstruction::And(left, right) => {
                let narrowed = left.evaluate(ctx, candidate);
                right.evaluate(ctx, Some(&narrowed))
            }
            QueryInstruction::Or(left, right) => {
                let a = left.evaluate(ctx, candidate);
                let b = right.evaluate(ctx, candidate);
                a.union(&b).copied().collect()
            }
        }
    }
}

fn components_required(ctx: &EvalContext, candidate: Option<&IndexSet<EntityId>>, mask: ComponentMask) -> IndexSet<EntityId> {
    match candidate {
        Some(set) => set
            .iter()
            .copied()
            .filter(|&e| ctx.entities.get(e).map(|r| r.mask().is_superset_of(mask)).unwrap_or(false))
            .collect(),
        None => ctx
            .entities
            .iter()
            .filter(|(_, record)| record.mask().is_superset_of(mask))
            .map(|(id, _)| id)
            .collect(),
    }
}

fn in_rect(pos: (i32, i32), min: (i32, i32), max: (i32, i32)) -> bool {
    pos.0 >= min.0 && pos.0 <= max.0 && pos.1 >= min.1 && pos.1 <= max.1
}

fn spatial_filter(ctx: &EvalContext, candidate: Option<&IndexSet<EntityId>>, min: (i32, i32), max: (i32, i32)) -> IndexSet<EntityId> {
    match candidate {
        Some(set) => set
            .iter()
            .copied()
            .filter(|&e| ctx.entities.get(e).map(|r| in_rect(r.position, min, max)).unwrap_or(false))
            .collect(),
        None => {
            let deployment = &ctx.config.deployment;
            let min_cell = cell::world_to_cell(min, deployment.maximum_world_length, deployment.worker_length, deployment.uses_centralized_world_origin);
            let max_cell = cell::world_to_cell(max, deployment.maximum_world_length, deployment.worker_length, deployment.uses_centralized_world_origin);
            ctx.world
                .cells_in_rect(min_cell, max_cell)
                .flat_map(|c| c.entities.iter().copied())
                .filter(|&e| ctx.entities.get(e).map(|r| in_rect(r.position, min, max)).unwrap_or(false))
                .collect()
        }
    }
}

fn sq_dist(a: (i32, i32), b: (i32, i32)) -> i64 {
    let dx = (a.0 - b.0) as i64;
    let dy = (a.1 - b.1) as i64;
    dx * dx + dy * dy
}

fn spatial_filter_radius(ctx: &EvalContext, candidate: Option<&IndexSet<EntityId>>, origin: (i32, i32), radius: i32) -> IndexSet<EntityId> {
    let radius = radius.max(0);
    let r2 = (radius as i64) * (radius as i64);
    match candidate {
        Some(set) => set
            .iter()
            .copied()
            .filter(|&e| ctx.entities.get(e).map(|r| sq_dist(r.position, origin) <= r2).unwrap_or(false))
            .collect(),
        None => {
            let deployment = &ctx.config.deployment;
            let cell_length = deployment.worker_length.max(1) as i32;
            let radius_cells = (radius + cell_length - 1) / cell_length;
            let origin_cell = cell::world_to_cell(origin, deployment.maximum_world_length, deployment.worker_length, deployment.uses_centralized_world_origin);
            let (min_cell, max_cell) = cell::range_rect(origin_cell, radius_cells);
            ctx.world
                .cells_in_rect(min_cell, max_cell)
                .flat_map(|c| c.entities.iter().copied())
                .filter(|&e| ctx.entities.get(e).map(|r| sq_dist(r.position, origin) <= r2).unwrap_or(false))
                .collect()
        }
    }
}
