//! Coordinate mapping and sparse bucket storage for the spatial grid.
//!
//! A lazily-populated slab pattern adapted from an entity slab to a cell slab: buckets of
//! `B x B` cells are allocated the first time any cell inside them is referenced, keyed by
//! `(bucket_x, bucket_y)` in an `AHashMap` rather than an arena, since cells (unlike
//! entities) are never individually freed -- only whole buckets could be, and nothing here
//! ever shrinks the grid.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::worker::WorkerId;

/// Cells per bucket edge. Bucket slots are allocated lazily on first reference so a sparse
/// world never materializes cells nobody touched.
pub const BUCKET_SIZE: i32 = 16;

/// Cell-boundary thrashing guard: a position update only crosses into a new cell if the
/// ratio `distance(new_pos, new_center) / distance(new_pos, old_center)` is `< HYSTERESIS`.
pub const HYSTERESIS_RATIO: f64 = 0.7;

/// A cell coordinate in cell-space (not world-space).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellCoord {
    pub x: i32,
    pub y: i32,
}

impl CellCoord {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    fn bucket_key(self) -> (i32, i32) {
        (self.x.div_euclid(BUCKET_SIZE), self.y.div_euclid(BUCKET_SIZE))
    }
}

/// Clamp a world position into `[0, world_length]`, as required before mapping a centered
/// world's coordinates into cell space.
pub fn clamp_position(pos: (i32, i32), world_length: u32) -> (i32, i32) {
    let w = world_length as i32;
    (pos.0.clamp(0, w), pos.1.clamp(0, w))
}

/// Maps a world position to the cell containing it.
///
/// When `centered`, the world origin sits at its middle: `floor((x + W/2) / C)`. Otherwise
/// cell 0 starts at world origin: `floor(x / C)`. Positions are clamped to `[0, W]` first
/// (post-centering, per the boundary rule) so a world edge always maps inside the grid.
pub fn world_to_cell(pos: (i32, i32), world_length: u32, cell_length: u32, centered: bool) -> CellCoord {
    let (x, y) = clamp_position(pos, world_length);
    let c = cell_length as i32;
    if centered {
        let half = world_length as i32 / 2;
        CellCoord::new((x + half).div_euclid(c), (y + half).div_euclid(c))
    } else {
        CellCoord::new(x.div_euclid(c), y.div_euclid(c))
    }
}

/// Inverse of [`world_to_cell`]: the world coordinate of the cell's low corner.
pub fn cell_to_world(cell: CellCoord, world_length: u32, cell_length: u32, centered: bool) -> (i32, i32) {
    let c = cell_length as i32;
    if centered {
        let half = world_length as i32 / 2;
        (cell.x * c - half, cell.y * c - half)
    } else {
        (cell.x * c, cell.y * c)
    }
}

/// The center point, in world space, of a cell -- used by the hysteresis check.
pub fn cell_center(cell: CellCoord, world_length: u32, cell_length: u32, centered: bool) -> (f64, f64) {
    let (lx, ly) = cell_to_world(cell, world_length, cell_length, centered);
    let half = cell_length as f64 / 2.0;
    (lx as f64 + half, ly as f64 + half)
}

fn distance((ax, ay): (i32, i32), (bx, by): (f64, f64)) -> f64 {
    let dx = ax as f64 - bx;
    let dy = ay as f64 - by;
    (dx * dx + dy * dy).sqrt()
}

/// Whether a position update at `new_pos`, currently mapping to `current` and candidate
/// `new_cell`, should actually cross into `new_cell`. A ratio exactly equal to the hysteresis
/// threshold does **not** cross -- the test is strict.
pub fn crosses_hysteresis(
    new_pos: (i32, i32),
    current: CellCoord,
    new_cell: CellCoord,
    world_length: u32,
    cell_length: u32,
    centered: bool,
) -> bool {
    if current == new_cell {
        return false;
    }
    let old_center = cell_center(current, world_length, cell_length, centered);
    let new_center = cell_center(new_cell, world_length, cell_length, centered);
    let to_old = distance(new_pos, old_center);
    if to_old == 0.0 {
        return false;
    }
    let to_new = distance(new_pos, new_center);
    to_new / to_old < HYSTERESIS_RATIO
}

/// One cell of the world grid: which entities sit in it, and which worker (if any) owns it
/// per layer.
#[derive(Debug, Clone, Default)]
pub struct WorldCell {
    pub coordinates: CellCoord,
    pub entities: indexmap::IndexSet<crate::entity::EntityId>,
    /// Indexed by layer index (not `LayerId`); `None` means the layer has no worker to own
    /// this cell yet.
    pub layer_owner: Vec<Option<WorkerId>>,
}

impl WorldCell {
    fn new(coordinates: CellCoord, layer_count: usize) -> Self {
        Self {
            coordinates,
            entities: indexmap::IndexSet::new(),
            layer_owner: vec![None; layer_count],
        }
    }
}

/// The sparse `B x B`-bucketed cell grid (one per layer that uses spatial partitioning would
/// be wasteful since cells are shared across layers -- `layer_owner` inside each [`WorldCell`]
/// is what varies per layer).
#[derive(Debug, Clone, Default)]
pub struct Grid {
    buckets: AHashMap<(i32, i32), AHashMap<CellCoord, WorldCell>>,
    layer_count: usize,
}

impl Grid {
    pub fn new(layer_count: usize) -> Self {
        Self {
            buckets: AHashMap::new(),
            layer_count,
        }
    }

    pub fn get(&self, coord: CellCoord) -> Option<&WorldCell> {
        self.buckets.get(&coord.bucket_key())?.get(&coord)
    }

    pub fn get_mut(&mut self, coord: CellCoord) -> Option<&mut WorldCell> {
        self.buckets.get_mut(&coord.bucket_key())?.get_mut(&coord)
    }

    /// Returns the cell at `coord`, creating it (and its bucket, if needed) first. The
    /// caller is responsible for running cell-initialization (least-loaded-worker
    /// assignment) on a cell that didn't previously exist; `was_created` tells it whether to.
    pub fn get_or_create(&mut self, coord: CellCoord) -> (&mut WorldCell, bool) {
        let bucket = self.buckets.entry(coord.bucket_key()).or_default();
        let was_created = !bucket.contains_key(&coord);
        let cell = bucket
            .entry(coord)
            .or_insert_with(|| WorldCell::new(coord, self.layer_count));
        (cell, was_created)
    }

    /// Iterates every existing (non-empty-bucket) cell within the inclusive rectangle
    /// `[min, max]`, skipping buckets that don't intersect it and cells that were never
    /// created.
    pub fn cells_in_rect(&self, min: CellCoord, max: CellCoord) -> impl Iterator<Item = &WorldCell> {
        let bucket_min = (min.x.div_euclid(BUCKET_SIZE), min.y.div_euclid(BUCKET_SIZE));
        let bucket_max = (max.x.div_euclid(BUCKET_SIZE), max.y.div_euclid(BUCKET_SIZE));
        self.buckets
            .iter()
            .filter(move |((bx, by), _)| (bucket_min.0..=bucket_max.0).contains(bx) && (bucket_min.1..=bucket_max.1).contains(by))
            .flat_map(|(_, cells)| cells.values())
            .filter(move |cell| {
                (min.x..=max.x).contains(&cell.coordinates.x) && (min.y..=max.y).contains(&cell.coordinates.y)
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorldCell> {
        self.buckets.values().flat_map(|cells| cells.values())
    }
}

/// The bounding cell rectangle of a radius query, for the caller to iterate with
/// [`Grid::cells_in_rect`] before refining by precise squared distance.
pub fn range_rect(center: CellCoord, radius_cells: i32) -> (CellCoord, CellCoord) {
    (
        CellCoord::new(center.x - radius_cells, center.y - radius_cells),
        CellCoord::new(center.x + radius_cells, center.y + radius_cells),
    )
}
