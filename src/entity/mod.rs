//! C3: the authoritative entity store.
//!
//! A cheap, always-growing id space plus a side map from id to data. Unlike a generational
//! slot allocator, `EntityId`s here are never recycled -- the store doesn't need a free
//! list, just a monotonic counter and a plain hash map.

mod query_slot;
mod record;
mod store;

pub use query_slot::ComponentQuerySlot;
pub use record::EntityRecord;
pub use store::{AddEntityPayload, EntityStore, UpdateComponentResult};

use serde::{Deserialize, Serialize};

/// A globally unique entity identifier, handed out from [`EntityStore::reserve_ids`] ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Entity({})", self.0)
    }
}
