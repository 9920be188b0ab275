//! C7: the interest-query engine. Periodically re-evaluates installed [`ComponentQuery`]
//! trees, frequency-bucketed, and produces the component payloads to fan out to subscribing
//! workers.

pub mod bucket;
pub mod instruction;

pub use bucket::EntityQueryEntry;
pub use instruction::{BoxArea, CenteredArea, ComponentQuery, EvalContext, Frequency, QueryInstruction};

use std::time::Instant;

use ahash::AHashMap;
use rayon::prelude::*;

use crate::config::Config;
use crate::entity::{EntityId, EntityStore};
use crate::mask::ComponentId;
use crate::worker::WorkerId;
use crate::world::WorldController;

use bucket::FrequencyBucket;

/// One component's payload, matched for `matched_entity` by a query installed on
/// `querying_entity`, bound for the worker that currently owns `querying_entity`'s layer.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub destination: WorkerId,
    pub querying_entity: EntityId,
    pub matched_entity: EntityId,
    pub components: Vec<(ComponentId, Vec<u8>)>,
}

enum EntryOutcome {
    Outdated,
    Evaluated(Vec<QueryResult>),
}

/// The worker currently authoritative over `entity`'s components in the layer owning
/// `component` -- the destination for query results and the self-echo exclusion test.
fn layer_owner_for(config: &Config, world: &WorldController, entities: &EntityStore, entity: EntityId, component: ComponentId) -> Option<WorkerId> {
    let layer_index = config.layer_index_of(component)?;
    let record = entities.get(entity)?;
    let cell = world.cell(record.cell_ref?)?;
    cell.layer_owner.get(layer_index).copied().flatten()
}

fn evaluate_entry(config: &Config, world: &WorldController, entities: &EntityStore, entry: EntityQueryEntry) -> EntryOutcome {
    let Some(record) = entities.get(entry.entity) else {
        return EntryOutcome::Outdated;
    };
    let slot = record.query_slot(entry.component);
    if slot.version != entry.query_version {
        return EntryOutcome::Outdated;
    }
    let Some(destination) = layer_owner_for(config, world, entities, entry.entity, entry.component) else {
        // No worker currently owns the querying entity's layer component -- nothing to ship
        // the results to, but the subscription itself is still current.
        return EntryOutcome::Evaluated(Vec::new());
    };

    let ctx = EvalContext { config, world, entities, origin: record.position };
    let mut out = Vec::new();
    for query in &slot.queries {
        let matched = query.root.evaluate(&ctx, None);
        for matched_entity in matched {
            let mut components = Vec::new();
            for cid in query.component_mask.iter() {
                // No self-echo: skip components the destination worker already owns.
                if layer_owner_for(config, world, entities, matched_entity, cid) == Some(destination) {
                    continue;
                }
                if let Some(matched_record) = entities.get(matched_entity) {
                    if let Some(payload) = matched_record.payload(cid) {
                        components.push((cid, payload.to_vec()));
                    }
                }
            }
            if !components.is_empty() {
                out.push(QueryResult {
                    destination,
                    querying_entity: entry.entity,
                    matched_entity,
                    components,
                });
            }
        }
    }
    EntryOutcome::Evaluated(out)
}

/// Owns the 7 frequency buckets and the `(entity, component) -> slot` index used to find and
/// reap a subscription's old entry when it's replaced.
pub struct QueryEngine {
    start: Instant,
    buckets: Vec<FrequencyBucket>,
    index: AHashMap<(EntityId, ComponentId), (usize, usize)>,
}

impl QueryEngine {
    pub fn new(start: Instant) -> Self {
        Self {
            start,
            buckets: Frequency::ALL.iter().map(|f| FrequencyBucket::new(f.hz())).collect(),
            index: AHashMap::new(),
        }
    }

    fn bucket_index_for(freq: Frequency) -> usize {
        Frequency::ALL.iter().position(|&f| f == freq).expect("Frequency::ALL covers every variant")
    }

    /// `update_interest(entity, component, queries)`: bumps the component's query version and
    /// (re)installs one entry into the bucket for the maximum frequency among `queries`.
    /// Returns `false` if `entity` doesn't exist.
    pub fn update_interest(&mut self, entities: &mut EntityStore, entity: EntityId, component: ComponentId, queries: Vec<ComponentQuery>) -> bool {
        let max_freq = queries.iter().map(|q| q.frequency).max_by_key(|f| f.hz());
        let Some(record) = entities.get_mut(entity) else {
            return false;
        };
        let version = record.query_slot_mut(component).install(queries);

        if let Some((bucket_idx, slot_idx)) = self.index.remove(&(entity, component)) {
            self.buckets[bucket_idx].mark_outdated(slot_idx);
        }
        if let Some(freq) = max_freq {
            let bucket_idx = Self::bucket_index_for(freq);
            let slot_idx = self.buckets[bucket_idx].insert(EntityQueryEntry { entity, component, query_version: version });
            self.index.insert((entity, component), (bucket_idx, slot_idx));
        }
        true
    }

    /// Reaps every installed subscription belonging to a removed entity.
    pub fn mark_entity_gone(&mut self, entity: EntityId) {
        let buckets = &self.buckets;
        self.index.retain(|&(e, _), &mut (bucket_idx, slot_idx)| {
            if e == entity {
                buckets[bucket_idx].mark_outdated(slot_idx);
                false
            } else {
                true
            }
        });
    }

    /// One tick: fires every bucket whose period elapsed since `self.start`, re-evaluates its
    /// live entries in parallel on the rayon pool, and returns the outbound results to ship.
    /// Mutation (marking outdated, reaping) happens sequentially between parallel phases, so
    /// no slot is ever written concurrently with its own read.
    pub fn tick(&mut self, config: &Config, world: &WorldController, entities: &EntityStore, now: Instant) -> Vec<QueryResult> {
        let elapsed_ms = now.saturating_duration_since(self.start).as_millis() as u64;
        let mut results = Vec::new();
        for bucket in &mut self.buckets {
            if !bucket.should_fire(elapsed_ms) {
                continue;
            }
            let fired: Vec<(usize, EntityQueryEntry)> = bucket.live_entries().collect();
            let outcomes: Vec<(usize, EntryOutcome)> = fired
                .into_par_iter()
                .map(|(idx, entry)| (idx, evaluate_entry(config, world, entities, entry)))
                .collect();
            for (idx, outcome) in outcomes {
                match outcome {
                    EntryOutcome::Outdated => bucket.mark_outdated(idx),
                    EntryOutcome::Evaluated(mut r) => results.append(&mut r),
                }
            }
            bucket.reap_outdated();
        }
        results
    }
}
