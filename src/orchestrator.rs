//! C9: the runtime orchestrator, tying every other component into one `tick()`.
//!
//! One struct owns every subsystem, one method drives a fixed phase order per tick: poll
//! transports, rebalance, re-evaluate queries, dispatch handlers, reap timeouts, step
//! spawners.

use std::net::SocketAddr;
use std::time::Instant;

use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, warn};

use crate::bridge::BridgeSet;
use crate::config::{Config, LayerId};
use crate::entity::{AddEntityPayload, EntityStore, UpdateComponentResult};
use crate::error::{fatal_invariant_break, TransportError};
use crate::mask::ComponentId;
use crate::protocol::{self, MessageType};
use crate::query::QueryEngine;
use crate::router::RequestRouter;
use crate::spawner::SpawnerClient;
use crate::transport::Transport;
use crate::world::rebalance::ControllerEvent;
use crate::world::WorldController;
use crate::worker::{WorkerKind, WorkerReference};

use crate::protocol::{
    CellInfo, EntityInfo, InspectorQueryMatch, RuntimeAddComponent, RuntimeAddComponentResponse, RuntimeAddEntity,
    RuntimeAddEntityResponse, RuntimeAuthentication, RuntimeAuthenticationResponse, RuntimeClientAuthentication,
    RuntimeClientAuthenticationResponse, RuntimeComponentInterestQueryUpdate, RuntimeComponentUpdate,
    RuntimeGetCellsInfos, RuntimeGetCellsInfosResponse, RuntimeGetEntitiesInfo, RuntimeGetEntitiesInfoResponse,
    RuntimeGetWorkersInfos, RuntimeGetWorkersInfosResponse, RuntimeInspectorQuery, RuntimeInspectorQueryResponse,
    RuntimeLogMessage, RuntimeRemoveComponent, RuntimeRemoveComponentResponse, RuntimeRemoveEntity,
    RuntimeRemoveEntityResponse, RuntimeReserveEntityIdRange, RuntimeReserveEntityIdRangeResponse,
    RuntimeWorkerReportAcknowledge, SpawnWorkerForLayer, SpawnWorkerForLayerResponse, WorkerAddComponent,
    WorkerInfo, WorkerLayerAuthorityGain, WorkerLayerAuthorityLost, WorkerRemoveComponent,
};
use crate::protocol::LogLevel;

/// Default timeout a `SpawnWorkerForLayer` request is allowed to stay pending before the
/// spawner client expires it and allows a retry. `timeout_ms` is otherwise a per-call
/// parameter; this is the value the orchestrator supplies for rebalance-triggered requests,
/// which have no caller to hand one in explicitly.
pub const SPAWN_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Which of the three listening sockets a [`crate::transport::Delivery`] arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    ClientWorker,
    ServerWorker,
    Inspector,
}

/// Per-tick counters surfaced to the embedder/test harness as a structured value in addition
/// to the usual logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickReport {
    pub messages_processed: u32,
    pub rebalances_performed: u32,
    pub queries_fired: u32,
    pub query_results_sent: u32,
    pub timeouts_reaped: u32,
    pub bytes_in: u32,
    pub bytes_out: u32,
}

/// C9: owns every other subsystem and exposes the single `tick()` that drives them all.
pub struct Runtime {
    config: Config,
    start: Instant,

    bridges: BridgeSet,
    entities: EntityStore,
    world: WorldController,
    query_engine: QueryEngine,
    spawners: Vec<SpawnerClient>,

    client_transport: Transport,
    server_transport: Transport,
    inspector_transport: Transport,
    client_router: RequestRouter,
    server_router: RequestRouter,
    inspector_router: RequestRouter,

    pool: Option<ThreadPool>,
}

impl Runtime {
    pub fn new(config: Config, now: Instant) -> Result<Self, TransportError> {
        let deployment = &config.deployment;
        let client_addr = SocketAddr::new(deployment.runtime_ip, deployment.client_worker_listen_port);
        let server_addr = SocketAddr::new(deployment.runtime_ip, deployment.server_worker_listen_port);
        let inspector_addr = SocketAddr::new(deployment.runtime_ip, deployment.inspector_listen_port);

        let pool = match config.thread_pool_size() {
            Some(0) => None,
            Some(n) => Some(ThreadPoolBuilder::new().num_threads(n).build().expect("rayon pool builds with a fixed thread count")),
            None => Some(ThreadPoolBuilder::new().build().expect("rayon pool builds with the default thread count")),
        };

        let layer_count = config.layer_count();
        let spawners = config.spawners.iter().map(|s| SpawnerClient::new(SocketAddr::new(s.ip, s.port))).collect();

        Ok(Self {
            bridges: BridgeSet::new(layer_count),
            entities: EntityStore::new(),
            world: WorldController::new(&config),
            query_engine: QueryEngine::new(now),
            spawners,
            client_transport: Transport::bind(client_addr)?,
            server_transport: Transport::bind(server_addr)?,
            inspector_transport: Transport::bind(inspector_addr)?,
            client_router: RequestRouter::new(),
            server_router: RequestRouter::new(),
            inspector_router: RequestRouter::new(),
            pool,
            config,
            start: now,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bound address of the client-worker transport, e.g. for a test harness that bound to
    /// port 0 and needs to learn which ephemeral port the OS picked.
    pub fn client_worker_addr(&self) -> std::io::Result<SocketAddr> {
        self.client_transport.local_addr()
    }

    /// Bound address of the server-worker transport.
    pub fn server_worker_addr(&self) -> std::io::Result<SocketAddr> {
        self.server_transport.local_addr()
    }

    /// Bound address of the inspector transport.
    pub fn inspector_addr(&self) -> std::io::Result<SocketAddr> {
        self.inspector_transport.local_addr()
    }

    // -----------------------------------------------------------------------------------
    // tick()
    // -----------------------------------------------------------------------------------

    /// The eight-step tick. Step 8 ("reset per-frame arena allocators") has no counterpart
    /// in this crate -- there is no per-frame arena here, only the reliable channels' own
    /// buffers, which own their lifetime independently -- so it's a documented
    /// no-op rather than a missing step.
    pub fn tick(&mut self, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        // 1. Client + inspector transports.
        let (mut deliveries, client_in) = self.client_transport.poll(now);
        let mut origins: Vec<Origin> = deliveries.iter().map(|_| Origin::ClientWorker).collect();
        let (inspector_deliveries, inspector_in) = self.inspector_transport.poll(now);
        origins.extend(inspector_deliveries.iter().map(|_| Origin::Inspector));
        deliveries.extend(inspector_deliveries);
        report.bytes_in += client_in + inspector_in;
        report.bytes_out += self.client_transport.flush(now).unwrap_or(0);
        report.bytes_out += self.inspector_transport.flush(now).unwrap_or(0);

        // 2. Server-worker transport. The two transports don't share mutable state with each
        // other, only with the entity store/world controller mutated below, so polling them
        // back-to-back on the main thread (rather than literally spawning a thread per
        // transport) preserves a single-main-thread-mutation invariant with far less
        // complexity for two cheap, non-blocking socket drains.
        let (server_deliveries, server_in) = self.server_transport.poll(now);
        origins.extend(server_deliveries.iter().map(|_| Origin::ServerWorker));
        deliveries.extend(server_deliveries);
        report.bytes_in += server_in;
        report.bytes_out += self.server_transport.flush(now).unwrap_or(0);

        // 3. World controller rebalance pass.
        let mut events = Vec::new();
        self.world.rebalance_tick(&self.config, &self.entities, || fastrand::usize(0..3), &mut events);
        report.rebalances_performed = events
            .iter()
            .filter(|e| matches!(e, ControllerEvent::AuthorityGain { .. }))
            .count() as u32;
        self.dispatch_controller_events(events, now);

        // 4. Interest-query engine, against the thread pool.
        let results = match &self.pool {
            Some(pool) => pool.install(|| self.query_engine.tick(&self.config, &self.world, &self.entities, now)),
            None => self.query_engine.tick(&self.config, &self.world, &self.entities, now),
        };
        report.queries_fired = results.len() as u32;
        for result in results {
            self.send_query_result(result, now);
            report.query_results_sent += 1;
        }

        // 5. Dispatch every delivery drained in steps 1-2.
        for (origin, delivery) in origins.into_iter().zip(deliveries.into_iter()) {
            self.handle_delivery(origin, delivery.peer, &delivery.bytes, now);
            report.messages_processed += 1;
        }

        // 6. Reap timed-out peers across all three transports.
        report.timeouts_reaped += self.reap_transport_timeouts(Origin::ClientWorker, now);
        report.timeouts_reaped += self.reap_transport_timeouts(Origin::ServerWorker, now);
        report.timeouts_reaped += self.reap_transport_timeouts(Origin::Inspector, now);

        // 7. Step spawner clients.
        for spawner in &mut self.spawners {
            let expired = spawner.tick(now);
            for layer_id in expired {
                warn!(layer_id, "spawn request expired without a response, will retry next overload");
            }
        }

        // 8. No per-frame arena allocator exists in this crate; nothing to reset.

        report
    }

    fn reap_transport_timeouts(&mut self, origin: Origin, now: Instant) -> u32 {
        let timed_out = match origin {
            Origin::ClientWorker => self.client_transport.reap_timed_out(now),
            Origin::ServerWorker => self.server_transport.reap_timed_out(now),
            Origin::Inspector => self.inspector_transport.reap_timed_out(now),
        };
        let count = timed_out.len() as u32;
        for peer in timed_out {
            match origin {
                Origin::ClientWorker => {
                    self.client_router.purge_peer(peer);
                }
                Origin::ServerWorker => {
                    self.server_router.purge_peer(peer);
                }
                Origin::Inspector => {
                    self.inspector_router.purge_peer(peer);
                    continue;
                }
            }
            self.disconnect_worker(peer, now);
        }
        count
    }

    /// A worker's transport channel timed out: find which (layer, worker) it was, reassign its
    /// owned cells to null, and drop its bridge entry. The next rebalance pass asks the
    /// spawner for a replacement if the layer allows more workers.
    fn disconnect_worker(&mut self, peer: SocketAddr, now: Instant) {
        let Some((layer_index, worker_id)) = self.bridges.find_by_addr(peer) else {
            return;
        };
        self.world.unregister_worker(&self.config, layer_index, worker_id);
        self.bridges.bridge_mut(layer_index).remove(worker_id);

        let Some(layer_cfg) = self.config.layer_by_index(layer_index) else {
            return;
        };
        if layer_cfg.maximum_workers.map(|m| m > 0).unwrap_or(false) {
            let layer_id = layer_cfg.id;
            if let Some(spawner) = self.spawners.first_mut() {
                match spawner.request_worker(&mut self.server_router, &mut self.server_transport, layer_id, SPAWN_REQUEST_TIMEOUT, now) {
                    Ok(_) => {}
                    Err(err) => warn!(?err, layer_id, "failed to request a replacement worker after timeout"),
                }
            }
        }
    }

    // -----------------------------------------------------------------------------------
    // Outbound: controller events and query results
    // -----------------------------------------------------------------------------------

    fn worker_endpoint(&self, layer_index: usize, worker_id: crate::worker::WorkerId) -> Option<(SocketAddr, WorkerKind)> {
        let bridge = self.bridges.bridge(layer_index)?;
        let worker = bridge.get(worker_id)?;
        Some((worker.addr, worker.kind))
    }

    /// `register_worker`/`unregister_worker` keep the world controller's per-layer density
    /// index and the bridge's worker registry in lockstep, so any [`ControllerEvent`] naming
    /// a `worker_id` the bridge doesn't recognize means that bookkeeping has desynced --
    /// silently dropping the event here would leave entity->worker authority inconsistent
    /// for every tick after.
    fn push_to_worker<T: serde::Serialize + protocol::WireMessage>(&mut self, layer_index: usize, worker_id: crate::worker::WorkerId, body: &T, now: Instant) {
        let Some((addr, kind)) = self.worker_endpoint(layer_index, worker_id) else {
            fatal_invariant_break("controller event addressed to a worker absent from its layer's bridge");
        };
        let result = match kind {
            WorkerKind::Server => self.server_router.send_oneway(&mut self.server_transport, addr, body, now),
            WorkerKind::Client => self.client_router.send_oneway(&mut self.client_transport, addr, body, now),
        };
        if let Err(err) = result {
            warn!(?err, "failed to encode outbound push to worker");
        }
    }

    fn dispatch_controller_events(&mut self, events: Vec<ControllerEvent>, now: Instant) {
        for event in events {
            match event {
                ControllerEvent::AuthorityLost { entity, layer, worker } => {
                    if let Some(idx) = self.config.layer_index_by_id(layer) {
                        self.push_to_worker(idx, worker, &WorkerLayerAuthorityLost { entity_id: entity, layer_id: layer }, now);
                    }
                }
                ControllerEvent::AuthorityGain { entity, layer, worker } => {
                    if let Some(idx) = self.config.layer_index_by_id(layer) {
                        self.push_to_worker(idx, worker, &WorkerLayerAuthorityGain { entity_id: entity, layer_id: layer }, now);
                    }
                }
                ControllerEvent::ReinstallComponent { entity, component, payload, worker } => {
                    if let Some(idx) = self.config.layer_index_of(component) {
                        self.push_to_worker(idx, worker, &WorkerAddComponent { entity_id: entity, component_id: component, payload }, now);
                    }
                }
                ControllerEvent::RequestAdditionalWorker { layer, reason } => {
                    warn!(layer, ?reason, "rebalance found no eligible handoff target, requesting an additional worker");
                    if let Some(spawner) = self.spawners.first_mut() {
                        let result = spawner.request_worker(&mut self.server_router, &mut self.server_transport, layer, SPAWN_REQUEST_TIMEOUT, now);
                        if let Err(err) = result {
                            warn!(?err, layer, "failed to request an additional worker");
                        }
                    }
                }
            }
        }
    }

    /// Builds the `AuthorityGain`/`ReinstallComponent` events a freshly-added entity generates,
    /// mirroring `WorldController::move_entity`'s own event-emission shape -- `insert_entity`
    /// doesn't emit these itself since it has no "previous owner" to diff against.
    fn new_assignment_events(&self, entity: crate::entity::EntityId) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        let Some(record) = self.entities.get(entity) else { return events };
        let Some(cell) = record.cell_ref.and_then(|c| self.world.cell(c)) else { return events };
        for (layer_index, layer_cfg) in self.config.layers.iter().enumerate() {
            let Some(owner) = cell.layer_owner.get(layer_index).copied().flatten() else { continue };
            let has_component = layer_cfg.components.iter().any(|c| record.has_component(c.id));
            if !has_component {
                continue;
            }
            events.push(ControllerEvent::AuthorityGain { entity, layer: layer_cfg.id, worker: owner });
            for comp in &layer_cfg.components {
                if let Some(payload) = record.payload(comp.id) {
                    events.push(ControllerEvent::ReinstallComponent {
                        entity,
                        component: comp.id,
                        payload: payload.to_vec(),
                        worker: owner,
                    });
                }
            }
        }
        events
    }

    fn send_query_result(&mut self, result: crate::query::QueryResult, now: Instant) {
        let Some((addr, kind)) = self.worker_endpoint_by_id(result.destination, now) else {
            return;
        };
        let chunks = protocol::chunk_components(result.components, 500);
        for chunk in chunks {
            let body = crate::protocol::RuntimeComponentInterestQueryResult {
                querying_entity: result.querying_entity,
                matched_entity: result.matched_entity,
                components: chunk,
            };
            let outcome = match kind {
                WorkerKind::Server => self.server_router.send_oneway(&mut self.server_transport, addr, &body, now),
                WorkerKind::Client => self.client_router.send_oneway(&mut self.client_transport, addr, &body, now),
            };
            if let Err(err) = outcome {
                warn!(?err, "failed to send interest-query result chunk");
            }
        }
    }

    /// [`Self::worker_endpoint`] needs a layer index; query results only carry a `WorkerId`, so
    /// this scans every bridge once to find which layer (if any) still holds it.
    fn worker_endpoint_by_id(&self, worker_id: crate::worker::WorkerId, _now: Instant) -> Option<(SocketAddr, WorkerKind)> {
        self.bridges.iter().find_map(|(_, bridge)| bridge.get(worker_id)).map(|w| (w.addr, w.kind))
    }

    // -----------------------------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------------------------

    fn handle_delivery(&mut self, origin: Origin, peer: SocketAddr, bytes: &[u8], now: Instant) {
        let (header, rest) = match protocol::decode_header(bytes) {
            Ok(v) => v,
            Err(err) => {
                debug!(?err, ?peer, "dropped malformed frame header");
                return;
            }
        };

        macro_rules! respond {
            ($router:expr, $transport:expr, $body:expr) => {{
                let outcome = $router.send_response(&mut $transport, peer, header.request_index, &$body, now);
                if let Err(err) = outcome {
                    warn!(?err, "failed to encode response");
                }
            }};
        }

        match header.message_type {
            MessageType::RuntimeAuthentication => {
                let Ok(body) = bincode::deserialize::<RuntimeAuthentication>(rest) else { return };
                let succeed = self.handle_authentication(WorkerKind::Server, body.layer_id, body.client_hash, peer, now);
                respond!(self.server_router, self.server_transport, RuntimeAuthenticationResponse { succeed });
            }
            MessageType::RuntimeClientAuthentication => {
                let Ok(body) = bincode::deserialize::<RuntimeClientAuthentication>(rest) else { return };
                let succeed = self.handle_authentication(WorkerKind::Client, body.layer_id, body.client_hash, peer, now);
                respond!(self.client_router, self.client_transport, RuntimeClientAuthenticationResponse { succeed });
            }
            MessageType::RuntimeLogMessage => {
                let Ok(body) = bincode::deserialize::<RuntimeLogMessage>(rest) else { return };
                self.handle_log_message(peer, body);
            }
            MessageType::RuntimeReserveEntityIdRange => {
                let Ok(body) = bincode::deserialize::<RuntimeReserveEntityIdRange>(rest) else { return };
                let response = match self.entities.reserve_ids(body.count) {
                    Some(range) => RuntimeReserveEntityIdRangeResponse { succeed: true, begin: range.start, count: body.count },
                    None => RuntimeReserveEntityIdRangeResponse { succeed: false, begin: 0, count: 0 },
                };
                match origin {
                    Origin::ServerWorker => respond!(self.server_router, self.server_transport, response),
                    Origin::ClientWorker => respond!(self.client_router, self.client_transport, response),
                    Origin::Inspector => {}
                }
            }
            MessageType::RuntimeAddEntity => {
                let Ok(body) = bincode::deserialize::<RuntimeAddEntity>(rest) else { return };
                let succeed = self.handle_add_entity(body, now);
                match origin {
                    Origin::ServerWorker => respond!(self.server_router, self.server_transport, RuntimeAddEntityResponse { succeed }),
                    Origin::ClientWorker => respond!(self.client_router, self.client_transport, RuntimeAddEntityResponse { succeed }),
                    Origin::Inspector => {}
                }
            }
            MessageType::RuntimeRemoveEntity => {
                let Ok(body) = bincode::deserialize::<RuntimeRemoveEntity>(rest) else { return };
                let succeed = self.handle_remove_entity(body.entity_id, now);
                match origin {
                    Origin::ServerWorker => respond!(self.server_router, self.server_transport, RuntimeRemoveEntityResponse { succeed }),
                    Origin::ClientWorker => respond!(self.client_router, self.client_transport, RuntimeRemoveEntityResponse { succeed }),
                    Origin::Inspector => {}
                }
            }
            MessageType::RuntimeAddComponent => {
                let Ok(body) = bincode::deserialize::<RuntimeAddComponent>(rest) else { return };
                let succeed = self.entities.add_component(body.entity_id, body.component_id, body.payload).succeeded();
                match origin {
                    Origin::ServerWorker => respond!(self.server_router, self.server_transport, RuntimeAddComponentResponse { succeed }),
                    Origin::ClientWorker => respond!(self.client_router, self.client_transport, RuntimeAddComponentResponse { succeed }),
                    Origin::Inspector => {}
                }
            }
            MessageType::RuntimeRemoveComponent => {
                let Ok(body) = bincode::deserialize::<RuntimeRemoveComponent>(rest) else { return };
                let succeed = self.entities.remove_component(body.entity_id, body.component_id).succeeded();
                match origin {
                    Origin::ServerWorker => respond!(self.server_router, self.server_transport, RuntimeRemoveComponentResponse { succeed }),
                    Origin::ClientWorker => respond!(self.client_router, self.client_transport, RuntimeRemoveComponentResponse { succeed }),
                    Origin::Inspector => {}
                }
            }
            MessageType::RuntimeComponentUpdate => {
                let Ok(body) = bincode::deserialize::<RuntimeComponentUpdate>(rest) else { return };
                self.handle_component_update(peer, body, now);
            }
            MessageType::RuntimeComponentInterestQueryUpdate => {
                let Ok(body) = bincode::deserialize::<RuntimeComponentInterestQueryUpdate>(rest) else { return };
                self.handle_interest_query_update(peer, body);
            }
            MessageType::RuntimeWorkerReportAcknowledge => {
                let Ok(body) = bincode::deserialize::<RuntimeWorkerReportAcknowledge>(rest) else { return };
                self.handle_worker_report(peer, body, now);
            }
            MessageType::RuntimeGetEntitiesInfo => {
                let _ = bincode::deserialize::<RuntimeGetEntitiesInfo>(rest);
                self.handle_get_entities_info(peer, header.request_index, now);
            }
            MessageType::RuntimeGetCellsInfos => {
                let _ = bincode::deserialize::<RuntimeGetCellsInfos>(rest);
                self.handle_get_cells_infos(peer, header.request_index, now);
            }
            MessageType::RuntimeGetWorkersInfos => {
                let _ = bincode::deserialize::<RuntimeGetWorkersInfos>(rest);
                self.handle_get_workers_infos(peer, header.request_index, now);
            }
            MessageType::RuntimeInspectorQuery => {
                let Ok(body) = bincode::deserialize::<RuntimeInspectorQuery>(rest) else { return };
                self.handle_inspector_query(peer, header.request_index, body, now);
            }
            MessageType::SpawnWorkerForLayer => {
                // Only the runtime originates this request; a response arriving here means a
                // spawner answered one of ours.
                if !header.is_request {
                    let Ok(body) = bincode::deserialize::<SpawnWorkerForLayerResponse>(rest) else { return };
                    self.handle_spawner_response(peer, header.request_index, body);
                }
            }
            // Runtime -> Worker pushes never arrive inbound; a peer sending one is a protocol
            // violation, dropped with a warning since there's no response to give it.
            MessageType::WorkerAddComponent
            | MessageType::WorkerRemoveComponent
            | MessageType::WorkerLayerAuthorityGain
            | MessageType::WorkerLayerAuthorityLost
            | MessageType::RuntimeComponentInterestQueryResult => {
                debug!(?peer, message_type = ?header.message_type, "dropped unexpected inbound runtime-originated type");
            }
        }
    }

    // -----------------------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------------------

    fn handle_authentication(&mut self, kind: WorkerKind, layer_id: LayerId, client_hash: u64, peer: SocketAddr, now: Instant) -> bool {
        let Some(layer_index) = self.config.layer_index_by_id(layer_id) else {
            debug!(layer_id, "authentication for unknown layer rejected");
            return false;
        };
        let worker_id = self.bridges.bridge_mut(layer_index).insert(WorkerReference::new(layer_id, client_hash, kind, peer, now));
        self.world.register_worker(layer_index, worker_id);
        if let Some(spawner) = self.spawners.first_mut() {
            spawner.acknowledge_worker_spawn(layer_id);
        }
        true
    }

    fn handle_log_message(&self, peer: SocketAddr, msg: RuntimeLogMessage) {
        match msg.level {
            LogLevel::Trace => tracing::trace!(?peer, "{}", msg.message),
            LogLevel::Debug => tracing::debug!(?peer, "{}", msg.message),
            LogLevel::Info => tracing::info!(?peer, "{}", msg.message),
            LogLevel::Warning => tracing::warn!(?peer, "{}", msg.message),
            LogLevel::Critical => tracing::error!(?peer, "{}", msg.message),
        }
    }

    fn handle_add_entity(&mut self, body: RuntimeAddEntity, now: Instant) -> bool {
        let payload = AddEntityPayload { components: body.components };
        let outcome = self.entities.add_entity(body.entity_id, payload);
        if !outcome.succeeded() {
            return false;
        }
        let coord = self.world.insert_entity(&self.config, body.entity_id, body.position);
        self.entities.set_cell_ref(body.entity_id, Some(coord));
        if let Some(record) = self.entities.get_mut(body.entity_id) {
            record.position = body.position;
        }
        let events = self.new_assignment_events(body.entity_id);
        self.dispatch_controller_events(events, now);
        true
    }

    /// Per the Open Question #4 resolution (`SPEC_FULL.md` §6): emits `AuthorityLost` to every
    /// worker still holding authority over this entity before actually removing it.
    fn handle_remove_entity(&mut self, entity_id: crate::entity::EntityId, now: Instant) -> bool {
        let Some(record) = self.entities.get(entity_id) else {
            return false;
        };
        let cell_ref = record.cell_ref;
        let present_layers = record.present_layers(&self.config);

        let mut events = Vec::new();
        if let Some(cell) = cell_ref.and_then(|c| self.world.cell(c)) {
            for layer_id in &present_layers {
                let Some(idx) = self.config.layer_index_by_id(*layer_id) else { continue };
                if let Some(owner) = cell.layer_owner.get(idx).copied().flatten() {
                    events.push(ControllerEvent::AuthorityLost { entity: entity_id, layer: *layer_id, worker: owner });
                }
            }
        }
        self.dispatch_controller_events(events, now);

        self.world.remove_entity(cell_ref, entity_id);
        self.entities.remove_entity(entity_id);
        self.query_engine.mark_entity_gone(entity_id);
        true
    }

    /// Authority check + apply for a fire-and-forget component update: a stale update from a
    /// worker that already lost authority for `(entity, layer_of(component))` is silently
    /// dropped rather than nacked, since there's no response channel for it anyway.
    fn handle_component_update(&mut self, peer: SocketAddr, msg: RuntimeComponentUpdate, now: Instant) {
        let Some(layer_index) = self.config.layer_index_of(msg.component_id) else {
            return;
        };
        let Some(cell_ref) = self.entities.get(msg.entity_id).and_then(|r| r.cell_ref) else {
            return;
        };
        let Some(owner) = self.world.cell(cell_ref).and_then(|c| c.layer_owner.get(layer_index).copied().flatten()) else {
            return;
        };
        let Some((sender_layer_index, sender_worker_id)) = self.bridges.find_by_addr(peer) else {
            return;
        };
        if sender_layer_index != layer_index || sender_worker_id != owner {
            debug!(entity = ?msg.entity_id, component = msg.component_id, "dropped stale component update: sender not authoritative");
            return;
        }

        let new_pos = msg.position;
        let result = self.entities.update_component(msg.entity_id, msg.component_id, msg.payload, new_pos, Some(owner));
        let UpdateComponentResult::Applied { position_changed } = result else {
            return;
        };
        if !position_changed {
            return;
        }
        let Some(new_pos) = new_pos else { return };

        let mut events = Vec::new();
        if let Some(new_coord) = self.world.move_entity(&self.config, &self.entities, msg.entity_id, cell_ref, new_pos, &mut events) {
            self.entities.set_cell_ref(msg.entity_id, Some(new_coord));
        }
        self.dispatch_controller_events(events, now);
    }

    fn handle_interest_query_update(&mut self, peer: SocketAddr, msg: RuntimeComponentInterestQueryUpdate) {
        let Some(layer_index) = self.config.layer_index_of(msg.component_id) else {
            return;
        };
        let Some(cell_ref) = self.entities.get(msg.entity_id).and_then(|r| r.cell_ref) else {
            return;
        };
        let Some(owner) = self.world.cell(cell_ref).and_then(|c| c.layer_owner.get(layer_index).copied().flatten()) else {
            return;
        };
        let Some((sender_layer_index, sender_worker_id)) = self.bridges.find_by_addr(peer) else {
            return;
        };
        if sender_layer_index != layer_index || sender_worker_id != owner {
            debug!(entity = ?msg.entity_id, component = msg.component_id, "dropped stale interest-query update: sender not authoritative");
            return;
        }
        self.query_engine.update_interest(&mut self.entities, msg.entity_id, msg.component_id, msg.queries);
    }

    fn handle_worker_report(&mut self, peer: SocketAddr, msg: RuntimeWorkerReportAcknowledge, now: Instant) {
        let Some((layer_index, worker_id)) = self.bridges.find_by_addr(peer) else {
            return;
        };
        if let Some(bridge) = self.bridges.bridge_mut(layer_index).get_mut(worker_id) {
            bridge.traffic.record_in(now, 0);
        }
        let Some(info) = self.world.layer_state(layer_index).and_then(|l| l.get(worker_id)) else {
            return;
        };
        if info.entity_count != msg.entities_owned {
            warn!(
                worker_reported = msg.entities_owned,
                runtime_tracked = info.entity_count,
                "worker self-report disagrees with the runtime's own entity count"
            );
        }
    }

    fn handle_spawner_response(&mut self, peer: SocketAddr, request_index: u64, response: SpawnWorkerForLayerResponse) {
        let Some(spawner) = self.spawners.iter_mut().find(|s| s.addr == peer) else {
            return;
        };
        let Some(pending) = self.server_router.take_pending(peer, request_index) else {
            return;
        };
        if pending.message_type != MessageType::SpawnWorkerForLayer {
            return;
        }
        // The layer a given pending request targeted isn't carried by `PendingRequest`; find it
        // through whichever layer this spawner still has in flight at this index.
        for layer_id in 0..crate::config::MAX_LAYERS as u64 {
            if spawner.is_pending(layer_id) == Some(request_index) {
                spawner.handle_response(layer_id, response);
                return;
            }
        }
    }

    // -----------------------------------------------------------------------------------
    // Inspector handlers
    // -----------------------------------------------------------------------------------

    fn handle_get_entities_info(&mut self, peer: SocketAddr, request_index: u64, now: Instant) {
        let entities: Vec<EntityInfo> = self
            .entities
            .iter()
            .map(|(id, record)| EntityInfo { entity_id: id, mask: record.mask(), position: record.position })
            .collect();
        let chunks = protocol::chunk_by_budget(entities, |e| e.components_size_hint(), 500);
        let total = chunks.len();
        if total == 0 {
            let response = RuntimeGetEntitiesInfoResponse { entities: Vec::new(), more: false };
            let _ = self.inspector_router.send_response(&mut self.inspector_transport, peer, request_index, &response, now);
            return;
        }
        for (i, chunk) in chunks.into_iter().enumerate() {
            let response = RuntimeGetEntitiesInfoResponse { entities: chunk, more: i + 1 < total };
            let _ = self.inspector_router.send_response(&mut self.inspector_transport, peer, request_index, &response, now);
        }
    }

    fn handle_get_cells_infos(&mut self, peer: SocketAddr, request_index: u64, now: Instant) {
        let hashes: std::collections::HashMap<crate::worker::WorkerId, u64> =
            self.bridges.iter().flat_map(|(_, bridge)| bridge.iter().map(|(id, w)| (id, w.client_hash))).collect();
        let cells: Vec<CellInfo> = self
            .world
            .cells_in_rect(crate::world::cell::CellCoord::new(i32::MIN / 2, i32::MIN / 2), crate::world::cell::CellCoord::new(i32::MAX / 2, i32::MAX / 2))
            .map(|cell| CellInfo {
                coordinates: (cell.coordinates.x, cell.coordinates.y),
                entity_count: cell.entities.len() as u32,
                layer_owners: cell.layer_owner.iter().map(|o| o.and_then(|w| hashes.get(&w).copied())).collect(),
            })
            .collect();
        let chunks = protocol::chunk_by_budget(cells, |_| 40, 500);
        let total = chunks.len().max(1);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let response = RuntimeGetCellsInfosResponse { cells: chunk, more: i + 1 < total };
            let _ = self.inspector_router.send_response(&mut self.inspector_transport, peer, request_index, &response, now);
        }
    }

    fn handle_get_workers_infos(&mut self, peer: SocketAddr, request_index: u64, now: Instant) {
        let mut workers = Vec::new();
        for (layer_index, bridge) in self.bridges.iter() {
            let Some(layer_cfg) = self.config.layer_by_index(layer_index) else { continue };
            for (worker_id, reference) in bridge.iter() {
                let entity_count = self.world.layer_state(layer_index).and_then(|l| l.get(worker_id)).map(|i| i.entity_count).unwrap_or(0);
                let traffic = reference.traffic_stats();
                workers.push(WorkerInfo {
                    layer_id: layer_cfg.id,
                    client_hash: reference.client_hash,
                    entity_count,
                    bytes_in_per_sec: traffic.bytes_in_per_sec,
                    bytes_out_per_sec: traffic.bytes_out_per_sec,
                });
            }
        }
        let chunks = protocol::chunk_by_budget(workers, |_| 32, 500);
        let total = chunks.len().max(1);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let response = RuntimeGetWorkersInfosResponse { workers: chunk, more: i + 1 < total };
            let _ = self.inspector_router.send_response(&mut self.inspector_transport, peer, request_index, &response, now);
        }
    }

    fn handle_inspector_query(&mut self, peer: SocketAddr, request_index: u64, body: RuntimeInspectorQuery, now: Instant) {
        let ctx = crate::query::EvalContext { config: &self.config, world: &self.world, entities: &self.entities, origin: body.origin };
        let matched = body.query.root.evaluate(&ctx, None);
        let mut matches: Vec<InspectorQueryMatch> = Vec::new();
        for entity_id in matched {
            let Some(record) = self.entities.get(entity_id) else { continue };
            let components: Vec<(ComponentId, Vec<u8>)> = body
                .query
                .component_mask
                .iter()
                .filter_map(|cid| record.payload(cid).map(|p| (cid, p.to_vec())))
                .collect();
            if !components.is_empty() {
                matches.push(InspectorQueryMatch { entity_id, components });
            }
        }
        let chunks = protocol::chunk_by_budget(matches, |m| m.components.iter().map(|(_, p)| p.len() + 1).sum::<usize>() + 8, 500);
        let total = chunks.len().max(1);
        if chunks.is_empty() {
            let response = RuntimeInspectorQueryResponse { matches: Vec::new(), more: false };
            let _ = self.inspector_router.send_response(&mut self.inspector_transport, peer, request_index, &response, now);
            return;
        }
        for (i, chunk) in chunks.into_iter().enumerate() {
            let response = RuntimeInspectorQueryResponse { matches: chunk, more: i + 1 < total };
            let _ = self.inspector_router.send_response(&mut self.inspector_transport, peer, request_index, &response, now);
        }
    }
}

impl EntityInfo {
    /// Rough serialized-size estimate for inspector-response chunking: a fixed header plus
    /// nothing variable-length (unlike [`InspectorQueryMatch`], `EntityInfo` carries no
    /// component bytes), so this is effectively a fixed-size-item chunk.
    fn components_size_hint(&self) -> usize {
        24
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AttributeType, ComponentConfig, DeploymentConfig, LayerConfig};
    use crate::entity::EntityId;
    use indexmap::IndexMap;
    use smol_str::SmolStr;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_config() -> Config {
        let deployment = DeploymentConfig {
            maximum_world_length: 1024,
            worker_length: 64,
            uses_centralized_world_origin: true,
            runtime_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            client_worker_listen_port: 0,
            server_worker_listen_port: 0,
            inspector_listen_port: 0,
            thread_pool_size: 1,
        };
        let mut attributes = IndexMap::new();
        attributes.insert(SmolStr::new("x"), AttributeType::I32);
        let layers = vec![LayerConfig {
            name: SmolStr::new("spatial"),
            id: 1,
            user_layer: true,
            use_spatial_area: true,
            maximum_entities_per_worker: Some(1000),
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
    fn authenticate_add_entity_sends_authority_gain_to_worker() {
        let now = Instant::now();
        let mut runtime = Runtime::new(test_config(), now).unwrap();
        let worker_peer: SocketAddr = "127.0.0.1:31000".parse().unwrap();

        let auth = RuntimeAuthentication { layer_id: 1, client_hash: 42 };
        let bytes = protocol::encode(0, true, &auth).unwrap();
        runtime.handle_delivery(Origin::ServerWorker, worker_peer, &bytes, now);
        assert_eq!(runtime.bridges.bridge(0).unwrap().len(), 1);

        let add = RuntimeAddEntity { entity_id: EntityId(1), components: vec![(0, vec![1, 2, 3])], position: (0, 0) };
        let bytes = protocol::encode(1, true, &add).unwrap();
        runtime.handle_delivery(Origin::ServerWorker, worker_peer, &bytes, now);
        assert!(runtime.entities.contains(EntityId(1)));
        assert!(runtime.server_transport.peer_count() >= 1);
    }

    #[test]
    fn remove_entity_clears_it_from_the_store() {
        let now = Instant::now();
        let mut runtime = Runtime::new(test_config(), now).unwrap();
        let worker_peer: SocketAddr = "127.0.0.1:31001".parse().unwrap();
        let auth = RuntimeAuthentication { layer_id: 1, client_hash: 1 };
        runtime.handle_delivery(Origin::ServerWorker, worker_peer, &protocol::encode(0, true, &auth).unwrap(), now);
        let add = RuntimeAddEntity { entity_id: EntityId(9), components: vec![(0, vec![9])], position: (0, 0) };
        runtime.handle_delivery(Origin::ServerWorker, worker_peer, &protocol::encode(1, true, &add).unwrap(), now);
        assert!(runtime.entities.contains(EntityId(9)));

        let remove = RuntimeRemoveEntity { entity_id: EntityId(9) };
        runtime.handle_delivery(Origin::ServerWorker, worker_peer, &protocol::encode(2, true, &remove).unwrap(), now);
        assert!(!runtime.entities.contains(EntityId(9)));
    }

    #[test]
    fn stale_component_update_from_non_owner_is_dropped() {
        let now = Instant::now();
        let mut runtime = Runtime::new(test_config(), now).unwrap();
        let owner: SocketAddr = "127.0.0.1:31002".parse().unwrap();
        let impostor: SocketAddr = "127.0.0.1:31003".parse().unwrap();

        let auth = RuntimeAuthentication { layer_id: 1, client_hash: 1 };
        runtime.handle_delivery(Origin::ServerWorker, owner, &protocol::encode(0, true, &auth).unwrap(), now);
        let add = RuntimeAddEntity { entity_id: EntityId(5), components: vec![(0, vec![1])], position: (0, 0) };
        runtime.handle_delivery(Origin::ServerWorker, owner, &protocol::encode(1, true, &add).unwrap(), now);

        // `impostor` never authenticated, so it can't possibly be the recorded owner; its
        // update must be dropped rather than applied.
        let update = RuntimeComponentUpdate { entity_id: EntityId(5), component_id: 0, payload: vec![99], position: None };
        runtime.handle_delivery(Origin::ServerWorker, impostor, &protocol::encode(2, true, &update).unwrap(), now);
        assert_eq!(runtime.entities.get(EntityId(5)).unwrap().payload(0), Some(&[1u8][..]));
    }
}
