//! C8: the runtime's side of a spawner-process conversation.
//!
//! A thin wrapper holding a channel plus a small amount of per-subject state, keyed by
//! [`LayerId`] instead of by worker. One [`SpawnerClient`] talks to one configured spawner
//! endpoint; the orchestrator owns one per entry in `config.spawners` and currently always
//! issues through the first (see `DESIGN.md` for the open question this leaves unaddressed:
//! load-balancing across multiple spawners was never specified).

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::config::LayerId;
use crate::error::WireError;
use crate::protocol::{SpawnWorkerForLayer, SpawnWorkerForLayerResponse};
use crate::router::RequestRouter;
use crate::transport::Transport;

struct PendingSpawnRequest {
    requested_at: Instant,
    timeout: Duration,
    request_index: u64,
}

/// Tracks in-flight `SpawnWorkerForLayer` requests to one spawner endpoint, per layer.
pub struct SpawnerClient {
    pub addr: SocketAddr,
    pending: AHashMap<LayerId, PendingSpawnRequest>,
}

impl SpawnerClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, pending: AHashMap::new() }
    }

    /// `request_worker(layer_id, timeout)`: sends `SpawnWorkerForLayer` unless one is already
    /// in flight for this layer, suppressing duplicate requests. Returns `true` if a request
    /// was actually sent.
    pub fn request_worker(
        &mut self,
        router: &mut RequestRouter,
        transport: &mut Transport,
        layer_id: LayerId,
        timeout: Duration,
        now: Instant,
    ) -> Result<bool, WireError> {
        if self.pending.contains_key(&layer_id) {
            return Ok(false);
        }
        let request_index = router.send_request(transport, self.addr, &SpawnWorkerForLayer { layer_id }, now)?;
        self.pending.insert(layer_id, PendingSpawnRequest { requested_at: now, timeout, request_index });
        Ok(true)
    }

    /// Clears pending state on successful authentication of a new worker for `layer_id` --
    /// called by the orchestrator's authentication handler, not by the spawner's response,
    /// since a `succeed=true` response only means the spawner accepted the request, not that
    /// the worker has connected yet.
    pub fn acknowledge_worker_spawn(&mut self, layer_id: LayerId) {
        self.pending.remove(&layer_id);
    }

    /// A spawner outright refused the request (`succeed=false`): clear the in-flight guard
    /// immediately so the next rebalance pass can retry instead of waiting out the timeout.
    pub fn on_refused(&mut self, layer_id: LayerId) {
        self.pending.remove(&layer_id);
    }

    pub fn is_pending(&self, layer_id: LayerId) -> Option<u64> {
        self.pending.get(&layer_id).map(|p| p.request_index)
    }

    /// Expires any pending request that has outlived its `timeout_ms`, per layer, so the next
    /// `request_worker` call for it is allowed to retry. Returns the layers that just expired.
    pub fn tick(&mut self, now: Instant) -> Vec<LayerId> {
        let expired: Vec<LayerId> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.requested_at) >= p.timeout)
            .map(|(&layer, _)| layer)
            .collect();
        for layer in &expired {
            self.pending.remove(layer);
        }
        expired
    }

    pub fn handle_response(&mut self, layer_id: LayerId, response: SpawnWorkerForLayerResponse) {
        if !response.succeed {
            self.on_refused(layer_id);
        }
    }
}
