//! C5: per-connected-worker state.
//!
//! A [`WorkerReference`] is created after the auth handshake succeeds and lives in its
//! layer's [`crate::bridge::Bridge`], keyed by a [`WorkerId`] -- a stable index into that
//! bridge's `generational_arena::Arena`, not a raw pointer (Design Notes §9: "replace with
//! arena-allocated indices"). The world controller's `WorkerCellsInfo` stores this
//! same `WorkerId` as its back-pointer instead of a pointer into the bridge.

use std::net::SocketAddr;
use std::time::Instant;

use generational_arena::Index;

use crate::config::LayerId;

/// A stable handle to a [`WorkerReference`] inside its layer's [`crate::bridge::Bridge`].
/// Also reused by the world controller's per-layer worker bookkeeping as its back-pointer, so cells can name an owning worker without
/// holding a reference to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub(crate) Index);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// A worker process authenticated over the server-worker transport (`RuntimeAuthentication`).
    Server,
    /// A peer authenticated over the client-worker transport (`RuntimeClientAuthentication`).
    Client,
}

/// A read-only snapshot of a worker's per-second traffic counters, returned by
/// [`WorkerReference::traffic_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub bytes_in_per_sec: u32,
    pub bytes_out_per_sec: u32,
}

/// Bytes in/out accumulated per second, reset every time a
/// full second elapses. Exposed read-only via [`WorkerReference::traffic`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TrafficCounters {
    pub bytes_in_per_sec: u32,
    pub bytes_out_per_sec: u32,
    bytes_in_accum: u32,
    bytes_out_accum: u32,
    window_started: Option<Instant>,
}

impl TrafficCounters {
    pub fn record_in(&mut self, now: Instant, bytes: u32) {
        self.roll_window(now);
        self.bytes_in_accum += bytes;
    }

    pub fn record_out(&mut self, now: Instant, bytes: u32) {
        self.roll_window(now);
        self.bytes_out_accum += bytes;
    }

    fn roll_window(&mut self, now: Instant) {
        let started = *self.window_started.get_or_insert(now);
        if now.duration_since(started).as_secs() >= 1 {
            self.bytes_in_per_sec = self.bytes_in_accum;
            self.bytes_out_per_sec = self.bytes_out_accum;
            self.bytes_in_accum = 0;
            self.bytes_out_accum = 0;
            self.window_started = Some(now);
        }
    }
}

pub struct WorkerReference {
    pub layer_id: LayerId,
    pub client_hash: u64,
    pub kind: WorkerKind,
    pub addr: SocketAddr,
    pub traffic: TrafficCounters,
    pub connected_at: Instant,
}

impl WorkerReference {
    pub fn new(layer_id: LayerId, client_hash: u64, kind: WorkerKind, addr: SocketAddr, now: Instant) -> Self {
        Self {
            layer_id,
            client_hash,
            kind,
            addr,
            traffic: TrafficCounters::default(),
            connected_at: now,
        }
    }

    /// The worker's current received/sent bytes-per-second pair.
    pub fn traffic_stats(&self) -> TrafficStats {
        TrafficStats {
            bytes_in_per_sec: self.traffic.bytes_in_per_sec,
            bytes_out_per_sec: self.traffic.bytes_out_per_sec,
        }
    }
}
