//! Peer liveness tracking built on top of [`super::channel::ReliableChannel`]'s own
//! `last_recv_at` bookkeeping -- kept as its own small module because the orchestrator reasons
//! about "how long has this worker been silent" independently of which channel it is.
//!
//! A connected peer that has sent nothing, not even a heartbeat keep-alive, for
//! `PEER_TIMEOUT` is dropped; the orchestrator's tick reaps timed-out peers before
//! re-running authority bookkeeping.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A disconnect the orchestrator must react to: release authority, notify the spawner, and
/// free the worker's `Bridge` slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerTimeout {
    pub peer: SocketAddr,
    pub silent_for: Duration,
}

pub fn detect_timeouts<'a>(
    peers: impl Iterator<Item = (SocketAddr, Instant)> + 'a,
    now: Instant,
    timeout: Duration,
) -> Vec<PeerTimeout> {
    peers
        .filter_map(|(peer, last_recv_at)| {
            let silent_for = now.saturating_duration_since(last_recv_at);
            (silent_for > timeout).then_some(PeerTimeout { peer, silent_for })
        })
        .collect()
}
