//! C2: request/response framing on top of [`crate::transport::Transport`].
//!
//! Per-peer monotonic `request_index` assignment on send, and a pending-response table keyed
//! by `(peer, request_index)` for the runtime's own outbound requests (currently only
//! `SpawnWorkerForLayer`) so a later response can be matched back to what was asked. Most
//! worker->runtime traffic is itself the request half of a pair the *worker* assigned the
//! index for, so the runtime only echoes that index back in its response -- it never
//! allocates one for those. This module is the thin bookkeeping layer; the orchestrator
//! (`src/orchestrator.rs`) owns the actual per-type dispatch.

use std::net::SocketAddr;
use std::time::Instant;

use ahash::AHashMap;
use serde::Serialize;

use crate::error::WireError;
use crate::protocol::{self, MessageType, WireMessage};
use crate::transport::Transport;

/// An outbound request this side is waiting on a response for.
#[derive(Debug, Clone, Copy)]
pub struct PendingRequest {
    pub message_type: MessageType,
    pub sent_at: Instant,
}

/// Per-peer `request_index` counters and the pending-response table for requests this side
/// originated.
#[derive(Default)]
pub struct RequestRouter {
    next_index: AHashMap<SocketAddr, u64>,
    pending: AHashMap<(SocketAddr, u64), PendingRequest>,
}

impl RequestRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_index(&mut self, peer: SocketAddr) -> u64 {
        let entry = self.next_index.entry(peer).or_insert(0);
        let index = *entry;
        *entry += 1;
        index
    }

    /// Queues a fire-and-forget message: no timeout is synthesized for it. Assigns this
    /// peer's next index, encodes, and hands it to `transport`.
    pub fn send_oneway<T: Serialize + WireMessage>(
        &mut self,
        transport: &mut Transport,
        peer: SocketAddr,
        body: &T,
        now: Instant,
    ) -> Result<(), WireError> {
        let index = self.next_index(peer);
        let bytes = protocol::encode(index, true, body)?;
        transport.send_reliable(peer, bytes, now);
        Ok(())
    }

    /// Queues a request this side expects a response to, recording it in the pending table.
    pub fn send_request<T: Serialize + WireMessage>(
        &mut self,
        transport: &mut Transport,
        peer: SocketAddr,
        body: &T,
        now: Instant,
    ) -> Result<u64, WireError> {
        let index = self.next_index(peer);
        let bytes = protocol::encode(index, true, body)?;
        transport.send_reliable(peer, bytes, now);
        self.pending.insert((peer, index), PendingRequest { message_type: T::TYPE, sent_at: now });
        Ok(index)
    }

    /// Sends a response body, echoing back the request's own index -- responses carry the
    /// requester-assigned index, not one this side allocates.
    pub fn send_response<T: Serialize + WireMessage>(
        &self,
        transport: &mut Transport,
        peer: SocketAddr,
        request_index: u64,
        body: &T,
        now: Instant,
    ) -> Result<(), WireError> {
        let bytes = protocol::encode(request_index, false, body)?;
        transport.send_reliable(peer, bytes, now);
        Ok(())
    }

    /// Matches an incoming response against this side's pending table, removing it.
    pub fn take_pending(&mut self, peer: SocketAddr, request_index: u64) -> Option<PendingRequest> {
        self.pending.remove(&(peer, request_index))
    }

    /// Drops every pending request addressed to `peer` (disconnect/timeout cleanup), returning
    /// them so the caller can deliver a timeout outcome to whatever was waiting.
    pub fn purge_peer(&mut self, peer: SocketAddr) -> Vec<PendingRequest> {
        self.next_index.remove(&peer);
        let mut drained = Vec::new();
        self.pending.retain(|&(p, _), &mut req| {
            if p == peer {
                drained.push(req);
                false
            } else {
                true
            }
        });
        drained
    }
}
