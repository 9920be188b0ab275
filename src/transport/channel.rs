//! One peer's reliable-ordered channel: fragmentation, reassembly, ack-driven retransmit,
//! and the heartbeat piggybacked onto it.
//!
//! Reliable UDP: per-peer channel, in-order delivery, MTU-bounded fragmentation, acks at
//! message granularity. The retransmit timer uses `saturating_duration_since` so a channel
//! that hasn't been flushed in a while (a stalled runtime tick, a debugger pause) never
//! panics on subtraction underflow -- it just retransmits everything overdue on the next
//! flush.

use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::protocol::HEARTBEAT_PAYLOAD;

use super::{HEARTBEAT_INTERVAL, MTU, RETRANSMIT_INTERVAL};

const KIND_DATA: u8 = 0;
const KIND_FRAGMENT: u8 = 1;
const KIND_ACK: u8 = 2;

/// Bytes of packet header budget per fragment: kind(1) + seq(4) + frag_index(2) + frag_count(2).
const FRAGMENT_HEADER_LEN: usize = 1 + 4 + 2 + 2;
const DATA_HEADER_LEN: usize = 1 + 4;

/// Fast-retransmit after this many acks arrive for a later-numbered message while an earlier
/// one is still outstanding.
const FAST_RETRANSMIT_THRESHOLD: u32 = 2;

struct PendingMessage {
    /// Pre-split wire packets (either one `KIND_DATA` packet or several `KIND_FRAGMENT` ones).
    packets: Vec<Vec<u8>>,
    last_sent: Instant,
    /// Bumped each time a later seq gets acked while this one hasn't been.
    skipped_by_later_ack: u32,
}

struct Reassembly {
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
}

/// Per-peer reliable-ordered channel. Created lazily on first send or first received datagram.
pub struct ReliableChannel {
    next_send_seq: u32,
    pending: AHashMap<u32, PendingMessage>,

    recv_next_expected: u32,
    reorder_buffer: AHashMap<u32, Vec<u8>>,
    reassembling: AHashMap<u32, Reassembly>,
    /// Seqs fully reassembled but not yet drained into `reorder_buffer`'s owner -- acked
    /// immediately on completion, independent of in-order delivery.
    acked_complete: Vec<u32>,

    pub last_recv_at: Instant,
    last_heartbeat_sent: Instant,
}

impl ReliableChannel {
    pub fn new(now: Instant) -> Self {
        Self {
            next_send_seq: 0,
            pending: AHashMap::new(),
            recv_next_expected: 0,
            reorder_buffer: AHashMap::new(),
            reassembling: AHashMap::new(),
            acked_complete: Vec::new(),
            last_recv_at: now,
            last_heartbeat_sent: now,
        }
    }

    /// Splits `payload` into wire packets and queues it for reliable send.
    pub fn queue(&mut self, payload: Vec<u8>, now: Instant) {
        let seq = self.next_send_seq;
        self.next_send_seq = self.next_send_seq.wrapping_add(1);

        let packets = if DATA_HEADER_LEN + payload.len() <= MTU {
            let mut packet = Vec::with_capacity(DATA_HEADER_LEN + payload.len());
            packet.push(KIND_DATA);
            packet.extend_from_slice(&seq.to_le_bytes());
            packet.extend_from_slice(&payload);
            vec![packet]
        } else {
            let chunk_size = MTU - FRAGMENT_HEADER_LEN;
            let chunks: Vec<&[u8]> = payload.chunks(chunk_size).collect();
            let frag_count = chunks.len() as u16;
            chunks
                .iter()
                .enumerate()
                .map(|(idx, chunk)| {
                    let mut packet = Vec::with_capacity(FRAGMENT_HEADER_LEN + chunk.len());
                    packet.push(KIND_FRAGMENT);
                    packet.extend_from_slice(&seq.to_le_bytes());
                    packet.extend_from_slice(&(idx as u16).to_le_bytes());
                    packet.extend_from_slice(&frag_count.to_le_bytes());
                    packet.extend_from_slice(chunk);
                    packet
                })
                .collect()
        };

        self.pending.insert(
            seq,
            PendingMessage { packets, last_sent: now - RETRANSMIT_INTERVAL, skipped_by_later_ack: 0 },
        );
    }

    /// Every packet that needs to go on the wire this flush: due retransmits/first sends of
    /// pending messages, any acks owed for completed reassemblies, and a heartbeat if the
    /// interval elapsed and nothing else was sent.
    pub fn packets_to_send(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let mut out = Vec::new();

        let lowest_outstanding_seq = self.pending.keys().min().copied();
        for (&seq, pending) in self.pending.iter_mut() {
            let overdue = now.saturating_duration_since(pending.last_sent) >= RETRANSMIT_INTERVAL;
            let fast = Some(seq) == lowest_outstanding_seq && pending.skipped_by_later_ack >= FAST_RETRANSMIT_THRESHOLD;
            if overdue || fast {
                out.extend(pending.packets.iter().cloned());
                pending.last_sent = now;
                pending.skipped_by_later_ack = 0;
            }
        }

        for seq in self.acked_complete.drain(..) {
            let mut packet = Vec::with_capacity(5);
            packet.push(KIND_ACK);
            packet.extend_from_slice(&seq.to_le_bytes());
            out.push(packet);
        }

        if out.is_empty() && now.saturating_duration_since(self.last_heartbeat_sent) >= HEARTBEAT_INTERVAL {
            out.push(HEARTBEAT_PAYLOAD.to_vec());
            self.last_heartbeat_sent = now;
        } else if !out.is_empty() {
            self.last_heartbeat_sent = now;
        }

        out
    }

    fn ack(&mut self, acked_seq: u32) {
        self.pending.remove(&acked_seq);
        for (&seq, pending) in self.pending.iter_mut() {
            if seq < acked_seq {
                pending.skipped_by_later_ack += 1;
            }
        }
    }

    /// Completes a reassembly (or accepts a whole unfragmented message), schedules its ack,
    /// and drains as much of the in-order prefix as is now available into `ready`.
    fn complete(&mut self, seq: u32, payload: Vec<u8>) {
        self.acked_complete.push(seq);
        if seq < self.recv_next_expected {
            return; // duplicate of an already-delivered message; ack again, don't re-deliver.
        }
        self.reorder_buffer.insert(seq, payload);
    }

    fn drain_in_order(&mut self, ready: &mut Vec<Vec<u8>>) {
        while let Some(payload) = self.reorder_buffer.remove(&self.recv_next_expected) {
            ready.push(payload);
            self.recv_next_expected = self.recv_next_expected.wrapping_add(1);
        }
    }

    /// Routes one received datagram, appending any newly-in-order application messages to
    /// `ready`.
    pub fn on_datagram(&mut self, bytes: &[u8], ready: &mut Vec<Vec<u8>>) {
        if bytes.is_empty() {
            return;
        }
        if bytes == HEARTBEAT_PAYLOAD {
            return;
        }
        match bytes[0] {
            KIND_DATA if bytes.len() >= DATA_HEADER_LEN => {
                let seq = u32::from_le_bytes(bytes[1..5].try_into().expect("4-byte slice"));
                self.complete(seq, bytes[DATA_HEADER_LEN..].to_vec());
                self.drain_in_order(ready);
            }
            KIND_FRAGMENT if bytes.len() >= FRAGMENT_HEADER_LEN => {
                let seq = u32::from_le_bytes(bytes[1..5].try_into().expect("4-byte slice"));
                let frag_index = u16::from_le_bytes(bytes[5..7].try_into().expect("2-byte slice")) as usize;
                let frag_count = u16::from_le_bytes(bytes[7..9].try_into().expect("2-byte slice")) as usize;
                let chunk = &bytes[FRAGMENT_HEADER_LEN..];

                if seq < self.recv_next_expected {
                    self.acked_complete.push(seq);
                    return;
                }
                let reassembly = self
                    .reassembling
                    .entry(seq)
                    .or_insert_with(|| Reassembly { parts: vec![None; frag_count], received: 0 });
                if frag_index < reassembly.parts.len() && reassembly.parts[frag_index].is_none() {
                    reassembly.parts[frag_index] = Some(chunk.to_vec());
                    reassembly.received += 1;
                }
                if reassembly.received == reassembly.parts.len() {
                    let reassembly = self.reassembling.remove(&seq).expect("just matched above");
                    let payload: Vec<u8> = reassembly.parts.into_iter().flatten().flatten().collect();
                    self.complete(seq, payload);
                    self.drain_in_order(ready);
                }
            }
            KIND_ACK if bytes.len() >= 5 => {
                let acked_seq = u32::from_le_bytes(bytes[1..5].try_into().expect("4-byte slice"));
                self.ack(acked_seq);
            }
            _ => {}
        }
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_message_round_trips_and_acks_clear_pending() {
        let now = Instant::now();
        let mut sender = ReliableChannel::new(now);
        let mut receiver = ReliableChannel::new(now);

        sender.queue(b"hello".to_vec(), now);
        let packets = sender.packets_to_send(now + Duration::from_secs(1));
        assert_eq!(packets.len(), 1);

        let mut ready = Vec::new();
        receiver.on_datagram(&packets[0], &mut ready);
        assert_eq!(ready, vec![b"hello".to_vec()]);

        let acks = receiver.packets_to_send(now);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0][0], KIND_ACK);

        sender.on_datagram(&acks[0], &mut Vec::new());
        assert_eq!(sender.pending_count(), 0);
    }

    #[test]
    fn fragmented_message_reassembles_out_of_order() {
        let now = Instant::now();
        let mut sender = ReliableChannel::new(now);
        let big = vec![7u8; MTU * 3];
        sender.queue(big.clone(), now);
        let packets = sender.packets_to_send(now + Duration::from_secs(1));
        assert!(packets.len() > 1);

        let mut receiver = ReliableChannel::new(now);
        let mut ready = Vec::new();
        for packet in packets.iter().rev() {
            receiver.on_datagram(packet, &mut ready);
        }
        assert_eq!(ready, vec![big]);
    }

    #[test]
    fn out_of_order_whole_messages_deliver_in_sequence() {
        let now = Instant::now();
        let mut sender = ReliableChannel::new(now);
        sender.queue(b"first".to_vec(), now);
        sender.queue(b"second".to_vec(), now);
        let packets = sender.packets_to_send(now + Duration::from_secs(1));
        assert_eq!(packets.len(), 2);
        // Iteration order over the pending map is unspecified; identify packets by their
        // encoded seq (bytes 1..5) rather than assuming vector order.
        let seq_of = |p: &[u8]| u32::from_le_bytes(p[1..5].try_into().unwrap());
        let (seq0_packet, seq1_packet) = if seq_of(&packets[0]) == 0 {
            (&packets[0], &packets[1])
        } else {
            (&packets[1], &packets[0])
        };

        let mut receiver = ReliableChannel::new(now);
        let mut ready = Vec::new();
        // second arrives before first
        receiver.on_datagram(seq1_packet, &mut ready);
        assert!(ready.is_empty(), "second message must wait for first");
        receiver.on_datagram(seq0_packet, &mut ready);
        assert_eq!(ready, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn idle_channel_sends_the_literal_heartbeat_bytes() {
        let now = Instant::now();
        let mut channel = ReliableChannel::new(now);
        let due = now + HEARTBEAT_INTERVAL;
        let packets = channel.packets_to_send(due);
        assert_eq!(packets, vec![HEARTBEAT_PAYLOAD.to_vec()]);

        // The receiving side recognizes it and doesn't try to deliver or ack it.
        let mut other = ReliableChannel::new(now);
        let mut ready = Vec::new();
        other.on_datagram(&packets[0], &mut ready);
        assert!(ready.is_empty());
        assert!(other.packets_to_send(now).is_empty());
    }

    #[test]
    fn retransmit_only_fires_after_the_interval_elapses() {
        let now = Instant::now();
        let mut sender = ReliableChannel::new(now);
        sender.queue(b"x".to_vec(), now);
        let immediate = sender.packets_to_send(now);
        assert!(!immediate.is_empty(), "first send is never held back by the timer");
        let too_soon = sender.packets_to_send(now + Duration::from_millis(1));
        assert!(too_soon.is_empty());
        let overdue = sender.packets_to_send(now + RETRANSMIT_INTERVAL + Duration::from_millis(1));
        assert!(!overdue.is_empty());
    }
}
