//! C1: reliable UDP transport. One [`Transport`] per listening socket (client-worker,
//! server-worker, inspector, or a spawner's own loopback connection); each manages one
//! [`channel::ReliableChannel`] per peer address, created lazily.
//!
//! Plain, non-async I/O throughout (no tokio/mio anywhere in the dependency stack): a
//! non-blocking `std::net::UdpSocket` polled once per orchestrator tick.

pub mod channel;
pub mod heartbeat;

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::error::TransportError;
use channel::ReliableChannel;
pub use heartbeat::{detect_timeouts, PeerTimeout};

/// Fragmentation threshold: fixed MTU, 2048 bytes by default.
pub const MTU: usize = 2048;
pub const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(150);
/// `ping_window_ms` default: how long a channel may go without sending user traffic before
/// it sends a heartbeat keep-alive instead.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);
/// `timeout_ms` default: silence past this marks a peer timed out, delivering a single
/// callback to the upper layer.
pub const PEER_TIMEOUT: Duration = Duration::from_millis(500);
/// The server grants `8 x timeout_ms` additional grace past [`PEER_TIMEOUT`] before the
/// channel's state is actually freed, separate from (and later than) the single upper-layer
/// timeout callback.
pub const PEER_TIMEOUT_GRACE: Duration = Duration::from_millis(500 * 8);

/// A received, fully reassembled, in-order application message.
pub struct Delivery {
    pub peer: SocketAddr,
    pub bytes: Vec<u8>,
}

/// A non-blocking UDP socket plus one reliable channel per peer.
pub struct Transport {
    socket: UdpSocket,
    channels: AHashMap<SocketAddr, ReliableChannel>,
    /// Peers already handed their single timeout callback, awaiting [`PEER_TIMEOUT_GRACE`]
    /// before their channel state is actually freed.
    timed_out: AHashMap<SocketAddr, Instant>,
}

impl Transport {
    pub fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).map_err(|e| TransportError::Bind(addr, e))?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket, channels: AHashMap::new(), timed_out: AHashMap::new() })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn is_connected(&self, peer: SocketAddr) -> bool {
        self.channels.contains_key(&peer)
    }

    /// Queues `message` for reliable-ordered delivery, creating the peer's channel on first use.
    pub fn send_reliable(&mut self, peer: SocketAddr, message: Vec<u8>, now: Instant) {
        self.channels.entry(peer).or_insert_with(|| ReliableChannel::new(now)).queue(message, now);
    }

    /// Sends every channel's due retransmits, owed acks, and heartbeats. Returns total bytes written.
    pub fn flush(&mut self, now: Instant) -> io::Result<u32> {
        let mut bytes_out = 0u32;
        for (&peer, channel) in self.channels.iter_mut() {
            for packet in channel.packets_to_send(now) {
                bytes_out += packet.len() as u32;
                self.socket.send_to(&packet, peer)?;
            }
        }
        Ok(bytes_out)
    }

    /// Drains the OS socket buffer. Returns every newly in-order application message plus the
    /// total bytes received, for the worker's per-second traffic counters.
    pub fn poll(&mut self, now: Instant) -> (Vec<Delivery>, u32) {
        let mut deliveries = Vec::new();
        let mut bytes_in = 0u32;
        let mut buf = [0u8; 2048];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, peer)) => {
                    bytes_in += len as u32;
                    // Traffic from a peer already past its timeout callback still reaches it
                    // during the grace window, but it's logically gone to the upper layer --
                    // a fresh authentication is what brings it back, not a stray late packet.
                    if self.timed_out.contains_key(&peer) {
                        continue;
                    }
                    let channel = self.channels.entry(peer).or_insert_with(|| ReliableChannel::new(now));
                    channel.last_recv_at = now;
                    let mut ready = Vec::new();
                    channel.on_datagram(&buf[..len], &mut ready);
                    deliveries.extend(ready.into_iter().map(|bytes| Delivery { peer, bytes }));
                }
                // A prior send to an unreachable peer surfaces here on some platforms; the
                // peer is reaped by the ordinary heartbeat timeout instead.
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        (deliveries, bytes_in)
    }

    /// Peers silent for longer than [`PEER_TIMEOUT`] that haven't already been notified once
    /// -- a single timeout callback per peer. Their channel state stays around for
    /// [`PEER_TIMEOUT_GRACE`] more before [`Self::prune_expired_channels`] actually frees it.
    pub fn reap_timed_out(&mut self, now: Instant) -> Vec<SocketAddr> {
        let dead = detect_timeouts(
            self.channels.iter().map(|(&addr, c)| (addr, c.last_recv_at)),
            now,
            PEER_TIMEOUT,
        );
        let mut newly_notified = Vec::new();
        for timeout in dead {
            if self.timed_out.insert(timeout.peer, now).is_none() {
                newly_notified.push(timeout.peer);
            }
        }
        self.prune_expired_channels(now);
        newly_notified
    }

    /// Frees the channel state of peers whose grace window has elapsed since their timeout
    /// callback. Separate from [`Self::reap_timed_out`] so the callback fires exactly once.
    fn prune_expired_channels(&mut self, now: Instant) {
        let expired: Vec<SocketAddr> = self
            .timed_out
            .iter()
            .filter(|(_, &notified_at)| now.saturating_duration_since(notified_at) >= PEER_TIMEOUT_GRACE)
            .map(|(&peer, _)| peer)
            .collect();
        for peer in expired {
            self.timed_out.remove(&peer);
            self.channels.remove(&peer);
        }
    }

    pub fn disconnect(&mut self, peer: SocketAddr) {
        self.channels.remove(&peer);
        self.timed_out.remove(&peer);
    }

    pub fn peer_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_round_trip_delivers_reliably() {
        let mut a = Transport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut b = Transport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b_addr = b.local_addr().unwrap();
        let now = Instant::now();

        a.send_reliable(b_addr, b"hello".to_vec(), now);
        a.flush(now).unwrap();

        // Give the OS a moment to deliver the loopback datagram.
        std::thread::sleep(Duration::from_millis(20));
        let (deliveries, bytes_in) = b.poll(Instant::now());
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].bytes, b"hello".to_vec());
        assert!(bytes_in > 0);
    }
}
