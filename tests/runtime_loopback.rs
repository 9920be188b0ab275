//! Drives a [`Runtime`] end to end over real loopback UDP sockets, through nothing but its
//! public surface (`Runtime::new`/`tick`/the `*_addr` accessors) -- the only test in this
//! crate that exercises the transport, reliable channel framing, router, and orchestrator
//! dispatch together rather than any one of them in isolation.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use jani_runtime::config::{AttributeType, Config, ComponentConfig, DeploymentConfig, LayerConfig};
use jani_runtime::protocol::{self, MessageType, RuntimeAuthentication, RuntimeAuthenticationResponse};
use jani_runtime::Runtime;

fn config() -> Config {
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
    attributes.insert("x".into(), AttributeType::I32);
    let layers = vec![LayerConfig {
        name: "spatial".into(),
        id: 1,
        user_layer: true,
        use_spatial_area: true,
        maximum_entities_per_worker: Some(1000),
        maximum_workers: Some(4),
        components: vec![ComponentConfig {
            name: "pos".into(),
            id: 0,
            layer_name: "spatial".into(),
            attributes,
        }],
    }];
    Config::new(deployment, layers, vec![]).unwrap()
}

/// Wraps `payload` the way `ReliableChannel::queue` frames a whole (unfragmented) message:
/// a `KIND_DATA` tag byte followed by a 4-byte little-endian sequence number. `seq` only
/// needs to match what the receiving channel expects next (0, for a fresh peer).
fn frame_data(seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut framed = vec![0u8];
    framed.extend_from_slice(&seq.to_le_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Receives datagrams until one framed as `KIND_DATA` turns up (acks, which share the same
/// socket, are framed as `KIND_ACK` and skipped), returning its stripped application payload.
fn recv_data_payload(socket: &UdpSocket) -> Vec<u8> {
    for _ in 0..10 {
        let mut buf = [0u8; 2048];
        let (len, _) = socket.recv_from(&mut buf).expect("expected a reply before the read timeout");
        if len >= 5 && buf[0] == 0 {
            return buf[5..len].to_vec();
        }
    }
    panic!("no KIND_DATA frame arrived within 10 datagrams");
}

#[test]
fn authentication_round_trips_over_real_sockets() {
    let mut runtime = Runtime::new(config(), Instant::now()).unwrap();
    let server_addr = runtime.server_worker_addr().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(Duration::from_millis(500))).unwrap();

    let request = RuntimeAuthentication { layer_id: 1, client_hash: 7 };
    let encoded = protocol::encode(0, true, &request).unwrap();
    client.send_to(&frame_data(0, &encoded), server_addr).unwrap();
    std::thread::sleep(Duration::from_millis(20));

    // Step 1's tick decodes the request and queues the response on the worker's channel;
    // the channel isn't flushed again until the *next* tick's poll/flush pair, so a single
    // tick here would only ever hand back the inbound ack, never the response itself.
    runtime.tick(Instant::now());
    runtime.tick(Instant::now());

    let payload = recv_data_payload(&client);
    let (header, response): (_, RuntimeAuthenticationResponse) = protocol::decode_message(&payload).unwrap();
    assert_eq!(header.message_type, MessageType::RuntimeAuthentication);
    assert!(response.succeed);
}

#[test]
fn authentication_for_unknown_layer_is_rejected() {
    let mut runtime = Runtime::new(config(), Instant::now()).unwrap();
    let server_addr = runtime.server_worker_addr().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(Duration::from_millis(500))).unwrap();

    let request = RuntimeAuthentication { layer_id: 999, client_hash: 1 };
    let encoded = protocol::encode(0, true, &request).unwrap();
    client.send_to(&frame_data(0, &encoded), server_addr).unwrap();
    std::thread::sleep(Duration::from_millis(20));

    runtime.tick(Instant::now());
    runtime.tick(Instant::now());

    let payload = recv_data_payload(&client);
    let (_, response): (_, RuntimeAuthenticationResponse) = protocol::decode_message(&payload).unwrap();
    assert!(!response.succeed);
}
