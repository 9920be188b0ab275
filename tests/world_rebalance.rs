//! Cross-module scenario: cells piling up on a single worker get handed off to a newly
//! registered worker under the 70% guard ratio, and the controller events that result.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use indexmap::IndexMap;
use jani_runtime::bridge::Bridge;
use jani_runtime::config::{AttributeType, Config, ComponentConfig, DeploymentConfig, LayerConfig};
use jani_runtime::entity::{EntityId, EntityStore};
use jani_runtime::world::rebalance::{ControllerEvent, RebalanceFailureReason};
use jani_runtime::world::WorldController;
use jani_runtime::worker::{WorkerKind, WorkerReference};

fn config(maximum_entities_per_worker: u32, maximum_workers: Option<u32>) -> Config {
    let deployment = DeploymentConfig {
        maximum_world_length: 1024,
        worker_length: 64,
        uses_centralized_world_origin: true,
        runtime_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        client_worker_listen_port: 9000,
        server_worker_listen_port: 9001,
        inspector_listen_port: 9002,
        thread_pool_size: -1,
    };
    let mut attributes = IndexMap::new();
    attributes.insert("x".into(), AttributeType::I32);
    let layers = vec![LayerConfig {
        name: "spatial".into(),
        id: 1,
        user_layer: true,
        use_spatial_area: true,
        maximum_entities_per_worker: Some(maximum_entities_per_worker),
        maximum_workers,
        components: vec![ComponentConfig {
            name: "pos".into(),
            id: 0,
            layer_name: "spatial".into(),
            attributes,
        }],
    }];
    Config::new(deployment, layers, vec![]).unwrap()
}

fn dummy_worker(bridge: &mut Bridge) -> jani_runtime::worker::WorkerId {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    bridge.insert(WorkerReference::new(1, 0, WorkerKind::Server, addr, Instant::now()))
}

#[test]
fn overloaded_worker_hands_off_cells_under_the_guard_ratio() {
    let config = config(10, Some(4));
    let mut controller = WorldController::new(&config);
    let mut bridge = Bridge::new();
    let mut entities = EntityStore::new();

    let worker_a = dummy_worker(&mut bridge);
    controller.register_worker(0, worker_a);

    // 10 distinct cells (x = 0, 64, .. 576; world_to_cell centers on 1024/64=16), 2 entities
    // each, all created while worker_a is the only registered worker -- cell-initialization
    // assigns every one of them to it. Each entity carries the layer's "pos" component so a
    // migrated entity has payload bytes to reinstall.
    let mut next_id = 0u64;
    for i in 0..10 {
        let x = i * 64;
        for _ in 0..2 {
            let entity = EntityId(next_id);
            next_id += 1;
            entities.add_entity(
                entity,
                jani_runtime::entity::AddEntityPayload { components: vec![(0, vec![next_id as u8])] },
            );
            controller.insert_entity(&config, entity, (x, 0));
        }
    }
    assert_eq!(controller.layer_state(0).unwrap().get(worker_a).unwrap().entity_count, 20);

    let worker_b = dummy_worker(&mut bridge);
    controller.register_worker(0, worker_b);

    let mut events = Vec::new();
    controller.rebalance_tick(&config, &entities, || 0, &mut events);

    // 0.7 * 10 = 7: worker_b can accept at most 3 cells of 2 entities (6) before a 4th would
    // put it at 8 >= 7, so exactly 3 cells (6 entities, 12 paired events) migrate this tick.
    let gains: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, ControllerEvent::AuthorityGain { worker, .. } if *worker == worker_b))
        .collect();
    let losses: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, ControllerEvent::AuthorityLost { worker, .. } if *worker == worker_a))
        .collect();
    let reinstalls: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, ControllerEvent::ReinstallComponent { worker, .. } if *worker == worker_b))
        .collect();
    assert_eq!(gains.len(), 6);
    assert_eq!(losses.len(), 6);
    // One ReinstallComponent per migrated entity (each has exactly the one "pos" component).
    assert_eq!(reinstalls.len(), 6);
    for r in &reinstalls {
        let ControllerEvent::ReinstallComponent { entity, component, payload, .. } = r else { unreachable!() };
        assert_eq!(*component, 0);
        assert_eq!(*payload, entities.get(*entity).unwrap().payload(0).unwrap().to_vec());
    }

    assert_eq!(controller.layer_state(0).unwrap().get(worker_b).unwrap().entity_count, 6);
    assert_eq!(controller.layer_state(0).unwrap().get(worker_a).unwrap().entity_count, 14);

    // Worker_b is now full for this pass; the remaining 7 cells on worker_a have nowhere
    // eligible to go, so the layer is still over limit and (since maximum_workers allows
    // growth) asks the spawner for another worker.
    let still_over_limit = events
        .iter()
        .any(|e| matches!(e, ControllerEvent::RequestAdditionalWorker { reason: RebalanceFailureReason::NotEnoughSpace, .. }));
    assert!(still_over_limit);
}

#[test]
fn balanced_layer_triggers_no_rebalance() {
    let config = config(1000, Some(4));
    let mut controller = WorldController::new(&config);
    let mut bridge = Bridge::new();
    let entities = EntityStore::new();
    let worker_a = dummy_worker(&mut bridge);
    let worker_b = dummy_worker(&mut bridge);
    controller.register_worker(0, worker_a);
    controller.register_worker(0, worker_b);

    controller.insert_entity(&config, EntityId(1), (0, 0));

    let mut events = Vec::new();
    controller.rebalance_tick(&config, &entities, || 0, &mut events);
    assert!(events.is_empty());
}
