//! Multi-tier scheduling: a query installed at a low frequency must not fire (or deliver
//! results) on a tick where only the high-frequency bucket is due.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use jani_runtime::bridge::Bridge;
use jani_runtime::config::{AttributeType, Config, ComponentConfig, DeploymentConfig, LayerConfig};
use jani_runtime::entity::{AddEntityPayload, EntityId, EntityStore};
use jani_runtime::mask::ComponentMask;
use jani_runtime::query::{ComponentQuery, Frequency, QueryEngine, QueryInstruction};
use jani_runtime::worker::{WorkerKind, WorkerReference};
use jani_runtime::world::WorldController;

fn config() -> Config {
    let deployment = DeploymentConfig {
        maximum_world_length: 1024,
        worker_length: 64,
        uses_centralized_world_origin: true,
        runtime_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        client_worker_listen_port: 9000,
        server_worker_listen_port: 9001,
        inspector_listen_port: 9002,
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

fn dummy_worker(bridge: &mut Bridge) -> jani_runtime::worker::WorkerId {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    bridge.insert(WorkerReference::new(1, 0, WorkerKind::Server, addr, Instant::now()))
}

#[test]
fn a_1hz_query_does_not_fire_on_every_tick_but_does_fire_once_its_period_elapses() {
    let config = config();
    let mut entities = EntityStore::new();
    let mut world = WorldController::new(&config);
    let mut bridge = Bridge::new();

    // Two workers so the matched entity's cell lands on a different owner than the querying
    // entity's -- otherwise the engine's self-echo rule (never ship a worker data about an
    // entity it already owns) would swallow the result regardless of scheduling.
    let owner_a = dummy_worker(&mut bridge);
    world.register_worker(0, owner_a);

    let querying = EntityId(1);
    let matched = EntityId(2);
    entities.add_entity(querying, AddEntityPayload { components: vec![(0, b"q".to_vec())] });
    entities.add_entity(matched, AddEntityPayload { components: vec![(0, b"m".to_vec())] });
    let c1 = world.insert_entity(&config, querying, (0, 0));
    entities.set_cell_ref(querying, Some(c1));
    entities.get_mut(querying).unwrap().position = (0, 0);

    let owner_b = dummy_worker(&mut bridge);
    world.register_worker(0, owner_b);
    let c2 = world.insert_entity(&config, matched, (70, 70));
    entities.set_cell_ref(matched, Some(c2));
    entities.get_mut(matched).unwrap().position = (70, 70);

    let start = Instant::now();
    let mut engine = QueryEngine::new(start);
    let query = ComponentQuery {
        root: QueryInstruction::Radius(150),
        component_mask: ComponentMask::single(0),
        frequency: Frequency::Hz1,
    };
    engine.update_interest(&mut entities, querying, 0, vec![query]);

    // A 1 Hz bucket's period is 1000ms; well before that boundary, `tick` must not produce
    // any results for this subscription at all.
    let early = engine.tick(&config, &world, &entities, start + Duration::from_millis(100));
    assert!(early.iter().all(|r| r.querying_entity != querying));

    // Past the 1000ms boundary, the bucket fires and the match is delivered.
    let late = engine.tick(&config, &world, &entities, start + Duration::from_millis(1050));
    let matches: Vec<_> = late.iter().filter(|r| r.querying_entity == querying && r.matched_entity == matched).collect();
    assert_eq!(matches.len(), 1);
}

#[test]
fn two_different_frequencies_schedule_independently() {
    let config = config();
    let mut entities = EntityStore::new();
    let mut world = WorldController::new(&config);
    let mut bridge = Bridge::new();

    let owner_a = dummy_worker(&mut bridge);
    world.register_worker(0, owner_a);

    let fast_query = EntityId(10);
    let slow_query = EntityId(11);
    entities.add_entity(fast_query, AddEntityPayload { components: vec![(0, vec![])] });
    entities.add_entity(slow_query, AddEntityPayload { components: vec![(0, vec![])] });
    for (id, pos) in [(fast_query, (0, 0)), (slow_query, (0, 0))] {
        let coord = world.insert_entity(&config, id, pos);
        entities.set_cell_ref(id, Some(coord));
        entities.get_mut(id).unwrap().position = pos;
    }

    // Registered only after the two querying entities settle on owner_a, so the target's
    // (previously untouched) cell goes to the now-least-loaded owner_b instead.
    let owner_b = dummy_worker(&mut bridge);
    world.register_worker(0, owner_b);
    let target = EntityId(12);
    entities.add_entity(target, AddEntityPayload { components: vec![(0, b"t".to_vec())] });
    let target_coord = world.insert_entity(&config, target, (70, 70));
    entities.set_cell_ref(target, Some(target_coord));
    entities.get_mut(target).unwrap().position = (70, 70);

    let start = Instant::now();
    let mut engine = QueryEngine::new(start);
    let radius_query = |freq| ComponentQuery {
        root: QueryInstruction::Radius(150),
        component_mask: ComponentMask::single(0),
        frequency: freq,
    };
    engine.update_interest(&mut entities, fast_query, 0, vec![radius_query(Frequency::Hz50)]);
    engine.update_interest(&mut entities, slow_query, 0, vec![radius_query(Frequency::Hz1)]);

    // 50 Hz period is 20ms: by 25ms the fast bucket has crossed one boundary and delivered its
    // match, but the 1 Hz bucket (period 1000ms) hasn't reached its first boundary yet.
    let first = engine.tick(&config, &world, &entities, start + Duration::from_millis(25));
    assert_eq!(first.iter().filter(|r| r.querying_entity == fast_query && r.matched_entity == target).count(), 1);
    assert_eq!(first.iter().filter(|r| r.querying_entity == slow_query).count(), 0);

    // By 45ms the fast bucket has crossed its second boundary (40ms) and fires again; the
    // slow bucket is still short of its first.
    let second = engine.tick(&config, &world, &entities, start + Duration::from_millis(45));
    assert_eq!(second.iter().filter(|r| r.querying_entity == fast_query && r.matched_entity == target).count(), 1);
    assert_eq!(second.iter().filter(|r| r.querying_entity == slow_query).count(), 0);

    // Past 1000ms the slow bucket finally fires too.
    let late = engine.tick(&config, &world, &entities, start + Duration::from_millis(1005));
    assert_eq!(late.iter().filter(|r| r.querying_entity == slow_query && r.matched_entity == target).count(), 1);
}
