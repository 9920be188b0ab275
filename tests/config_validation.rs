//! Config construction edge cases not already exercised by `src/config.rs`'s unit tests.

use std::net::IpAddr;

use indexmap::IndexMap;
use jani_runtime::config::{Config, ComponentConfig, DeploymentConfig, LayerConfig};
use jani_runtime::error::ConfigError;

fn deployment() -> DeploymentConfig {
    DeploymentConfig {
        maximum_world_length: 1024,
        worker_length: 64,
        uses_centralized_world_origin: true,
        runtime_ip: "127.0.0.1".parse::<IpAddr>().unwrap(),
        client_worker_listen_port: 9000,
        server_worker_listen_port: 9001,
        inspector_listen_port: 9002,
        thread_pool_size: -1,
    }
}

fn layer(name: &str, id: u64, components: Vec<ComponentConfig>) -> LayerConfig {
    LayerConfig {
        name: name.into(),
        id,
        user_layer: true,
        use_spatial_area: false,
        maximum_entities_per_worker: None,
        maximum_workers: None,
        components,
    }
}

#[test]
fn rejects_more_than_32_layers() {
    let layers: Vec<LayerConfig> = (0..33).map(|i| layer("l", i, vec![])).collect();
    let err = Config::new(deployment(), layers, vec![]).unwrap_err();
    assert!(matches!(err, ConfigError::TooManyLayers(33)));
}

#[test]
fn rejects_duplicate_layer_ids() {
    let layers = vec![layer("a", 1, vec![]), layer("b", 1, vec![])];
    let err = Config::new(deployment(), layers, vec![]).unwrap_err();
    assert!(matches!(err, ConfigError::DuplicateLayerId(1)));
}

#[test]
fn rejects_component_naming_a_different_layer_than_its_own() {
    let component = ComponentConfig {
        name: "pos".into(),
        id: 0,
        layer_name: "nonexistent".into(),
        attributes: IndexMap::new(),
    };
    let layers = vec![layer("spatial", 1, vec![component])];
    let err = Config::new(deployment(), layers, vec![]).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownLayer { .. }));
}

#[test]
fn rejects_component_id_at_or_above_64() {
    let component = ComponentConfig {
        name: "overflow".into(),
        id: 64,
        layer_name: "spatial".into(),
        attributes: IndexMap::new(),
    };
    let layers = vec![layer("spatial", 1, vec![component])];
    let err = Config::new(deployment(), layers, vec![]).unwrap_err();
    assert!(matches!(err, ConfigError::ComponentIdOutOfRange(64)));
}

#[test]
fn accepts_exactly_32_layers() {
    let layers: Vec<LayerConfig> = (0..32).map(|i| layer("l", i, vec![])).collect();
    let config = Config::new(deployment(), layers, vec![]).unwrap();
    assert_eq!(config.layer_count(), 32);
}
