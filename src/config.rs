//! The immutable configuration object supplied at startup.
//!
//! Parsing a config file is explicitly out of scope; this module only
//! defines the typed shape the rest of the runtime borrows from, plus the validation pass
//! that turns loosely-typed input (e.g. freshly `serde`-deserialized from whatever format an
//! embedder picks) into a [`Config`] the orchestrator can trust for the rest of its life.

use std::net::IpAddr;

use ahash::AHashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::ConfigError;
use crate::mask::ComponentId;

/// Maximum number of layers a deployment may declare.
pub const MAX_LAYERS: usize = 32;

pub type LayerId = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub maximum_world_length: u32,
    pub worker_length: u32,
    pub uses_centralized_world_origin: bool,
    pub runtime_ip: IpAddr,
    pub client_worker_listen_port: u16,
    pub server_worker_listen_port: u16,
    pub inspector_listen_port: u16,
    /// `-1` means "use all cores", matching the source's convention.
    pub thread_pool_size: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    Bool,
    I32,
    I64,
    U32,
    U64,
    F32,
    F64,
    String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub name: SmolStr,
    pub id: ComponentId,
    pub layer_name: SmolStr,
    pub attributes: IndexMap<SmolStr, AttributeType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfig {
    pub name: SmolStr,
    pub id: LayerId,
    pub user_layer: bool,
    pub use_spatial_area: bool,
    pub maximum_entities_per_worker: Option<u32>,
    pub maximum_workers: Option<u32>,
    pub components: Vec<ComponentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnerConfig {
    pub ip: IpAddr,
    pub port: u16,
}

/// A validated, immutable configuration. Construct with [`Config::new`], which runs the
/// same checks the original's config loader would have (component ids unique and in range,
/// every component's layer exists, world/cell length divisibility).
#[derive(Debug, Clone)]
pub struct Config {
    pub deployment: DeploymentConfig,
    pub layers: Vec<LayerConfig>,
    pub spawners: Vec<SpawnerConfig>,

    /// Derived: component id -> index into `layers` owning it. Built once at construction
    /// so `layer_of` is O(1) instead of a linear scan per lookup during hot-path ticks.
    component_to_layer: AHashMap<ComponentId, usize>,
    /// Derived: layer id -> index into `layers`.
    layer_id_to_index: AHashMap<LayerId, usize>,
}

impl Config {
    pub fn new(
        deployment: DeploymentConfig,
        layers: Vec<LayerConfig>,
        spawners: Vec<SpawnerConfig>,
    ) -> Result<Self, ConfigError> {
        if deployment.maximum_world_length % deployment.worker_length != 0 {
            return Err(ConfigError::WorldNotMultipleOfWorker {
                maximum_world_length: deployment.maximum_world_length,
                worker_length: deployment.worker_length,
            });
        }
        if layers.len() > MAX_LAYERS {
            return Err(ConfigError::TooManyLayers(layers.len()));
        }

        let mut layer_id_to_index = AHashMap::default();
        for (idx, layer) in layers.iter().enumerate() {
            if layer_id_to_index.insert(layer.id, idx).is_some() {
                return Err(ConfigError::DuplicateLayerId(layer.id));
            }
        }

        let mut component_to_layer = AHashMap::default();
        for layer in &layers {
            for component in &layer.components {
                if component.id as usize >= crate::mask::MAX_COMPONENTS {
                    return Err(ConfigError::ComponentIdOutOfRange(component.id as u32));
                }
                if component.layer_name != layer.name {
                    return Err(ConfigError::UnknownLayer {
                        component: component.name.to_string(),
                        layer: component.layer_name.to_string(),
                    });
                }
                if let Some(&prior_layer_idx) =
                    component_to_layer.insert(component.id, layer_id_to_index[&layer.id])
                {
                    let prior_name = &layers[prior_layer_idx].name;
                    return Err(ConfigError::DuplicateComponentId(
                        component.id,
                        prior_name.to_string(),
                        component.name.to_string(),
                    ));
                }
            }
        }

        Ok(Self {
            deployment,
            layers,
            spawners,
            component_to_layer,
            layer_id_to_index,
        })
    }

    pub fn layer_of(&self, component: ComponentId) -> Option<&LayerConfig> {
        self.component_to_layer
            .get(&component)
            .map(|&idx| &self.layers[idx])
    }

    pub fn layer_index_of(&self, component: ComponentId) -> Option<usize> {
        self.component_to_layer.get(&component).copied()
    }

    pub fn layer_by_id(&self, layer_id: LayerId) -> Option<&LayerConfig> {
        self.layer_id_to_index.get(&layer_id).map(|&idx| &self.layers[idx])
    }

    pub fn layer_index_by_id(&self, layer_id: LayerId) -> Option<usize> {
        self.layer_id_to_index.get(&layer_id).copied()
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn layer_by_index(&self, index: usize) -> Option<&LayerConfig> {
        self.layers.get(index)
    }

    pub fn thread_pool_size(&self) -> Option<usize> {
        if self.deployment.thread_pool_size < 0 {
            None
        } else {
            Some(self.deployment.thread_pool_size as usize)
        }
    }
}
