//! Jani: a distributed, authoritative entity-component simulation runtime.
//!
//! This crate is the runtime's core: the [`world`] spatial partitioner, the [`query`]
//! interest-query engine, and the [`transport`]/[`router`] reliable request/response layer,
//! tied together by the single-tick [`orchestrator::Runtime`]. Worker-side ECS bindings, the
//! worker-spawner launcher, the inspector GUI, config-file parsing, and snapshot persistence
//! are all external collaborators this crate only speaks a wire protocol to.

pub mod bridge;
pub mod config;
pub mod entity;
pub mod error;
pub mod mask;
pub mod orchestrator;
pub mod protocol;
pub mod query;
pub mod router;
pub mod spawner;
pub mod transport;
pub mod worker;
pub mod world;

pub use config::Config;
pub use orchestrator::Runtime;
