//! Error types: each leaf error is its own `thiserror`-derived enum rather than a single
//! catch-all.
//!
//! Protocol/authority/capacity problems never propagate as exceptions across component
//! boundaries -- handler methods return explicit outcomes (`bool`, `Option`, or
//! a small outcome enum) instead of `Result`s that bubble up. The `Result`-returning types
//! here are for the narrower set of things that really are exceptional: malformed bytes on
//! the wire, invalid configuration, and local I/O.

use thiserror::Error;

/// Failure to decode or encode a wire message.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed message body")]
    Malformed(#[from] bincode::Error),
    #[error("unknown request type tag {0}")]
    UnknownType(u64),
    #[error("message of {0} bytes exceeds the transport MTU of {1} bytes and was not chunked by the caller")]
    TooLarge(usize, usize),
    #[error("frame of {0} bytes is shorter than the {1}-byte header")]
    Truncated(usize, usize),
}

/// Failure to construct a [`crate::config::Config`] from otherwise-valid-looking parts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("maximum_world_length {maximum_world_length} is not a multiple of worker_length {worker_length}")]
    WorldNotMultipleOfWorker {
        maximum_world_length: u32,
        worker_length: u32,
    },
    #[error("{0} layers declared, exceeding the 32-layer limit")]
    TooManyLayers(usize),
    #[error("duplicate layer id {0}")]
    DuplicateLayerId(u64),
    #[error("component {component} names layer {layer:?}, which was not declared")]
    UnknownLayer { component: String, layer: String },
    #[error("component id {0} is out of the 0..64 range fixed by the runtime")]
    ComponentIdOutOfRange(u32),
    #[error("component id {0} is used by both {1:?} and {2:?}")]
    DuplicateComponentId(u8, String, String),
}

/// Errors surfaced from [`crate::transport::Transport`] setup.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind UDP socket on {0}")]
    Bind(std::net::SocketAddr, #[source] std::io::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The outcome of an [`crate::entity::EntityStore`] mutation, returned as an explicit
/// value rather than propagated as an error -- callers are expected to branch on it, not `?` it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    Applied,
    /// Preconditions in the op table weren't met: entity missing, mask already
    /// in the wanted state, etc.
    PreconditionFailed,
    /// The calling worker did not hold authority over `(entity, layer_of(component))` at the
    /// moment the update was applied. Silently dropped, not an error -- the outcome exists so
    /// callers can still log it as a dropped-stale-update at `debug` level.
    AuthorityViolation,
    /// Capacity exhaustion: no ids left to reserve, or similar.
    CapacityExhausted,
}

impl OpOutcome {
    pub fn succeeded(self) -> bool {
        matches!(self, OpOutcome::Applied)
    }
}

/// Logs a world controller invariant break and aborts the process: continuing would corrupt
/// entity->worker mappings, so this is treated as unrecoverable rather than propagated.
/// Only call this from the handful of call sites where that specific invariant is what
/// broke -- not a general-purpose panic helper.
#[cold]
#[track_caller]
pub fn fatal_invariant_break(detail: &str) -> ! {
    tracing::error!(detail, "world controller invariant broken, exiting");
    std::process::exit(1)
}
