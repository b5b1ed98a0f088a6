//! Error types for the simulation engine

use thiserror::Error;

/// Simulation result type
pub type Result<T> = std::result::Result<T, SimError>;

/// Errors that can occur while configuring or running a simulation
///
/// Capacity rejections are not errors: they are scheduling outcomes
/// (see [`crate::scheduler::Outcome`]) that feed the retry queue.
#[derive(Error, Debug)]
pub enum SimError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Scheduling policy name not recognized
    #[error("Unknown scheduling policy: {0}")]
    UnknownPolicy(String),

    /// Eviction policy name not recognized
    #[error("Unknown eviction policy: {0}")]
    UnknownEvictPolicy(String),

    /// Invalid run configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Trace data is inconsistent or incomplete
    #[error("Trace error: {0}")]
    Trace(String),

    /// A node's bookkeeping broke one of its invariants
    #[error("Invariant violated on node {node} at tick {tick}: {detail}")]
    InvariantViolation {
        node: usize,
        tick: u64,
        detail: String,
    },
}

impl SimError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a trace error
    pub fn trace(msg: impl Into<String>) -> Self {
        Self::Trace(msg.into())
    }
}
