//! DepSched Simulation Engine
//!
//! Discrete-event simulator comparing container placement policies that
//! exploit image layer sharing to cut container startup latency.

pub mod cluster;
pub mod config;
pub mod error;
pub mod results;
pub mod scheduler;
pub mod simulator;
pub mod synth;
pub mod telemetry;
pub mod trace;
pub mod types;
pub mod workload;

pub use cluster::{Cluster, EvictionMode, Node};
pub use config::SimConfig;
pub use error::{Result, SimError};
pub use scheduler::{Outcome, RejectReason, Scheduler};
pub use simulator::{PolicyReport, Simulator};
pub use trace::{TraceProvider, TraceSnapshot};
pub use types::{EvictPolicy, Policy, Request};
pub use workload::Workload;
