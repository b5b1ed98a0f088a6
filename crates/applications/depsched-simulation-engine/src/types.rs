//! Core types for the simulation engine

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SimError;

/// One megabyte as counted by the trace tooling (1.024e6 bytes)
pub const MB: u64 = 1_024_000;

/// One gigabyte as counted by the trace tooling (1.024e9 bytes)
pub const GB: u64 = 1_024_000_000;

/// Milliseconds per simulation tick
pub const MS_PER_TICK: u64 = 1000;

/// Scheduling policy compared by the simulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Policy {
    /// Highest layer-level dependency score
    Dep,
    /// First node whose dependency score clears `dep_th`, else like `Dep`
    DepSoft,
    /// Image-aware baseline: credit only for whole resident images
    Kube,
    /// Random placement
    Monkey,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Dep => "dep",
            Policy::DepSoft => "dep-soft",
            Policy::Kube => "kube",
            Policy::Monkey => "monkey",
        }
    }

    /// Policies that reason at layer granularity
    pub fn is_dependency_aware(&self) -> bool {
        matches!(self, Policy::Dep | Policy::DepSoft)
    }

    /// Parse a comma-separated policy list such as `"dep,kube,monkey"`
    pub fn parse_list(list: &str) -> Result<Vec<Policy>, SimError> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for Policy {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dep" => Ok(Policy::Dep),
            "dep-soft" => Ok(Policy::DepSoft),
            "kube" => Ok(Policy::Kube),
            "monkey" => Ok(Policy::Monkey),
            other => Err(SimError::UnknownPolicy(other.to_string())),
        }
    }
}

impl TryFrom<String> for Policy {
    type Error = SimError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Policy> for String {
    fn from(policy: Policy) -> Self {
        policy.as_str().to_string()
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Eviction policy requested by the run configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub enum EvictPolicy {
    /// Layer granularity, least recently used first
    DepLru,
    /// Layer granularity, least frequently used first
    DepLfu,
    /// Image granularity, most recently used image first
    #[default]
    ImageLru,
}

impl EvictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictPolicy::DepLru => "dep-lru",
            EvictPolicy::DepLfu => "dep-lfu",
            EvictPolicy::ImageLru => "image-lru",
        }
    }

    pub fn is_layer_granularity(&self) -> bool {
        matches!(self, EvictPolicy::DepLru | EvictPolicy::DepLfu)
    }
}

impl FromStr for EvictPolicy {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dep-lru" => Ok(EvictPolicy::DepLru),
            "dep-lfu" => Ok(EvictPolicy::DepLfu),
            // "kube" is how the baseline runs name the image path
            "image-lru" | "kube" => Ok(EvictPolicy::ImageLru),
            other => Err(SimError::UnknownEvictPolicy(other.to_string())),
        }
    }
}

impl TryFrom<String> for EvictPolicy {
    type Error = SimError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EvictPolicy> for String {
    fn from(policy: EvictPolicy) -> Self {
        policy.as_str().to_string()
    }
}

impl fmt::Display for EvictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A container start request
///
/// Each image is started as its own container; `duration` is the run time
/// in ticks once provisioning completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub images: Vec<String>,
    pub duration: u64,
}

impl Request {
    /// Create a request, dropping duplicate image names
    pub fn new(id: u64, images: Vec<String>, duration: u64) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(images.len());
        for image in images {
            if !unique.contains(&image) {
                unique.push(image);
            }
        }
        Request {
            id,
            images: unique,
            duration,
        }
    }

    /// Number of container slots the request occupies
    pub fn containers(&self) -> usize {
        self.images.len()
    }
}

/// A request waiting in the scheduling queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Tick the request first arrived at
    pub submit_tick: u64,
    pub request: Request,
}

impl PendingRequest {
    pub fn new(submit_tick: u64, request: Request) -> Self {
        PendingRequest {
            submit_tick,
            request,
        }
    }

    /// Time spent queued so far, in milliseconds
    pub fn wait_ms(&self, tick: u64) -> u64 {
        tick.saturating_sub(self.submit_tick) * MS_PER_TICK
    }

    /// Requeue keeping the earlier of the original and current tick
    pub fn requeue(self, tick: u64) -> Self {
        PendingRequest {
            submit_tick: self.submit_tick.min(tick),
            request: self.request,
        }
    }
}

/// Record of where a request was placed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRecord {
    pub request_id: u64,
    pub tick: u64,
    pub node: usize,
    pub latency_ms: u64,
}
