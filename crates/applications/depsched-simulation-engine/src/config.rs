//! Run configuration
//!
//! Every field has a default (the reference experiment setup), so a JSON
//! config file only needs the fields it changes.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cluster::EvictionMode;
use crate::error::{Result, SimError};
use crate::scheduler::{SchedulerTunables, DEFAULT_SEED_POOL_LEN};
use crate::trace::{MissingPullTime, PopularityModel};
use crate::types::{EvictPolicy, Policy, GB, MB};

/// Parameters of one policy comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    // cluster
    pub node_num: usize,
    /// Layer store capacity per node, bytes
    pub store_size: u64,
    /// Container slots per node
    pub cont_cap: usize,
    /// Warm every node before the first tick
    pub precached: bool,
    /// Top-N images to warm; negative warms random images instead
    pub cached_rank: i64,
    /// Warm entries are never evicted
    pub pinned: bool,

    // workload
    /// Longest container run time, ticks
    pub cont_length: u64,
    /// Mean arrivals per tick
    pub req_rate: f64,
    /// Ticks of arrivals
    pub sim_length: u64,
    pub max_num_image: usize,
    pub uniform: bool,
    pub zipf: bool,
    pub zipf_alpha: f64,
    pub seed: u64,

    // scheduling
    pub policies: Vec<Policy>,
    pub dep_th: f64,
    pub lb_ratio: Option<f64>,
    pub locality_min_bytes: u64,
    pub locality_max_bytes: u64,
    pub seed_pool_len: usize,
    pub delay_sched: bool,
    /// Longest deliberate wait, ticks
    pub delay: u64,
    pub provision_gap: f64,

    // eviction
    pub evict: bool,
    pub evict_th: f64,
    pub evict_policy: EvictPolicy,
    pub evict_dep: bool,
    pub evict_interval: u64,
    pub hot_duration: u64,

    // run control
    /// Hard bound on simulated ticks per policy run
    pub max_ticks: u64,
    pub missing_pull_time: MissingPullTime,
    pub check_invariants: bool,
    /// Where result files go; `None` disables them
    pub result_dir: Option<PathBuf>,
    /// Result file suffix; a local timestamp when unset
    pub run_tag: Option<String>,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            node_num: 200,
            store_size: 32 * GB,
            cont_cap: 16,
            precached: false,
            cached_rank: 20,
            pinned: false,

            cont_length: 10,
            req_rate: 125.0,
            sim_length: 1000,
            max_num_image: 1,
            uniform: false,
            zipf: true,
            zipf_alpha: 0.75,
            seed: 42,

            policies: vec![Policy::Dep, Policy::Kube, Policy::Monkey],
            dep_th: 0.1,
            lb_ratio: None,
            locality_min_bytes: 23 * MB,
            locality_max_bytes: 1000 * MB,
            seed_pool_len: DEFAULT_SEED_POOL_LEN,
            delay_sched: false,
            delay: 1,
            provision_gap: 2.0,

            evict: true,
            evict_th: 0.1,
            evict_policy: EvictPolicy::DepLfu,
            evict_dep: false,
            evict_interval: 1,
            hot_duration: 0,

            max_ticks: 1_000_000,
            missing_pull_time: MissingPullTime::Zero,
            check_invariants: true,
            result_dir: Some(PathBuf::from("result")),
            run_tag: None,
        }
    }
}

impl SimConfig {
    /// Read a JSON config; missing fields keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Small cluster for quick runs and tests
    pub fn small() -> Self {
        SimConfig {
            node_num: 10,
            store_size: 4 * GB,
            cont_cap: 8,
            req_rate: 5.0,
            sim_length: 100,
            result_dir: None,
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Reject configurations the simulator cannot run
    pub fn validate(&self) -> Result<()> {
        if self.node_num == 0 {
            return Err(SimError::config("node_num must be positive"));
        }
        if self.store_size == 0 {
            return Err(SimError::config("store_size must be positive"));
        }
        if self.cont_cap == 0 {
            return Err(SimError::config("cont_cap must be positive"));
        }
        if self.cont_length == 0 {
            return Err(SimError::config("cont_length must be at least 1"));
        }
        if !(self.req_rate.is_finite() && self.req_rate > 0.0) {
            return Err(SimError::config(format!(
                "req_rate must be positive, got {}",
                self.req_rate
            )));
        }
        if self.sim_length == 0 {
            return Err(SimError::config("sim_length must be positive"));
        }
        if self.max_num_image == 0 {
            return Err(SimError::config("max_num_image must be at least 1"));
        }
        if self.policies.is_empty() {
            return Err(SimError::config("no scheduling policies to compare"));
        }
        if !(0.0..=1.0).contains(&self.dep_th) {
            return Err(SimError::config(format!(
                "dep_th must be within [0, 1], got {}",
                self.dep_th
            )));
        }
        if !(0.0..1.0).contains(&self.evict_th) {
            return Err(SimError::config(format!(
                "evict_th must be within [0, 1), got {}",
                self.evict_th
            )));
        }
        if let Some(ratio) = self.lb_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(SimError::config(format!(
                    "lb_ratio must be within [0, 1], got {ratio}"
                )));
            }
        }
        if self.locality_min_bytes > self.locality_max_bytes {
            return Err(SimError::config(
                "locality_min_bytes exceeds locality_max_bytes",
            ));
        }
        if self.evict_interval == 0 {
            return Err(SimError::config("evict_interval must be at least 1"));
        }
        if self.zipf && !(self.zipf_alpha.is_finite() && self.zipf_alpha > 0.0) {
            return Err(SimError::config("zipf_alpha must be positive"));
        }
        if self.provision_gap < 0.0 {
            return Err(SimError::config("provision_gap must not be negative"));
        }
        if self.seed_pool_len == 0 {
            return Err(SimError::config("seed_pool_len must be positive"));
        }
        if self.max_ticks < self.sim_length {
            return Err(SimError::config(format!(
                "max_ticks ({}) shorter than sim_length ({})",
                self.max_ticks, self.sim_length
            )));
        }
        Ok(())
    }

    /// Requests generated for a run: `sim_length * req_rate`
    pub fn target_requests(&self) -> usize {
        (self.sim_length as f64 * self.req_rate).round() as usize
    }

    /// Image sampling weights for the workload
    pub fn popularity_model(&self) -> PopularityModel {
        if self.zipf {
            PopularityModel::Zipf {
                alpha: self.zipf_alpha,
            }
        } else if self.uniform {
            PopularityModel::Uniform
        } else {
            PopularityModel::Raw
        }
    }

    pub fn tunables(&self) -> SchedulerTunables {
        SchedulerTunables {
            dep_th: self.dep_th,
            lb_ratio: self.lb_ratio,
            locality_min_bytes: self.locality_min_bytes,
            locality_max_bytes: self.locality_max_bytes,
        }
    }

    pub fn eviction_mode(&self, policy: Policy) -> EvictionMode {
        EvictionMode::for_run(policy.is_dependency_aware(), self.evict_dep, self.evict_policy)
    }

    /// Warm-up stops short of the eviction target
    pub fn warm_limit_bytes(&self) -> u64 {
        (self.store_size as f64 * (1.0 - self.evict_th)).floor() as u64
    }
}
