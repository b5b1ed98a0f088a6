//! Placement decisions
//!
//! Scheduling is a pure function of the request, the node states and the
//! policy, plus one random permutation of the node visiting order per call.
//! Permutations are derived from a bounded cyclic pool of seeds owned by the
//! [`Scheduler`], so every compared policy sees the same orders when the
//! cursor is reset between runs.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::cluster::Node;
use crate::trace::TraceProvider;
use crate::types::{Policy, Request, MB};

/// Default number of seeds in the permutation pool
pub const DEFAULT_SEED_POOL_LEN: usize = 10_000;

/// Why no node could take a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// At least one node lacked container slots
    ContainerLimit,
    /// Every node had slots but not enough reclaimable space
    StoreLimit,
}

/// Result of one scheduling call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Placed(usize),
    Rejected(RejectReason),
}

/// Cyclic sequence of permutation seeds
///
/// Wraps to the first seed once exhausted.
#[derive(Debug, Clone)]
pub struct SeedCursor {
    seeds: Vec<u64>,
    position: usize,
}

impl SeedCursor {
    /// `len` seeds drawn from `seed` (at least one)
    pub fn new(seed: u64, len: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        SeedCursor {
            seeds: (0..len.max(1)).map(|_| rng.r#gen()).collect(),
            position: 0,
        }
    }

    pub fn next_seed(&mut self) -> u64 {
        if self.position >= self.seeds.len() {
            self.position = 0;
        }
        let seed = self.seeds[self.position];
        self.position += 1;
        seed
    }

    /// Rewind to the first seed
    pub fn reset(&mut self) {
        self.position = 0;
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }
}

/// Scoring parameters shared by all policies
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerTunables {
    /// dep-soft acceptance threshold, as a fraction of request size
    pub dep_th: f64,
    /// Weight of load balancing against locality; `None` ranks by raw score
    pub lb_ratio: Option<f64>,
    /// Locality scores at or below this map to 0
    pub locality_min_bytes: u64,
    /// Locality scores at or above this map to 10
    pub locality_max_bytes: u64,
}

impl Default for SchedulerTunables {
    fn default() -> Self {
        SchedulerTunables {
            dep_th: 0.1,
            lb_ratio: None,
            locality_min_bytes: 23 * MB,
            locality_max_bytes: 1000 * MB,
        }
    }
}

impl SchedulerTunables {
    /// Rank value of a raw locality score on a node
    ///
    /// With `lb_ratio` set this is
    /// `lb_ratio * free_slot_score + (1 - lb_ratio) * locality_score`, both
    /// on a 0 to 10 scale.
    pub fn rank(&self, raw: u64, node: &Node) -> f64 {
        let Some(ratio) = self.lb_ratio else {
            return raw as f64;
        };
        let load = if node.max_containers == 0 {
            0.0
        } else {
            node.free_containers() as f64 / node.max_containers as f64 * 10.0
        };
        let span = self.locality_max_bytes.saturating_sub(self.locality_min_bytes) as f64;
        let locality = if span == 0.0 {
            if raw >= self.locality_max_bytes { 10.0 } else { 0.0 }
        } else {
            ((raw as f64 - self.locality_min_bytes as f64) / span * 10.0).clamp(0.0, 10.0)
        };
        ratio * load + (1.0 - ratio) * locality
    }
}

/// Node selection among candidates that passed the capacity filters
pub trait SchedulingPolicy {
    /// Pick one of `viable` (node indexes in visiting order, never empty)
    fn select(
        &self,
        request: &Request,
        viable: &[usize],
        nodes: &[Node],
        trace: &dyn TraceProvider,
        tunables: &SchedulerTunables,
    ) -> usize;

    /// Get policy name
    fn name(&self) -> &str;
}

/// Highest score wins, ties go to the earliest visited node
fn best_by<F>(viable: &[usize], nodes: &[Node], tunables: &SchedulerTunables, raw: F) -> usize
where
    F: Fn(&Node) -> u64,
{
    let mut best = viable[0];
    let mut best_rank = f64::NEG_INFINITY;
    for &i in viable {
        let rank = tunables.rank(raw(&nodes[i]), &nodes[i]);
        if rank > best_rank {
            best = i;
            best_rank = rank;
        }
    }
    best
}

/// Maximize bytes of needed layers already cached
pub struct DepPolicy;

impl SchedulingPolicy for DepPolicy {
    fn select(
        &self,
        request: &Request,
        viable: &[usize],
        nodes: &[Node],
        trace: &dyn TraceProvider,
        tunables: &SchedulerTunables,
    ) -> usize {
        best_by(viable, nodes, tunables, |n| n.dependency_score(request, trace))
    }

    fn name(&self) -> &str {
        "dep"
    }
}

/// First node whose cached share clears `dep_th`, otherwise the node with
/// the highest raw dependency score (no load-balance blending)
pub struct DepSoftPolicy;

impl SchedulingPolicy for DepSoftPolicy {
    fn select(
        &self,
        request: &Request,
        viable: &[usize],
        nodes: &[Node],
        trace: &dyn TraceProvider,
        tunables: &SchedulerTunables,
    ) -> usize {
        let request_size: u64 = request.images.iter().map(|i| trace.image_size(i)).sum();
        let threshold = tunables.dep_th * request_size as f64;
        viable
            .iter()
            .copied()
            .find(|&i| nodes[i].dependency_score(request, trace) as f64 >= threshold)
            .unwrap_or_else(|| {
                let raw = SchedulerTunables {
                    lb_ratio: None,
                    ..*tunables
                };
                best_by(viable, nodes, &raw, |n| n.dependency_score(request, trace))
            })
    }

    fn name(&self) -> &str {
        "dep-soft"
    }
}

/// Image-level locality: credit only whole images already cached
pub struct KubePolicy;

impl SchedulingPolicy for KubePolicy {
    fn select(
        &self,
        request: &Request,
        viable: &[usize],
        nodes: &[Node],
        trace: &dyn TraceProvider,
        tunables: &SchedulerTunables,
    ) -> usize {
        best_by(viable, nodes, tunables, |n| n.resident_image_bytes(request, trace))
    }

    fn name(&self) -> &str {
        "kube"
    }
}

/// Random placement: the first viable node of the shuffled order
pub struct MonkeyPolicy;

impl SchedulingPolicy for MonkeyPolicy {
    fn select(
        &self,
        _request: &Request,
        viable: &[usize],
        _nodes: &[Node],
        _trace: &dyn TraceProvider,
        _tunables: &SchedulerTunables,
    ) -> usize {
        viable[0]
    }

    fn name(&self) -> &str {
        "monkey"
    }
}

/// Build the policy implementation for a policy name
pub fn policy_for(policy: Policy) -> Box<dyn SchedulingPolicy> {
    match policy {
        Policy::Dep => Box::new(DepPolicy),
        Policy::DepSoft => Box::new(DepSoftPolicy),
        Policy::Kube => Box::new(KubePolicy),
        Policy::Monkey => Box::new(MonkeyPolicy),
    }
}

/// Capacity filtering plus policy selection
#[derive(Debug, Clone)]
pub struct Scheduler {
    cursor: SeedCursor,
    tunables: SchedulerTunables,
}

impl Scheduler {
    pub fn new(tunables: SchedulerTunables, seed: u64, seed_pool_len: usize) -> Self {
        Scheduler {
            cursor: SeedCursor::new(seed, seed_pool_len),
            tunables,
        }
    }

    pub fn tunables(&self) -> &SchedulerTunables {
        &self.tunables
    }

    /// Rewind the permutation seeds; called at the start of every run
    pub fn reset(&mut self) {
        self.cursor.reset();
    }

    /// Node visiting order for the next call
    fn visiting_order(&mut self, node_num: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..node_num).collect();
        let mut rng = StdRng::seed_from_u64(self.cursor.next_seed());
        order.shuffle(&mut rng);
        order
    }

    /// Choose a node for `request`, or report why none fits
    pub fn schedule(
        &mut self,
        request: &Request,
        nodes: &[Node],
        policy: &dyn SchedulingPolicy,
        trace: &dyn TraceProvider,
    ) -> Outcome {
        let order = self.visiting_order(nodes.len());

        let mut container_limited = false;
        let viable: Vec<usize> = order
            .into_iter()
            .filter(|&i| {
                let node = &nodes[i];
                if node.live_containers + request.containers() > node.max_containers {
                    container_limited = true;
                    return false;
                }
                node.required_bytes(request, trace) <= node.real_free_bytes
            })
            .collect();

        if viable.is_empty() {
            return Outcome::Rejected(if container_limited {
                RejectReason::ContainerLimit
            } else {
                RejectReason::StoreLimit
            });
        }
        Outcome::Placed(policy.select(request, &viable, nodes, trace, &self.tunables))
    }
}
