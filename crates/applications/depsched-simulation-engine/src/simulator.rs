//! Discrete-event simulation loop
//!
//! One [`Simulator`] replays the same workload once per compared policy.
//! Each run starts from a clone of the pristine (optionally pre-warmed)
//! cluster and a rewound scheduler seed cursor, so runs differ only in the
//! placement policy and the eviction mode it implies.
//!
//! Within a tick the order is: departures, periodic eviction, then the
//! scheduling pass over the retry queue followed by the tick's arrivals.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, Node};
use crate::config::SimConfig;
use crate::error::{Result, SimError};
use crate::results::ResultWriter;
use crate::scheduler::{policy_for, Outcome, RejectReason, Scheduler};
use crate::telemetry::{LatencyPercentiles, Telemetry, TickSnapshot};
use crate::trace::TraceProvider;
use crate::types::{PendingRequest, PlacementRecord, Policy, MS_PER_TICK};
use crate::workload::Workload;

/// Images sampled per node when warming randomly
const RANDOM_WARM_IMAGES: usize = 200;

/// Outcome of one policy run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyReport {
    pub policy: Policy,
    pub latency: LatencyPercentiles,
    pub provisioning: LatencyPercentiles,
    /// Rounded mean startup latency, -1 when nothing was placed
    pub mean_latency_ms: f64,
    pub mean_provisioning_ms: f64,
    pub generated: usize,
    pub accepted: usize,
    pub container_limit_rejections: u64,
    pub store_limit_rejections: u64,
    pub rejection_ratio: f64,
    pub eviction_passes: u64,
    pub evicted_layers: u64,
    pub evicted_images: u64,
    pub evicted_bytes: u64,
    pub missing_pull_estimates: u64,
    pub utilization: f64,
    /// p99 of per-tick max/mean container load
    pub heating_p99: f64,
    pub mean_images: f64,
    pub mean_free_bytes: f64,
    pub mean_real_free_bytes: f64,
    /// Ticks simulated
    pub ticks: u64,
    /// The run hit `max_ticks` before every request was placed
    pub truncated: bool,
    pub unplaced: usize,
    /// Mean latency relative to the first compared policy
    pub speedup: Option<f64>,
    #[serde(skip)]
    pub latencies_ms: Vec<u64>,
    #[serde(skip)]
    pub provisioning_ms: Vec<u64>,
    #[serde(skip)]
    pub placements: Vec<PlacementRecord>,
}

/// Policy comparison driver
pub struct Simulator<'t> {
    config: SimConfig,
    trace: &'t dyn TraceProvider,
    workload: Workload,
    pristine: Cluster,
    scheduler: Scheduler,
}

impl<'t> Simulator<'t> {
    /// Build the pristine cluster for `config` and a workload to replay
    pub fn new(config: SimConfig, trace: &'t dyn TraceProvider, workload: Workload) -> Result<Self> {
        config.validate()?;
        workload.check()?;
        let mut pristine = Cluster::new(config.node_num, config.store_size, config.cont_cap);
        if config.precached {
            warm_cluster(&mut pristine, &config, trace);
        }
        if config.check_invariants {
            for (i, node) in pristine.nodes.iter().enumerate() {
                check_node(node, i, 0, trace)?;
            }
        }
        let scheduler = Scheduler::new(config.tunables(), config.seed, config.seed_pool_len);
        Ok(Simulator {
            config,
            trace,
            workload,
            pristine,
            scheduler,
        })
    }

    /// Generate the workload from the config seed and build the simulator
    pub fn from_config(config: SimConfig, trace: &'t dyn TraceProvider) -> Result<Self> {
        config.validate()?;
        let workload = Workload::generate(&config, trace)?;
        Self::new(config, trace, workload)
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    pub fn pristine(&self) -> &Cluster {
        &self.pristine
    }

    /// Run every configured policy in order, writing result files if enabled
    pub fn run_all(&mut self) -> Result<Vec<PolicyReport>> {
        let writer = ResultWriter::from_config(&self.config)?;
        let policies = self.config.policies.clone();
        let mut reports = Vec::with_capacity(policies.len());

        for policy in policies {
            let report = self.run_policy(policy)?;
            if let Some(writer) = &writer {
                writer.write_policy(&report)?;
            }
            reports.push(report);
        }

        apply_speedup(&mut reports);
        if let Some(writer) = &writer {
            let path = writer.write_summary(&self.config, &reports)?;
            info!("wrote run summary to {}", path.display());
        }
        Ok(reports)
    }

    /// Simulate one policy from the pristine cluster
    pub fn run_policy(&mut self, policy: Policy) -> Result<PolicyReport> {
        let config = &self.config;
        let trace = self.trace;
        let workload = &self.workload;
        let scheduler = &mut self.scheduler;

        scheduler.reset();
        let mut cluster = self.pristine.clone();
        let mut telemetry = Telemetry::new();
        let placer = policy_for(policy);
        let mode = config.eviction_mode(policy);
        let arrival_ticks = workload.arrival_ticks();

        info!(
            "running policy {} ({} requests, {:?} eviction)",
            placer.name(),
            workload.len(),
            mode
        );

        let mut retry: Vec<PendingRequest> = Vec::new();
        let mut next_request = 0usize;
        let mut tick = 0u64;
        let mut truncated = false;

        loop {
            if tick >= config.max_ticks {
                truncated = true;
                warn!(
                    "policy {} hit max_ticks {} with {} requests unplaced",
                    policy,
                    config.max_ticks,
                    retry.len() + workload.len() - next_request
                );
                break;
            }
            if tick > 0 && tick < arrival_ticks {
                telemetry.record_snapshot(TickSnapshot::capture(tick, &cluster));
            }

            let periodic = config.evict && tick % config.evict_interval == 0;
            for (i, node) in cluster.nodes.iter_mut().enumerate() {
                let mut touched = node.process_departures(tick, trace) > 0;
                if periodic {
                    let report =
                        node.evict(tick, mode, config.evict_th, config.hot_duration, trace);
                    touched |= report.layers_removed > 0 || report.images_removed > 0;
                    telemetry.record_eviction(&report);
                }
                if touched && config.check_invariants {
                    check_node(node, i, tick, trace)?;
                }
            }

            let mut batch = std::mem::take(&mut retry);
            if tick < arrival_ticks {
                let count = workload.arrivals[tick as usize];
                let arriving = &workload.requests[next_request..next_request + count];
                batch.extend(
                    arriving
                        .iter()
                        .cloned()
                        .map(|request| PendingRequest::new(tick, request)),
                );
                next_request += count;
            } else if batch.is_empty() {
                break;
            }

            for pending in batch {
                if cluster.all_container_full() {
                    telemetry.record_rejection(RejectReason::ContainerLimit);
                    retry.push(pending.requeue(tick));
                    continue;
                }

                let index =
                    match scheduler.schedule(&pending.request, &cluster.nodes, placer.as_ref(), trace)
                    {
                        Outcome::Placed(index) => index,
                        Outcome::Rejected(reason) => {
                            telemetry.record_rejection(reason);
                            retry.push(pending.requeue(tick));
                            continue;
                        }
                    };

                let node = &mut cluster.nodes[index];
                let wait_ms = pending.wait_ms(tick);

                if config.delay_sched && policy.is_dependency_aware() {
                    let cost = node.provisioning(&pending.request, trace, config.missing_pull_time);
                    let gap = config.provision_gap * (1 + wait_ms) as f64;
                    if cost.ms as f64 > gap && wait_ms <= config.delay * MS_PER_TICK {
                        retry.push(pending.requeue(tick));
                        continue;
                    }
                }

                let placement =
                    node.place(tick, &pending.request, false, trace, config.missing_pull_time);
                telemetry.record_missing_pulls(placement.missing_pull_estimates);

                if node.used_bytes > node.eviction_target(config.evict_th) {
                    let report =
                        node.evict(tick, mode, config.evict_th, config.hot_duration, trace);
                    telemetry.record_eviction(&report);
                }
                if config.check_invariants {
                    check_node(node, index, tick, trace)?;
                }

                telemetry.record_placement(
                    PlacementRecord {
                        request_id: pending.request.id,
                        tick,
                        node: index,
                        latency_ms: placement.provisioning_ms + wait_ms,
                    },
                    placement.provisioning_ms,
                    pending.request.containers(),
                    pending.request.duration,
                );
            }

            tick += 1;
        }

        let unplaced = retry.len() + workload.len() - next_request;
        let report = build_report(policy, config, &telemetry, tick, truncated, unplaced);
        info!(
            "policy {} done: {} accepted, mean latency {} ms, {} ticks",
            policy, report.accepted, report.mean_latency_ms, report.ticks
        );
        Ok(report)
    }
}

/// Pre-warm every node of a fresh cluster
fn warm_cluster(cluster: &mut Cluster, config: &SimConfig, trace: &dyn TraceProvider) {
    let limit = config.warm_limit_bytes();
    if config.cached_rank >= 0 {
        let images = trace.top_images(config.cached_rank as usize);
        for node in &mut cluster.nodes {
            node.warm(0, &images, config.pinned, limit, trace);
        }
    } else {
        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
        for node in &mut cluster.nodes {
            let images = trace.random_images(RANDOM_WARM_IMAGES, &mut rng);
            node.warm(0, &images, config.pinned, limit, trace);
        }
    }
    let cached: usize = cluster.nodes.iter().map(|n| n.images.len()).sum();
    debug!(
        "warmed {} nodes with {} images in total",
        cluster.len(),
        cached
    );
}

fn check_node(node: &Node, index: usize, tick: u64, trace: &dyn TraceProvider) -> Result<()> {
    node.verify(trace)
        .map_err(|detail| SimError::InvariantViolation {
            node: index,
            tick,
            detail,
        })
}

fn build_report(
    policy: Policy,
    config: &SimConfig,
    telemetry: &Telemetry,
    ticks: u64,
    truncated: bool,
    unplaced: usize,
) -> PolicyReport {
    let generated = config.target_requests();
    PolicyReport {
        policy,
        latency: telemetry.latency_percentiles(),
        provisioning: telemetry.provisioning_percentiles(),
        mean_latency_ms: telemetry.mean_latency_ms(),
        mean_provisioning_ms: telemetry.mean_provisioning_ms(),
        generated,
        accepted: telemetry.accepted(),
        container_limit_rejections: telemetry.container_limit_rejections,
        store_limit_rejections: telemetry.store_limit_rejections,
        rejection_ratio: telemetry.rejection_ratio(generated),
        eviction_passes: telemetry.eviction_passes,
        evicted_layers: telemetry.evicted_layers,
        evicted_images: telemetry.evicted_images,
        evicted_bytes: telemetry.evicted_bytes,
        missing_pull_estimates: telemetry.missing_pull_estimates,
        utilization: telemetry.utilization(config.node_num, config.cont_cap, ticks),
        heating_p99: telemetry.heating_p99(),
        mean_images: telemetry.mean_images(),
        mean_free_bytes: telemetry.mean_free_bytes(),
        mean_real_free_bytes: telemetry.mean_real_free_bytes(),
        ticks,
        truncated,
        unplaced,
        speedup: None,
        latencies_ms: telemetry.latencies_ms.clone(),
        provisioning_ms: telemetry.provisioning_ms.clone(),
        placements: telemetry.placements.clone(),
    }
}

/// Mean latency of each later policy over the first policy's
fn apply_speedup(reports: &mut [PolicyReport]) {
    let Some(baseline) = reports.first().map(|r| r.mean_latency_ms) else {
        return;
    };
    if baseline <= 0.0 {
        return;
    }
    for report in reports.iter_mut().skip(1) {
        if report.mean_latency_ms >= 0.0 {
            report.speedup = Some(report.mean_latency_ms / baseline);
        }
    }
}
