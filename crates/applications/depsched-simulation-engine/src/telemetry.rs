//! Run metrics
//!
//! One [`Telemetry`] collects everything a policy run reports: rejections
//! by reason, eviction totals, accepted-request latencies and per-tick
//! cluster snapshots. It is replaced with a fresh instance before every run.

use serde::{Deserialize, Serialize};

use crate::cluster::{Cluster, EvictionReport};
use crate::scheduler::RejectReason;
use crate::types::{PlacementRecord, MS_PER_TICK};

/// Latency distribution summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p5: u64,
    pub p25: u64,
    pub p50: u64,
    pub p75: u64,
    pub p95: u64,
    pub mean: f64,
}

impl LatencyPercentiles {
    /// Nearest-rank percentiles at index `floor(p / 100 * n)`; all zeros when empty
    pub fn from_samples(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return LatencyPercentiles::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let mean = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        LatencyPercentiles {
            p5: percentile(&sorted, 5.0),
            p25: percentile(&sorted, 25.0),
            p50: percentile(&sorted, 50.0),
            p75: percentile(&sorted, 75.0),
            p95: percentile(&sorted, 95.0),
            mean,
        }
    }
}

/// `sorted` must be non-empty and ascending
fn percentile(sorted: &[u64], p: f64) -> u64 {
    let idx = ((p * 0.01 * sorted.len() as f64) as usize).min(sorted.len() - 1);
    sorted[idx]
}

/// p-th percentile of float samples (same indexing as latencies)
pub fn percentile_f64(samples: &[f64], p: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let idx = ((p * 0.01 * sorted.len() as f64) as usize).min(sorted.len() - 1);
    sorted[idx]
}

/// Cluster-wide averages sampled at one tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickSnapshot {
    pub tick: u64,
    pub mean_images: f64,
    pub mean_free_bytes: f64,
    pub mean_real_free_bytes: f64,
    /// Max over mean container load
    pub heating: f64,
}

impl TickSnapshot {
    pub fn capture(tick: u64, cluster: &Cluster) -> Self {
        let n = cluster.len().max(1) as f64;
        let images: usize = cluster.nodes.iter().map(|node| node.images.len()).sum();
        let free: u64 = cluster.nodes.iter().map(|node| node.free_bytes()).sum();
        let real_free: u64 = cluster.nodes.iter().map(|node| node.real_free_bytes).sum();
        TickSnapshot {
            tick,
            mean_images: images as f64 / n,
            mean_free_bytes: free as f64 / n,
            mean_real_free_bytes: real_free as f64 / n,
            heating: cluster.heating_ratio(),
        }
    }
}

/// Counters and samples of one policy run
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    pub container_limit_rejections: u64,
    pub store_limit_rejections: u64,
    /// Eviction passes that removed something
    pub eviction_passes: u64,
    pub evicted_layers: u64,
    pub evicted_images: u64,
    pub evicted_bytes: u64,
    /// Layers charged with the fallback pull time
    pub missing_pull_estimates: u64,
    /// Startup latency of every accepted request
    pub latencies_ms: Vec<u64>,
    pub provisioning_ms: Vec<u64>,
    pub placements: Vec<PlacementRecord>,
    /// Sum of containers x duration over accepted requests
    pub container_ticks: u64,
    pub snapshots: Vec<TickSnapshot>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_rejection(&mut self, reason: RejectReason) {
        match reason {
            RejectReason::ContainerLimit => self.container_limit_rejections += 1,
            RejectReason::StoreLimit => self.store_limit_rejections += 1,
        }
    }

    pub fn total_rejections(&self) -> u64 {
        self.container_limit_rejections + self.store_limit_rejections
    }

    pub fn record_eviction(&mut self, report: &EvictionReport) {
        if report.layers_removed == 0 && report.images_removed == 0 {
            return;
        }
        self.eviction_passes += 1;
        self.evicted_layers += report.layers_removed as u64;
        self.evicted_images += report.images_removed as u64;
        self.evicted_bytes += report.freed_bytes;
    }

    /// Record an accepted request
    pub fn record_placement(
        &mut self,
        record: PlacementRecord,
        provisioning_ms: u64,
        containers: usize,
        duration: u64,
    ) {
        self.latencies_ms.push(record.latency_ms);
        self.provisioning_ms.push(provisioning_ms);
        self.container_ticks += containers as u64 * duration;
        self.placements.push(record);
    }

    pub fn record_missing_pulls(&mut self, count: usize) {
        self.missing_pull_estimates += count as u64;
    }

    pub fn record_snapshot(&mut self, snapshot: TickSnapshot) {
        self.snapshots.push(snapshot);
    }

    pub fn accepted(&self) -> usize {
        self.latencies_ms.len()
    }

    pub fn latency_percentiles(&self) -> LatencyPercentiles {
        LatencyPercentiles::from_samples(&self.latencies_ms)
    }

    pub fn provisioning_percentiles(&self) -> LatencyPercentiles {
        LatencyPercentiles::from_samples(&self.provisioning_ms)
    }

    /// Mean startup latency rounded to whole ms, -1 if nothing was accepted
    pub fn mean_latency_ms(&self) -> f64 {
        rounded_mean(&self.latencies_ms)
    }

    /// Mean provisioning latency rounded to whole ms, -1 if nothing was accepted
    pub fn mean_provisioning_ms(&self) -> f64 {
        rounded_mean(&self.provisioning_ms)
    }

    /// Rejections per generated request, rounded to 3 decimals
    pub fn rejection_ratio(&self, generated: usize) -> f64 {
        if generated == 0 {
            return 0.0;
        }
        let ratio = self.total_rejections() as f64 / generated as f64;
        (ratio * 1000.0).round() / 1000.0
    }

    /// Share of container-slot time spent running or provisioning
    pub fn utilization(&self, node_num: usize, cont_cap: usize, ticks: u64) -> f64 {
        let capacity = node_num as f64 * cont_cap as f64 * ticks as f64;
        if capacity == 0.0 {
            return 0.0;
        }
        let provisioning_secs =
            self.provisioning_ms.iter().sum::<u64>() as f64 / MS_PER_TICK as f64;
        (self.container_ticks as f64 + provisioning_secs) / capacity
    }

    /// 99th percentile of the per-tick heating ratio
    pub fn heating_p99(&self) -> f64 {
        let samples: Vec<f64> = self.snapshots.iter().map(|s| s.heating).collect();
        percentile_f64(&samples, 99.0)
    }

    pub fn mean_images(&self) -> f64 {
        mean_of(self.snapshots.iter().map(|s| s.mean_images))
    }

    pub fn mean_free_bytes(&self) -> f64 {
        mean_of(self.snapshots.iter().map(|s| s.mean_free_bytes))
    }

    pub fn mean_real_free_bytes(&self) -> f64 {
        mean_of(self.snapshots.iter().map(|s| s.mean_real_free_bytes))
    }
}

fn rounded_mean(samples: &[u64]) -> f64 {
    if samples.is_empty() {
        return -1.0;
    }
    (samples.iter().sum::<u64>() as f64 / samples.len() as f64).round()
}

fn mean_of(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if n == 0 { 0.0 } else { sum / n as f64 }
}
