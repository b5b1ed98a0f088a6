//! Per-node cache and container bookkeeping
//!
//! Each [`Node`] tracks which images and layers are cached, how many live
//! containers reference them, when containers depart, and two views of free
//! space:
//! - logical: `capacity_bytes - used_bytes`, where `used_bytes` counts every
//!   cached layer
//! - reclaimable: `real_free_bytes`, which only subtracts *held* layers
//!   (referenced by a live container, or pinned) since unheld layers can be
//!   evicted on demand
//!
//! Only the simulator mutates nodes. A cluster is cloned before the first
//! policy run and restored wholesale from that clone between runs.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::trace::{pull_estimate, MissingPullTime, TraceProvider};
use crate::types::{EvictPolicy, Request, MS_PER_TICK};

/// Cache state of one image or layer on a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Live containers using the entry
    pub refcount: u32,
    pub last_used: u64,
    /// Number of times the entry has been placed or warmed
    pub frequency: u64,
    pub pinned: bool,
}

impl CacheEntry {
    /// Held entries can never be evicted
    pub fn is_held(&self) -> bool {
        self.refcount > 0 || self.pinned
    }

    fn touch(&mut self, tick: u64, pinned: bool) {
        self.last_used = tick;
        self.frequency += 1;
        self.pinned |= pinned;
    }
}

/// Granularity used by one eviction pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionMode {
    /// Layer granularity, least recently used first
    LayerLru,
    /// Layer granularity, least frequently used first
    LayerLfu,
    /// Image granularity, most recently used image first
    Image,
}

impl EvictionMode {
    /// Pick the eviction granularity for a policy run
    ///
    /// Layer granularity is only used by dependency-aware runs that enabled
    /// it; everything else evicts whole images.
    pub fn for_run(dependency_aware: bool, evict_dep: bool, evict_policy: EvictPolicy) -> Self {
        if dependency_aware && evict_dep {
            match evict_policy {
                EvictPolicy::DepLru => return EvictionMode::LayerLru,
                EvictPolicy::DepLfu => return EvictionMode::LayerLfu,
                EvictPolicy::ImageLru => {}
            }
        }
        EvictionMode::Image
    }
}

/// Outcome of placing a request on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Bytes of layers that were not cached before
    pub new_bytes: u64,
    pub provisioning_ms: u64,
    /// Tick at which the request's containers depart
    pub departure_tick: u64,
    /// Layers whose pull time fell back to the configured default
    pub missing_pull_estimates: usize,
}

/// Outcome of an eviction pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub layers_removed: usize,
    pub images_removed: usize,
    pub freed_bytes: u64,
}

/// Provisioning cost of a request on a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Provisioning {
    pub ms: u64,
    pub missing_pull_estimates: usize,
}

/// One cluster member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub images: BTreeMap<String, CacheEntry>,
    pub layers: BTreeMap<String, CacheEntry>,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub live_containers: usize,
    pub max_containers: usize,
    /// Departure tick -> images whose containers stop then
    pub departures: BTreeMap<u64, Vec<String>>,
    pub real_free_bytes: u64,
}

impl Node {
    pub fn new(capacity_bytes: u64, max_containers: usize) -> Self {
        Node {
            images: BTreeMap::new(),
            layers: BTreeMap::new(),
            used_bytes: 0,
            capacity_bytes,
            live_containers: 0,
            max_containers,
            departures: BTreeMap::new(),
            real_free_bytes: capacity_bytes,
        }
    }

    pub fn free_containers(&self) -> usize {
        self.max_containers.saturating_sub(self.live_containers)
    }

    pub fn is_container_full(&self) -> bool {
        self.live_containers >= self.max_containers
    }

    pub fn free_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes)
    }

    /// Usage level above which the node should reclaim space
    pub fn eviction_target(&self, threshold: f64) -> u64 {
        (self.capacity_bytes as f64 * (1.0 - threshold)).floor() as u64
    }

    fn image_entry(&mut self, image: &str) -> &mut CacheEntry {
        self.images.entry(image.to_string()).or_default()
    }

    fn layer_entry(&mut self, digest: &str) -> &mut CacheEntry {
        self.layers.entry(digest.to_string()).or_default()
    }

    /// Distinct layers of a request, in first-seen order
    pub fn request_layers<'t>(request: &Request, trace: &'t dyn TraceProvider) -> Vec<&'t str> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for image in &request.images {
            for digest in trace.layers(image) {
                if seen.insert(digest.as_str()) {
                    out.push(digest.as_str());
                }
            }
        }
        out
    }

    /// Bytes of the request's layers already cached here
    pub fn dependency_score(&self, request: &Request, trace: &dyn TraceProvider) -> u64 {
        Self::request_layers(request, trace)
            .into_iter()
            .filter(|d| self.layers.contains_key(*d))
            .map(|d| trace.layer_size(d))
            .sum()
    }

    /// Bytes of the request's whole images cached here
    pub fn resident_image_bytes(&self, request: &Request, trace: &dyn TraceProvider) -> u64 {
        request
            .images
            .iter()
            .filter(|i| self.images.contains_key(*i))
            .map(|i| trace.image_size(i))
            .sum()
    }

    /// Bytes that would newly become held if the request were placed here
    pub fn required_bytes(&self, request: &Request, trace: &dyn TraceProvider) -> u64 {
        Self::request_layers(request, trace)
            .into_iter()
            .filter(|d| !self.layers.get(*d).is_some_and(CacheEntry::is_held))
            .map(|d| trace.layer_size(d))
            .sum()
    }

    /// Estimated time to pull and register the request's missing layers
    pub fn provisioning(
        &self,
        request: &Request,
        trace: &dyn TraceProvider,
        fallback: MissingPullTime,
    ) -> Provisioning {
        if request.images.iter().all(|i| self.images.contains_key(i)) {
            return Provisioning::default();
        }
        let mut cost = Provisioning::default();
        for digest in Self::request_layers(request, trace) {
            if self.layers.contains_key(digest) {
                continue;
            }
            let estimate = pull_estimate(trace, digest, fallback);
            cost.ms += estimate.ms;
            if estimate.missing {
                cost.missing_pull_estimates += 1;
            }
        }
        cost
    }

    /// Start the request's containers on this node
    ///
    /// Missing layers are cached; every image and each of its layers gains
    /// one reference per container. The containers depart at
    /// `tick + round(provisioning_ms / 1000) + duration`, never earlier than
    /// the next tick.
    pub fn place(
        &mut self,
        tick: u64,
        request: &Request,
        pinned: bool,
        trace: &dyn TraceProvider,
        fallback: MissingPullTime,
    ) -> Placement {
        let provisioning = self.provisioning(request, trace, fallback);

        let mut new_bytes = 0;
        for digest in Self::request_layers(request, trace) {
            if !self.layers.contains_key(digest) {
                let size = trace.layer_size(digest);
                self.used_bytes += size;
                new_bytes += size;
                self.layer_entry(digest);
            }
        }

        for image in &request.images {
            self.image_entry(image).refcount += 1;
            self.image_entry(image).touch(tick, pinned);
            for digest in trace.layers(image) {
                let size = trace.layer_size(digest);
                let entry = self.layer_entry(digest);
                let was_held = entry.is_held();
                entry.refcount += 1;
                entry.touch(tick, pinned);
                if !was_held {
                    self.debit_real_free(size);
                }
            }
            self.live_containers += 1;
        }

        let provisioning_secs = (provisioning.ms as f64 / MS_PER_TICK as f64).round() as u64;
        // departures for `tick` are already processed
        let departure_tick = (tick + provisioning_secs + request.duration).max(tick + 1);
        self.departures
            .entry(departure_tick)
            .or_default()
            .extend(request.images.iter().cloned());

        Placement {
            new_bytes,
            provisioning_ms: provisioning.ms,
            departure_tick,
            missing_pull_estimates: provisioning.missing_pull_estimates,
        }
    }

    /// Cache images without starting containers (cluster pre-warming)
    ///
    /// Images that would push usage above `limit_bytes` are skipped. Returns
    /// the number of images warmed.
    pub fn warm(
        &mut self,
        tick: u64,
        images: &[String],
        pinned: bool,
        limit_bytes: u64,
        trace: &dyn TraceProvider,
    ) -> usize {
        let mut warmed = 0;
        for image in images {
            let new_bytes: u64 = trace
                .layers(image)
                .iter()
                .filter(|d| !self.layers.contains_key(*d))
                .map(|d| trace.layer_size(d))
                .sum();
            if self.used_bytes + new_bytes > limit_bytes {
                continue;
            }
            let held_bytes: u64 = trace
                .layers(image)
                .iter()
                .filter(|d| !self.layers.get(*d).is_some_and(CacheEntry::is_held))
                .map(|d| trace.layer_size(d))
                .sum();
            if pinned && held_bytes > self.real_free_bytes {
                continue;
            }

            self.used_bytes += new_bytes;
            for digest in trace.layers(image) {
                let size = trace.layer_size(digest);
                let entry = self.layer_entry(digest);
                let was_held = entry.is_held();
                entry.touch(tick, pinned);
                if !was_held && entry.is_held() {
                    self.debit_real_free(size);
                }
            }
            self.image_entry(image).touch(tick, pinned);
            warmed += 1;
        }
        warmed
    }

    /// Release the containers scheduled to depart at `tick`
    ///
    /// Returns the number of containers released.
    pub fn process_departures(&mut self, tick: u64, trace: &dyn TraceProvider) -> usize {
        let Some(departing) = self.departures.remove(&tick) else {
            return 0;
        };
        for image in &departing {
            if let Some(entry) = self.images.get_mut(image) {
                entry.refcount = entry.refcount.saturating_sub(1);
            }
            self.live_containers = self.live_containers.saturating_sub(1);

            for digest in trace.layers(image) {
                let size = trace.layer_size(digest);
                if let Some(entry) = self.layers.get_mut(digest) {
                    let was_held = entry.is_held();
                    entry.refcount = entry.refcount.saturating_sub(1);
                    if was_held && !entry.is_held() {
                        self.real_free_bytes += size;
                    }
                }
            }
        }
        departing.len()
    }

    // placement is gated on reclaimable space; `verify` reports any drift
    fn debit_real_free(&mut self, size: u64) {
        self.real_free_bytes = self.real_free_bytes.saturating_sub(size);
    }

    /// Reclaim space until `used_bytes <= capacity * (1 - threshold)`
    ///
    /// Held entries are never removed. Entries used within the last
    /// `hot_duration` ticks are skipped unless usage is still above capacity
    /// once every other candidate is gone.
    pub fn evict(
        &mut self,
        tick: u64,
        mode: EvictionMode,
        threshold: f64,
        hot_duration: u64,
        trace: &dyn TraceProvider,
    ) -> EvictionReport {
        let target = self.eviction_target(threshold);
        let mut report = self.evict_pass(tick, mode, target, hot_duration, trace);
        if hot_duration > 0 && self.used_bytes > self.capacity_bytes {
            let forced = self.evict_pass(tick, mode, target, 0, trace);
            report.layers_removed += forced.layers_removed;
            report.images_removed += forced.images_removed;
            report.freed_bytes += forced.freed_bytes;
        }
        report
    }

    fn evict_pass(
        &mut self,
        tick: u64,
        mode: EvictionMode,
        target: u64,
        hot_duration: u64,
        trace: &dyn TraceProvider,
    ) -> EvictionReport {
        if self.used_bytes <= target {
            return EvictionReport::default();
        }
        let is_cold = |entry: &CacheEntry| {
            !entry.is_held() && entry.last_used.saturating_add(hot_duration) <= tick
        };

        match mode {
            EvictionMode::LayerLru | EvictionMode::LayerLfu => {
                let mut candidates: Vec<(String, CacheEntry)> = self
                    .layers
                    .iter()
                    .filter(|&(_, e)| is_cold(e))
                    .map(|(d, e)| (d.clone(), *e))
                    .collect();
                // stable sort keeps digest order among ties
                if mode == EvictionMode::LayerLru {
                    candidates.sort_by_key(|(_, e)| e.last_used);
                } else {
                    candidates.sort_by_key(|(_, e)| e.frequency);
                }
                self.evict_layers(target, candidates, trace)
            }
            EvictionMode::Image => {
                let mut candidates: Vec<(String, CacheEntry)> = self
                    .images
                    .iter()
                    .filter(|&(_, e)| is_cold(e))
                    .map(|(n, e)| (n.clone(), *e))
                    .collect();
                candidates.sort_by(|a, b| b.1.last_used.cmp(&a.1.last_used));
                self.evict_images(target, candidates, trace)
            }
        }
    }

    fn evict_layers(
        &mut self,
        target: u64,
        candidates: Vec<(String, CacheEntry)>,
        trace: &dyn TraceProvider,
    ) -> EvictionReport {
        let mut report = EvictionReport::default();
        for (digest, _) in candidates {
            if self.used_bytes <= target {
                break;
            }
            self.remove_layer(&digest, trace, &mut report);
            // an image cannot stay cached once one of its layers is gone
            for image in trace.layer_images(&digest) {
                if self.images.remove(image).is_some() {
                    report.images_removed += 1;
                }
            }
        }
        report
    }

    fn evict_images(
        &mut self,
        target: u64,
        candidates: Vec<(String, CacheEntry)>,
        trace: &dyn TraceProvider,
    ) -> EvictionReport {
        let mut report = EvictionReport::default();
        for (name, _) in candidates {
            if self.used_bytes <= target {
                break;
            }
            self.images.remove(&name);
            report.images_removed += 1;

            for digest in trace.layers(&name) {
                let Some(entry) = self.layers.get(digest) else {
                    continue;
                };
                if entry.is_held() {
                    continue;
                }
                let shared = trace
                    .layer_images(digest)
                    .iter()
                    .any(|owner| self.images.contains_key(owner));
                if !shared {
                    self.remove_layer(digest, trace, &mut report);
                }
            }
        }
        report
    }

    fn remove_layer(&mut self, digest: &str, trace: &dyn TraceProvider, report: &mut EvictionReport) {
        if self.layers.remove(digest).is_some() {
            let size = trace.layer_size(digest);
            self.used_bytes -= size;
            report.layers_removed += 1;
            report.freed_bytes += size;
        }
    }

    /// Check every bookkeeping invariant, returning the first violation
    pub fn verify(&self, trace: &dyn TraceProvider) -> Result<(), String> {
        if self.used_bytes > self.capacity_bytes {
            return Err(format!(
                "used {} exceeds capacity {}",
                self.used_bytes, self.capacity_bytes
            ));
        }
        if self.live_containers > self.max_containers {
            return Err(format!(
                "{} live containers exceed limit {}",
                self.live_containers, self.max_containers
            ));
        }

        let mut cached_bytes = 0;
        let mut held_bytes = 0;
        for (digest, entry) in &self.layers {
            let size = trace.layer_size(digest);
            cached_bytes += size;
            if entry.is_held() {
                held_bytes += size;
            }
        }
        if cached_bytes != self.used_bytes {
            return Err(format!(
                "used {} does not match cached layer bytes {}",
                self.used_bytes, cached_bytes
            ));
        }
        if held_bytes > self.used_bytes {
            return Err(format!(
                "held bytes {} exceed used {}",
                held_bytes, self.used_bytes
            ));
        }
        if self.capacity_bytes.checked_sub(held_bytes) != Some(self.real_free_bytes) {
            return Err(format!(
                "reclaimable space {} does not match capacity {} minus held {}",
                self.real_free_bytes, self.capacity_bytes, held_bytes
            ));
        }

        for image in self.images.keys() {
            for digest in trace.layers(image) {
                if !self.layers.contains_key(digest) {
                    return Err(format!("image {image} cached without layer {digest}"));
                }
            }
        }

        let queued: usize = self.departures.values().map(Vec::len).sum();
        if queued != self.live_containers {
            return Err(format!(
                "{} queued departures but {} live containers",
                queued, self.live_containers
            ));
        }

        let mut image_refs: BTreeMap<&str, u32> = BTreeMap::new();
        let mut layer_refs: BTreeMap<&str, u32> = BTreeMap::new();
        for image in self.departures.values().flatten() {
            *image_refs.entry(image.as_str()).or_default() += 1;
            for digest in trace.layers(image) {
                *layer_refs.entry(digest.as_str()).or_default() += 1;
            }
        }
        for (name, entry) in &self.images {
            let expected = image_refs.get(name.as_str()).copied().unwrap_or(0);
            if entry.refcount != expected {
                return Err(format!(
                    "image {name} refcount {} but {} live containers",
                    entry.refcount, expected
                ));
            }
        }
        for (digest, entry) in &self.layers {
            let expected = layer_refs.get(digest.as_str()).copied().unwrap_or(0);
            if entry.refcount != expected {
                return Err(format!(
                    "layer {digest} refcount {} but {} live containers",
                    entry.refcount, expected
                ));
            }
        }
        Ok(())
    }
}

/// The simulated cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub nodes: Vec<Node>,
}

impl Cluster {
    /// `node_num` empty nodes of identical capacity
    pub fn new(node_num: usize, store_size: u64, cont_cap: usize) -> Self {
        Cluster {
            nodes: (0..node_num)
                .map(|_| Node::new(store_size, cont_cap))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every node is out of container slots
    pub fn all_container_full(&self) -> bool {
        self.nodes.iter().all(Node::is_container_full)
    }

    /// Max-over-mean container load; 1.0 is perfectly even
    pub fn heating_ratio(&self) -> f64 {
        if self.nodes.is_empty() {
            return 1.0;
        }
        let total: usize = self.nodes.iter().map(|n| n.live_containers).sum();
        let mean = total as f64 / self.nodes.len() as f64;
        let mean = if mean == 0.0 { 1.0 } else { mean };
        let max = self
            .nodes
            .iter()
            .map(|n| n.live_containers)
            .max()
            .unwrap_or(0);
        max as f64 / mean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{PullTime, TraceBuilder, TraceSnapshot};

    fn trace() -> TraceSnapshot {
        TraceBuilder::new()
            .layer("l1", 100, Some(PullTime::new(1000, 500)))
            .layer("l2", 200, Some(PullTime::new(1000, 500)))
            .layer("l3", 300, Some(PullTime::new(2000, 0)))
            .layer("l4", 50, None)
            .image("a", 10.0, ["l1", "l2"])
            .image("b", 5.0, ["l1", "l3"])
            .image("c", 1.0, ["l4"])
            .build()
            .unwrap()
    }

    fn req(id: u64, images: &[&str], duration: u64) -> Request {
        Request::new(id, images.iter().map(|s| s.to_string()).collect(), duration)
    }

    #[test]
    fn test_place_caches_layers_and_schedules_departure() {
        let trace = trace();
        let mut node = Node::new(1000, 10);

        let placement = node.place(0, &req(1, &["a"], 5), false, &trace, MissingPullTime::Zero);

        assert_eq!(placement.new_bytes, 300);
        assert_eq!(placement.provisioning_ms, 3000);
        assert_eq!(placement.departure_tick, 8);
        assert_eq!(node.used_bytes, 300);
        assert_eq!(node.real_free_bytes, 700);
        assert_eq!(node.live_containers, 1);
        assert_eq!(node.departures.get(&8), Some(&vec!["a".to_string()]));
        assert_eq!(node.layers["l1"].refcount, 1);
        assert_eq!(node.images["a"].frequency, 1);
        node.verify(&trace).unwrap();
    }

    #[test]
    fn test_shared_layer_not_pulled_twice() {
        let trace = trace();
        let mut node = Node::new(1000, 10);
        node.place(0, &req(1, &["a"], 5), false, &trace, MissingPullTime::Zero);

        let placement = node.place(1, &req(2, &["b"], 5), false, &trace, MissingPullTime::Zero);
        assert_eq!(placement.new_bytes, 300);
        assert_eq!(placement.provisioning_ms, 2000);
        assert_eq!(node.used_bytes, 600);
        assert_eq!(node.layers["l1"].refcount, 2);
        node.verify(&trace).unwrap();
    }

    #[test]
    fn test_resident_images_cost_nothing() {
        let trace = trace();
        let mut node = Node::new(1000, 10);
        node.place(0, &req(1, &["a"], 5), false, &trace, MissingPullTime::Zero);

        let cost = node.provisioning(&req(2, &["a"], 1), &trace, MissingPullTime::Zero);
        assert_eq!(cost.ms, 0);
    }

    #[test]
    fn test_missing_pull_time_counted() {
        let trace = trace();
        let node = Node::new(1000, 10);
        let cost = node.provisioning(&req(1, &["c"], 1), &trace, MissingPullTime::Zero);
        assert_eq!(cost, Provisioning { ms: 0, missing_pull_estimates: 1 });

        let cost = node.provisioning(&req(1, &["c"], 1), &trace, MissingPullTime::SizeModel);
        assert_eq!(cost.ms, 184);
    }

    #[test]
    fn test_departures_release_references() {
        let trace = trace();
        let mut node = Node::new(1000, 10);
        node.place(0, &req(1, &["a"], 5), false, &trace, MissingPullTime::Zero);
        node.place(0, &req(2, &["b"], 5), false, &trace, MissingPullTime::Zero);
        // b only pulls l3 (2s) and departs at 7, a departs at 8
        assert_eq!(node.process_departures(7, &trace), 1);

        assert_eq!(node.live_containers, 1);
        assert_eq!(node.images["b"].refcount, 0);
        assert_eq!(node.layers["l1"].refcount, 1);
        assert_eq!(node.layers["l3"].refcount, 0);
        // only l3 became reclaimable, l1 is still held by a
        assert_eq!(node.real_free_bytes, 1000 - 300);
        assert_eq!(node.used_bytes, 600);
        node.verify(&trace).unwrap();

        assert_eq!(node.process_departures(8, &trace), 1);
        assert_eq!(node.real_free_bytes, 1000);
        assert_eq!(node.live_containers, 0);
        node.verify(&trace).unwrap();
    }

    #[test]
    fn test_instant_container_departs_next_tick() {
        let trace = trace();
        let mut node = Node::new(1000, 1);
        // no pull time and no duration still holds the slot until tick 5
        let placement = node.place(4, &req(1, &["c"], 0), false, &trace, MissingPullTime::Zero);
        assert_eq!(placement.departure_tick, 5);
        assert!(node.is_container_full());

        assert_eq!(node.process_departures(5, &trace), 1);
        assert_eq!(node.live_containers, 0);
        assert_eq!(node.layers["l4"].refcount, 0);
        node.verify(&trace).unwrap();
    }

    #[test]
    fn test_multi_image_request_counts_shared_layer_per_container() {
        let trace = trace();
        let mut node = Node::new(1000, 10);
        let placement = node.place(0, &req(1, &["a", "b"], 2), false, &trace, MissingPullTime::Zero);
        assert_eq!(placement.new_bytes, 600);
        assert_eq!(node.layers["l1"].refcount, 2);
        assert_eq!(node.live_containers, 2);
        node.verify(&trace).unwrap();

        node.process_departures(placement.departure_tick, &trace);
        assert_eq!(node.layers["l1"].refcount, 0);
        assert_eq!(node.real_free_bytes, 1000);
        node.verify(&trace).unwrap();
    }

    #[test]
    fn test_image_eviction_removes_unshared_layers() {
        let trace = TraceBuilder::new()
            .layer("l1", 950, None)
            .image("a", 1.0, ["l1"])
            .build()
            .unwrap();
        let mut node = Node::new(1000, 10);
        node.warm(0, &["a".to_string()], false, 1000, &trace);
        assert_eq!(node.used_bytes, 950);

        let report = node.evict(1, EvictionMode::Image, 0.1, 0, &trace);
        assert_eq!(report.freed_bytes, 950);
        assert!(node.images.is_empty());
        assert!(node.layers.is_empty());
        node.verify(&trace).unwrap();
    }

    #[test]
    fn test_image_eviction_keeps_shared_layer() {
        let trace = TraceBuilder::new()
            .layer("l1", 300, None)
            .layer("l2", 400, None)
            .layer("l3", 100, None)
            .image("a", 1.0, ["l1", "l2"])
            .image("b", 1.0, ["l1", "l3"])
            .build()
            .unwrap();
        let mut node = Node::new(1000, 10);
        node.warm(0, &["b".to_string()], false, 1000, &trace);
        node.warm(1, &["a".to_string()], false, 1000, &trace);
        assert_eq!(node.used_bytes, 800);

        let report = node.evict(2, EvictionMode::Image, 0.3, 0, &trace);
        assert_eq!(report.images_removed, 1);
        assert_eq!(report.freed_bytes, 400);
        assert!(!node.images.contains_key("a"));
        assert!(node.images.contains_key("b"));
        assert!(node.layers.contains_key("l1"));
        assert!(!node.layers.contains_key("l2"));
        node.verify(&trace).unwrap();
    }

    #[test]
    fn test_layer_eviction_cascades_to_images() {
        let trace = trace();
        let mut node = Node::new(1000, 10);
        node.warm(0, &["a".to_string()], false, 1000, &trace);
        node.warm(5, &["b".to_string()], false, 1000, &trace);
        assert_eq!(node.used_bytes, 600);

        // LRU removes l2 first (last used 0); l1 was touched at 5 by b
        let report = node.evict(6, EvictionMode::LayerLru, 0.5, 0, &trace);
        assert_eq!(report.layers_removed, 1);
        assert_eq!(report.freed_bytes, 200);
        assert!(!node.images.contains_key("a"));
        assert!(node.images.contains_key("b"));
        node.verify(&trace).unwrap();
    }

    #[test]
    fn test_layer_lfu_order() {
        let trace = trace();
        let mut node = Node::new(1000, 10);
        node.warm(0, &["b".to_string()], false, 1000, &trace);
        node.warm(1, &["b".to_string()], false, 1000, &trace);
        node.warm(2, &["a".to_string()], false, 1000, &trace);
        // frequencies: l1 = 3, l3 = 2, l2 = 1
        let report = node.evict(3, EvictionMode::LayerLfu, 0.6, 0, &trace);
        assert_eq!(report.layers_removed, 1);
        assert!(!node.layers.contains_key("l2"));
        assert!(node.layers.contains_key("l3"));
        node.verify(&trace).unwrap();
    }

    #[test]
    fn test_eviction_never_removes_held_entries() {
        let trace = trace();
        let mut node = Node::new(700, 10);
        node.place(0, &req(1, &["a"], 50), false, &trace, MissingPullTime::Zero);
        node.warm(0, &["c".to_string()], true, 700, &trace);
        node.warm(1, &["b".to_string()], false, 700, &trace);

        for mode in [EvictionMode::Image, EvictionMode::LayerLru, EvictionMode::LayerLfu] {
            let mut copy = node.clone();
            copy.evict(2, mode, 0.9, 0, &trace);
            assert!(copy.images.contains_key("a"));
            assert!(copy.layers.contains_key("l1"));
            assert!(copy.layers.contains_key("l2"));
            assert!(copy.images.contains_key("c"));
            assert!(copy.layers.contains_key("l4"));
            // only l3 (300) is reclaimable
            assert_eq!(copy.used_bytes, 350);
            copy.verify(&trace).unwrap();
        }
    }

    #[test]
    fn test_hot_duration_protects_recent_entries() {
        let trace = TraceBuilder::new()
            .layer("l1", 950, None)
            .image("a", 1.0, ["l1"])
            .build()
            .unwrap();
        let mut node = Node::new(1000, 10);
        node.warm(10, &["a".to_string()], false, 1000, &trace);

        let report = node.evict(15, EvictionMode::Image, 0.1, 20, &trace);
        assert_eq!(report, EvictionReport::default());
        assert!(node.images.contains_key("a"));

        let report = node.evict(30, EvictionMode::Image, 0.1, 20, &trace);
        assert_eq!(report.freed_bytes, 950);
    }

    #[test]
    fn test_hot_entries_yield_when_over_capacity() {
        let trace = trace();
        let mut node = Node::new(500, 10);
        node.warm(0, &["a".to_string()], false, 500, &trace);
        // b is placed on top of a warm cache: 300 + 50 pushes past capacity
        node.place(1, &req(1, &["b"], 5), false, &trace, MissingPullTime::Zero);
        assert_eq!(node.used_bytes, 600);

        node.evict(1, EvictionMode::Image, 0.1, 100, &trace);
        assert!(node.used_bytes <= node.capacity_bytes);
        assert!(!node.images.contains_key("a"));
        node.verify(&trace).unwrap();
    }

    #[test]
    fn test_warm_respects_limit_and_pins() {
        let trace = trace();
        let mut node = Node::new(1000, 10);
        let warmed = node.warm(
            0,
            &["a".to_string(), "b".to_string(), "c".to_string()],
            true,
            500,
            &trace,
        );
        // a (300) fits, b needs 300 more and is skipped, c (50) fits
        assert_eq!(warmed, 2);
        assert_eq!(node.used_bytes, 350);
        assert_eq!(node.real_free_bytes, 650);
        assert!(node.images["a"].pinned);
        assert_eq!(node.images["a"].refcount, 0);
        assert_eq!(node.live_containers, 0);
        node.verify(&trace).unwrap();
    }

    #[test]
    fn test_pinning_is_sticky() {
        let trace = trace();
        let mut node = Node::new(1000, 10);
        node.warm(0, &["a".to_string()], true, 1000, &trace);
        let placement = node.place(1, &req(1, &["a"], 1), false, &trace, MissingPullTime::Zero);
        node.process_departures(placement.departure_tick, &trace);

        assert!(node.layers["l1"].pinned);
        assert_eq!(node.real_free_bytes, 700);
        node.verify(&trace).unwrap();
    }

    #[test]
    fn test_required_bytes_ignores_held_layers() {
        let trace = trace();
        let mut node = Node::new(1000, 10);
        node.place(0, &req(1, &["a"], 5), false, &trace, MissingPullTime::Zero);
        // l1 held by a, l3 new
        assert_eq!(node.required_bytes(&req(2, &["b"], 1), &trace), 300);
        node.process_departures(8, &trace);
        // nothing held anymore; cached but reclaimable layers still count
        assert_eq!(node.required_bytes(&req(2, &["b"], 1), &trace), 400);
    }

    #[test]
    fn test_scores() {
        let trace = trace();
        let mut node = Node::new(1000, 10);
        node.place(0, &req(1, &["a"], 5), false, &trace, MissingPullTime::Zero);

        assert_eq!(node.dependency_score(&req(2, &["b"], 1), &trace), 100);
        assert_eq!(node.resident_image_bytes(&req(2, &["b"], 1), &trace), 0);
        assert_eq!(node.resident_image_bytes(&req(2, &["a", "b"], 1), &trace), 300);
    }

    #[test]
    fn test_verify_detects_corruption() {
        let trace = trace();
        let mut node = Node::new(1000, 10);
        node.place(0, &req(1, &["a"], 5), false, &trace, MissingPullTime::Zero);

        let mut broken = node.clone();
        broken.layers.remove("l2");
        assert!(broken.verify(&trace).is_err());

        let mut broken = node.clone();
        broken.real_free_bytes += 1;
        assert!(broken.verify(&trace).is_err());

        let mut broken = node.clone();
        broken.live_containers = 11;
        assert!(broken.verify(&trace).is_err());
    }

    #[test]
    fn test_eviction_mode_selection() {
        assert_eq!(
            EvictionMode::for_run(true, true, EvictPolicy::DepLru),
            EvictionMode::LayerLru
        );
        assert_eq!(
            EvictionMode::for_run(true, true, EvictPolicy::DepLfu),
            EvictionMode::LayerLfu
        );
        assert_eq!(
            EvictionMode::for_run(true, false, EvictPolicy::DepLru),
            EvictionMode::Image
        );
        assert_eq!(
            EvictionMode::for_run(false, true, EvictPolicy::DepLfu),
            EvictionMode::Image
        );
    }

    #[test]
    fn test_cluster_helpers() {
        let trace = trace();
        let mut cluster = Cluster::new(2, 1000, 1);
        assert!(!cluster.all_container_full());
        assert_eq!(cluster.heating_ratio(), 0.0);

        cluster.nodes[0].place(0, &req(1, &["c"], 1), false, &trace, MissingPullTime::Zero);
        assert!(!cluster.all_container_full());
        assert_eq!(cluster.heating_ratio(), 2.0);

        cluster.nodes[1].place(0, &req(2, &["c"], 1), false, &trace, MissingPullTime::Zero);
        assert!(cluster.all_container_full());
    }
}
