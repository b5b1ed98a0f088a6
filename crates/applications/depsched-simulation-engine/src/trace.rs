//! Image/layer trace access
//!
//! The simulator only depends on the [`TraceProvider`] query contract. The
//! bundled implementation, [`TraceSnapshot`], is an in-memory table that can
//! be persisted to and reloaded from a JSON snapshot, so repeated experiments
//! skip the (external) database export entirely.
//!
//! All maps are ordered so that iteration, sampling and tie-breaking never
//! depend on hash seeds.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SimError};
use crate::synth::SyntheticTraceConfig;
use crate::types::GB;

/// Largest image kept by default when filtering a trace (10.2 gb)
pub const DEFAULT_MAX_IMAGE_SIZE: u64 = 10_200 * (GB / 1000);

/// Layers at or below this size pull in a flat time
const FLAT_PULL_SIZE: u64 = 100_000;
const FLAT_PULL_MS: u64 = 184;
const LINEAR_PULL_MS_PER_BYTE: f64 = 2.50e-5;
const LINEAR_PULL_BASE_MS: f64 = 367.0;

/// Measured pull cost of a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullTime {
    pub download_ms: u64,
    pub registration_ms: u64,
}

impl PullTime {
    pub fn new(download_ms: u64, registration_ms: u64) -> Self {
        PullTime {
            download_ms,
            registration_ms,
        }
    }

    pub fn total_ms(&self) -> u64 {
        self.download_ms + self.registration_ms
    }
}

/// Estimate pull time from layer size alone
///
/// Piecewise model fit over measured pulls on m4.xlarge: small layers are
/// dominated by registration overhead, larger ones grow linearly.
pub fn pull_time_from_size(size: u64) -> u64 {
    if size <= FLAT_PULL_SIZE {
        FLAT_PULL_MS
    } else {
        (LINEAR_PULL_MS_PER_BYTE * size as f64 + LINEAR_PULL_BASE_MS).round() as u64
    }
}

/// What to charge for a layer with no pull measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MissingPullTime {
    /// Charge nothing
    #[default]
    Zero,
    /// Charge [`pull_time_from_size`]
    SizeModel,
}

/// Pull cost lookup result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullEstimate {
    pub ms: u64,
    /// The trace had no measurement and the fallback was used
    pub missing: bool,
}

/// Resolve the pull cost of one layer, applying the fallback if needed
pub fn pull_estimate(
    trace: &dyn TraceProvider,
    digest: &str,
    fallback: MissingPullTime,
) -> PullEstimate {
    match trace.layer_pull_time(digest) {
        Some(pull) => PullEstimate {
            ms: pull.total_ms(),
            missing: false,
        },
        None => {
            let ms = match fallback {
                MissingPullTime::Zero => 0,
                MissingPullTime::SizeModel => pull_time_from_size(trace.layer_size(digest)),
            };
            PullEstimate { ms, missing: true }
        }
    }
}

/// How image popularity weights are derived
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PopularityModel {
    /// Pull counts as recorded in the trace
    Raw,
    /// Zipf weights by descending raw popularity rank
    Zipf { alpha: f64 },
    /// Every image weighted equally
    Uniform,
}

/// Read-only query contract over image and layer metadata
pub trait TraceProvider {
    /// Total size of an image in bytes (0 if unknown)
    fn image_size(&self, image: &str) -> u64;

    /// Layer digests owned by an image
    fn layers(&self, image: &str) -> &[String];

    /// Size of a layer in bytes (0 if unknown)
    fn layer_size(&self, digest: &str) -> u64;

    /// Measured pull cost of a layer, if the trace has one
    fn layer_pull_time(&self, digest: &str) -> Option<PullTime>;

    /// Images that own a layer
    fn layer_images(&self, digest: &str) -> &[String];

    /// `(image, raw popularity)` for every image, in name order
    fn image_population(&self) -> Vec<(String, f64)>;

    /// Every image name, in name order
    fn image_list(&self) -> Vec<String> {
        self.image_population()
            .into_iter()
            .map(|(name, _)| name)
            .collect()
    }

    /// Popularity list under the given model
    fn population(&self, model: PopularityModel) -> Vec<(String, f64)> {
        match model {
            PopularityModel::Raw => self.image_population(),
            PopularityModel::Zipf { alpha } => zipf_population(self.image_population(), alpha),
            PopularityModel::Uniform => self
                .image_population()
                .into_iter()
                .map(|(name, _)| (name, 1.0))
                .collect(),
        }
    }

    /// The `rank` most popular images, most popular first
    fn top_images(&self, rank: usize) -> Vec<String> {
        ranked(self.image_population())
            .into_iter()
            .take(rank)
            .map(|(name, _)| name)
            .collect()
    }

    /// Up to `count` distinct images sampled uniformly
    fn random_images(&self, count: usize, rng: &mut StdRng) -> Vec<String> {
        let list = self.image_list();
        list.choose_multiple(rng, count.min(list.len()))
            .cloned()
            .collect()
    }
}

/// Sort by descending popularity, ties by name
fn ranked(mut population: Vec<(String, f64)>) -> Vec<(String, f64)> {
    population.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    population
}

/// Replace raw popularity with Zipf weights
///
/// `weight(rank) = ((1 - alpha) / N^(1 - alpha)) / rank^alpha`, ranks
/// starting at 1 for the most popular image.
pub fn zipf_population(population: Vec<(String, f64)>, alpha: f64) -> Vec<(String, f64)> {
    let n = population.len() as f64;
    let omega = (1.0 - alpha) / n.powf(1.0 - alpha);
    ranked(population)
        .into_iter()
        .enumerate()
        .map(|(i, (name, _))| (name, omega / ((i + 1) as f64).powf(alpha)))
        .collect()
}

/// Image record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub size: u64,
    pub popularity: f64,
    pub layers: Vec<String>,
}

/// Layer record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub size: u64,
    #[serde(default)]
    pub pull: Option<PullTime>,
    /// Owning images; rebuilt from the image table on load
    #[serde(skip)]
    pub images: Vec<String>,
}

/// Size and count summary of a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceStats {
    pub images: usize,
    pub layers: usize,
    pub total_image_bytes: u64,
    pub max_image_bytes: u64,
    pub mean_image_bytes: u64,
    pub total_layer_bytes: u64,
    pub max_layer_bytes: u64,
    pub mean_layer_bytes: u64,
    pub layers_without_pull_time: usize,
}

/// In-memory trace backed by a JSON snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceSnapshot {
    images: BTreeMap<String, ImageInfo>,
    layers: BTreeMap<String, LayerInfo>,
}

impl TraceSnapshot {
    /// Build a snapshot from raw tables, checking integrity
    pub fn from_parts(
        images: BTreeMap<String, ImageInfo>,
        layers: BTreeMap<String, LayerInfo>,
    ) -> Result<Self> {
        let mut snapshot = TraceSnapshot { images, layers };
        snapshot.reindex();
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Load a snapshot written by [`TraceSnapshot::save`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let snapshot: TraceSnapshot = serde_json::from_str(&raw)?;
        let snapshot = Self::from_parts(snapshot.images, snapshot.layers)?;
        debug!(
            "loaded trace snapshot {} ({} images, {} layers)",
            path.display(),
            snapshot.images.len(),
            snapshot.layers.len()
        );
        Ok(snapshot)
    }

    /// Persist the snapshot as JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    /// Reload a snapshot if one exists, otherwise generate and persist one
    pub fn load_or_generate(path: impl AsRef<Path>, synth: &SyntheticTraceConfig) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        info!(
            "no trace snapshot at {}, generating a synthetic trace",
            path.display()
        );
        let snapshot = synth.generate()?;
        snapshot.save(path)?;
        Ok(snapshot)
    }

    /// Drop images larger than `max_size` and any layer left without owners
    pub fn retain_images_up_to(&mut self, max_size: u64) -> usize {
        let before = self.images.len();
        self.images.retain(|_, image| image.size <= max_size);
        let removed = before - self.images.len();
        if removed > 0 {
            self.reindex();
            self.layers.retain(|_, layer| !layer.images.is_empty());
            debug!("filtered {} images larger than {} bytes", removed, max_size);
        }
        removed
    }

    /// Rebuild each layer's owner list from the image table
    fn reindex(&mut self) {
        for layer in self.layers.values_mut() {
            layer.images.clear();
        }
        for (name, image) in &self.images {
            for digest in &image.layers {
                if let Some(layer) = self.layers.get_mut(digest) {
                    layer.images.push(name.clone());
                }
            }
        }
    }

    /// Every digest an image references must have a layer record
    pub fn validate(&self) -> Result<()> {
        for (name, image) in &self.images {
            if image.layers.is_empty() {
                return Err(SimError::trace(format!("image {name} has no layers")));
            }
            for digest in &image.layers {
                if !self.layers.contains_key(digest) {
                    return Err(SimError::trace(format!(
                        "image {name} references unknown layer {digest}"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> TraceStats {
        let image_sizes: Vec<u64> = self.images.values().map(|i| i.size).collect();
        let layer_sizes: Vec<u64> = self.layers.values().map(|l| l.size).collect();
        let mean = |sizes: &[u64]| {
            if sizes.is_empty() {
                0
            } else {
                sizes.iter().sum::<u64>() / sizes.len() as u64
            }
        };

        TraceStats {
            images: image_sizes.len(),
            layers: layer_sizes.len(),
            total_image_bytes: image_sizes.iter().sum(),
            max_image_bytes: image_sizes.iter().copied().max().unwrap_or(0),
            mean_image_bytes: mean(&image_sizes),
            total_layer_bytes: layer_sizes.iter().sum(),
            max_layer_bytes: layer_sizes.iter().copied().max().unwrap_or(0),
            mean_layer_bytes: mean(&layer_sizes),
            layers_without_pull_time: self.layers.values().filter(|l| l.pull.is_none()).count(),
        }
    }

    pub fn image(&self, name: &str) -> Option<&ImageInfo> {
        self.images.get(name)
    }

    pub fn layer(&self, digest: &str) -> Option<&LayerInfo> {
        self.layers.get(digest)
    }
}

impl TraceProvider for TraceSnapshot {
    fn image_size(&self, image: &str) -> u64 {
        self.images.get(image).map(|i| i.size).unwrap_or(0)
    }

    fn layers(&self, image: &str) -> &[String] {
        self.images
            .get(image)
            .map(|i| i.layers.as_slice())
            .unwrap_or(&[])
    }

    fn layer_size(&self, digest: &str) -> u64 {
        self.layers.get(digest).map(|l| l.size).unwrap_or(0)
    }

    fn layer_pull_time(&self, digest: &str) -> Option<PullTime> {
        self.layers.get(digest).and_then(|l| l.pull)
    }

    fn layer_images(&self, digest: &str) -> &[String] {
        self.layers
            .get(digest)
            .map(|l| l.images.as_slice())
            .unwrap_or(&[])
    }

    fn image_population(&self) -> Vec<(String, f64)> {
        self.images
            .iter()
            .map(|(name, image)| (name.clone(), image.popularity))
            .collect()
    }
}

/// Incremental builder for traces, mostly for fixtures and generators
#[derive(Debug, Default)]
pub struct TraceBuilder {
    images: BTreeMap<String, ImageInfo>,
    layers: BTreeMap<String, LayerInfo>,
}

impl TraceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a layer with an optional pull measurement
    pub fn layer(mut self, digest: impl Into<String>, size: u64, pull: Option<PullTime>) -> Self {
        self.layers.insert(
            digest.into(),
            LayerInfo {
                size,
                pull,
                images: Vec::new(),
            },
        );
        self
    }

    /// Add an image; its size is the sum of its layers' sizes
    pub fn image<I, S>(mut self, name: impl Into<String>, popularity: f64, layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let layers: Vec<String> = layers.into_iter().map(Into::into).collect();
        let size = layers
            .iter()
            .filter_map(|d| self.layers.get(d))
            .map(|l| l.size)
            .sum();
        self.images.insert(
            name.into(),
            ImageInfo {
                size,
                popularity,
                layers,
            },
        );
        self
    }

    pub fn build(self) -> Result<TraceSnapshot> {
        TraceSnapshot::from_parts(self.images, self.layers)
    }
}
