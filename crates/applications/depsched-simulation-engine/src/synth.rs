//! Synthetic trace generation
//!
//! Models a registry where images are built on a small pool of shared base
//! layers (OS and runtime layers) topped with a few image-specific layers:
//! - base layers are chosen with a skewed preference, so popular bases are
//!   shared by many images
//! - layer sizes are log-normal, base layers larger than top layers
//! - pull times follow the size model from [`crate::trace::pull_time_from_size`]
//! - raw image popularity is a power law over a random ranking

use rand::distributions::WeightedIndex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, LogNormal};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::trace::{pull_time_from_size, PullTime, TraceBuilder, TraceSnapshot};
use crate::types::MB;

/// Share of the modeled pull time spent downloading (rest is registration)
const DOWNLOAD_SHARE: f64 = 0.6;

/// Smallest layer the generator emits
const MIN_LAYER_SIZE: u64 = 1024;

/// Parameters of the synthetic registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticTraceConfig {
    pub seed: u64,
    pub num_images: usize,
    /// Size of the shared base layer pool
    pub num_base_layers: usize,
    pub min_base_layers: usize,
    pub max_base_layers: usize,
    pub min_top_layers: usize,
    pub max_top_layers: usize,
    /// Median size of an image-specific layer
    pub top_layer_median_bytes: u64,
    /// Median size of a shared base layer
    pub base_layer_median_bytes: u64,
    /// Log-normal shape parameter for both layer kinds
    pub size_sigma: f64,
    /// Exponent of the raw popularity power law
    pub popularity_exponent: f64,
}

impl Default for SyntheticTraceConfig {
    fn default() -> Self {
        SyntheticTraceConfig {
            seed: 42,
            num_images: 500,
            num_base_layers: 40,
            min_base_layers: 1,
            max_base_layers: 3,
            min_top_layers: 1,
            max_top_layers: 4,
            top_layer_median_bytes: 8 * MB,
            base_layer_median_bytes: 60 * MB,
            size_sigma: 1.0,
            popularity_exponent: 1.1,
        }
    }
}

impl SyntheticTraceConfig {
    fn check(&self) -> Result<()> {
        if self.num_images == 0 || self.num_base_layers == 0 {
            return Err(SimError::config(
                "synthetic trace needs at least one image and one base layer",
            ));
        }
        if self.min_base_layers > self.max_base_layers || self.min_top_layers > self.max_top_layers
        {
            return Err(SimError::config("synthetic trace layer ranges are inverted"));
        }
        if self.max_base_layers + self.max_top_layers == 0 {
            return Err(SimError::config("synthetic images must have layers"));
        }
        Ok(())
    }

    /// Generate a trace; identical configs produce identical traces
    pub fn generate(&self) -> Result<TraceSnapshot> {
        self.check()?;
        let mut rng = StdRng::seed_from_u64(self.seed);

        let base_sizes = log_normal(self.base_layer_median_bytes, self.size_sigma)?;
        let top_sizes = log_normal(self.top_layer_median_bytes, self.size_sigma)?;

        let mut builder = TraceBuilder::new();

        let base_digests: Vec<String> = (0..self.num_base_layers)
            .map(|i| format!("sha256:base-{i:04}"))
            .collect();
        for digest in &base_digests {
            let size = sample_size(&base_sizes, &mut rng);
            builder = builder.layer(digest.clone(), size, Some(modeled_pull(size)));
        }

        // Lower-indexed bases are preferred, like common distro layers
        let base_pick = WeightedIndex::new((0..self.num_base_layers).map(|i| 1.0 / (i + 1) as f64))
            .map_err(|e| SimError::config(format!("base layer weights: {e}")))?;

        let mut ranks: Vec<usize> = (1..=self.num_images).collect();
        ranks.shuffle(&mut rng);

        for (i, rank) in ranks.into_iter().enumerate() {
            let name = format!("img-{i:04}");
            let mut layers: Vec<String> = Vec::new();

            let num_base = rng
                .gen_range(self.min_base_layers..=self.max_base_layers)
                .min(self.num_base_layers);
            while layers.len() < num_base {
                let digest = &base_digests[base_pick.sample(&mut rng)];
                if !layers.contains(digest) {
                    layers.push(digest.clone());
                }
            }

            let mut num_top = rng.gen_range(self.min_top_layers..=self.max_top_layers);
            if layers.is_empty() && num_top == 0 {
                num_top = 1;
            }
            for j in 0..num_top {
                let digest = format!("sha256:{name}-top-{j}");
                let size = sample_size(&top_sizes, &mut rng);
                builder = builder.layer(digest.clone(), size, Some(modeled_pull(size)));
                layers.push(digest);
            }

            let popularity = (1.0e6 / (rank as f64).powf(self.popularity_exponent)).round();
            builder = builder.image(name, popularity, layers);
        }

        builder.build()
    }
}

fn log_normal(median: u64, sigma: f64) -> Result<LogNormal<f64>> {
    LogNormal::new((median.max(1) as f64).ln(), sigma)
        .map_err(|e| SimError::config(format!("layer size distribution: {e}")))
}

fn sample_size(dist: &LogNormal<f64>, rng: &mut StdRng) -> u64 {
    (dist.sample(rng).round() as u64).max(MIN_LAYER_SIZE)
}

fn modeled_pull(size: u64) -> PullTime {
    let total = pull_time_from_size(size);
    let download = (total as f64 * DOWNLOAD_SHARE).round() as u64;
    PullTime::new(download, total - download)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TraceProvider;

    fn small_config() -> SyntheticTraceConfig {
        SyntheticTraceConfig {
            num_images: 50,
            num_base_layers: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_generation_is_deterministic() {
        let a = small_config().generate().unwrap();
        let b = small_config().generate().unwrap();
        assert_eq!(a, b);

        let other = SyntheticTraceConfig {
            seed: 7,
            ..small_config()
        }
        .generate()
        .unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn test_images_share_base_layers() {
        let trace = small_config().generate().unwrap();
        assert_eq!(trace.image_list().len(), 50);

        // With 50 images on 5 bases, some base must be shared
        let shared = (0..5)
            .map(|i| format!("sha256:base-{i:04}"))
            .any(|d| trace.layer_images(&d).len() > 1);
        assert!(shared);
    }

    #[test]
    fn test_sizes_and_pull_times() {
        let trace = small_config().generate().unwrap();
        for name in trace.image_list() {
            let layers = trace.layers(&name);
            assert!(!layers.is_empty());
            let sum: u64 = layers.iter().map(|d| trace.layer_size(d)).sum();
            assert_eq!(trace.image_size(&name), sum);
            for digest in layers {
                let pull = trace.layer_pull_time(digest).unwrap();
                assert_eq!(pull.total_ms(), pull_time_from_size(trace.layer_size(digest)));
                assert!(trace.layer_size(digest) >= MIN_LAYER_SIZE);
            }
        }
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        let config = SyntheticTraceConfig {
            min_top_layers: 5,
            max_top_layers: 2,
            ..Default::default()
        };
        assert!(config.generate().is_err());
    }
}
