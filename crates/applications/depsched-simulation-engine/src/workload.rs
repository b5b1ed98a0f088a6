//! Request workload
//!
//! A workload is the per-tick arrival counts plus the flat request list they
//! index into. It is generated once per experiment from the config seed and
//! replayed unchanged for every compared policy.

use std::fs;
use std::path::Path;

use rand::distributions::WeightedIndex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Poisson};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::SimConfig;
use crate::error::{Result, SimError};
use crate::trace::{PopularityModel, TraceProvider};
use crate::types::Request;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    /// Requests arriving at each tick
    pub arrivals: Vec<usize>,
    /// Requests in arrival order
    pub requests: Vec<Request>,
}

impl Workload {
    /// Draw arrivals and requests from the config's seed
    ///
    /// Poisson(`req_rate`) counts are drawn until they cover
    /// `sim_length * req_rate` requests; the request list matches their sum.
    pub fn generate(config: &SimConfig, trace: &dyn TraceProvider) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(config.seed);

        let poisson = Poisson::new(config.req_rate)
            .map_err(|e| SimError::config(format!("arrival distribution: {e}")))?;
        let target = config.target_requests();
        let mut arrivals = Vec::new();
        let mut total = 0usize;
        while total < target {
            let count = poisson.sample(&mut rng) as usize;
            arrivals.push(count);
            total += count;
        }

        let population = trace.population(config.popularity_model());
        if population.is_empty() {
            return Err(SimError::trace("trace has no images to request"));
        }
        let names: Vec<String> = population.iter().map(|(name, _)| name.clone()).collect();
        let weighted = match config.popularity_model() {
            PopularityModel::Uniform => None,
            _ => Some(
                WeightedIndex::new(population.iter().map(|(_, w)| *w))
                    .map_err(|e| SimError::trace(format!("image popularity weights: {e}")))?,
            ),
        };

        let mut requests = Vec::with_capacity(total);
        for id in 0..total as u64 {
            let count = rng.gen_range(1..=config.max_num_image);
            let images: Vec<String> = match &weighted {
                None => names
                    .choose_multiple(&mut rng, count.min(names.len()))
                    .cloned()
                    .collect(),
                Some(dist) => (0..count)
                    .map(|_| names[dist.sample(&mut rng)].clone())
                    .collect(),
            };
            let duration = rng.gen_range(1..=config.cont_length);
            requests.push(Request::new(id, images, duration));
        }

        debug!(
            "generated {} requests over {} arrival ticks",
            requests.len(),
            arrivals.len()
        );
        Ok(Workload { arrivals, requests })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let workload: Workload = serde_json::from_str(&raw)?;
        workload.check()?;
        Ok(workload)
    }

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

    /// Reuse a saved workload, or generate one and save it
    pub fn load_or_generate(
        path: impl AsRef<Path>,
        config: &SimConfig,
        trace: &dyn TraceProvider,
    ) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            info!("reusing workload {}", path.display());
            return Self::load(path);
        }
        let workload = Self::generate(config, trace)?;
        workload.save(path)?;
        Ok(workload)
    }

    /// Arrival counts must add up to the request list and every request
    /// must run for at least one tick
    pub(crate) fn check(&self) -> Result<()> {
        let total: usize = self.arrivals.iter().sum();
        if total != self.requests.len() {
            return Err(SimError::config(format!(
                "workload arrivals sum to {} but list {} requests",
                total,
                self.requests.len()
            )));
        }
        if let Some(request) = self.requests.iter().find(|r| r.duration == 0) {
            return Err(SimError::config(format!(
                "request {} has zero duration",
                request.id
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Ticks that have arrivals scheduled
    pub fn arrival_ticks(&self) -> u64 {
        self.arrivals.len() as u64
    }
}
