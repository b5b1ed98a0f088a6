//! Result files
//!
//! Per policy run, in the result directory:
//! - `out_lat_percentiles_{policy}_{tag}.csv`: `p5,p25,p50,p75,p95,mean`
//! - `out_lat_{policy}_{tag}.csv`: one startup latency per line
//! - `out_provision_lat_percentiles_{policy}_{tag}.csv` and
//!   `out_provision_lat_{policy}_{tag}.csv`: the same for provisioning alone
//! - `out_meta_{policy}_{tag}.csv`: rejection counts, mean latency, rejection ratio
//!
//! plus one `summary_{tag}.json` covering every run.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::SimConfig;
use crate::error::Result;
use crate::simulator::PolicyReport;
use crate::telemetry::LatencyPercentiles;

/// Writes result files for one experiment
#[derive(Debug, Clone)]
pub struct ResultWriter {
    dir: PathBuf,
    tag: String,
}

#[derive(Serialize)]
struct Summary<'a> {
    run_tag: &'a str,
    config: &'a SimConfig,
    reports: &'a [PolicyReport],
}

impl ResultWriter {
    /// Create the result directory if needed
    pub fn new(dir: impl Into<PathBuf>, tag: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(ResultWriter {
            dir,
            tag: tag.into(),
        })
    }

    /// Writer for the config's result directory, `None` when output is disabled
    pub fn from_config(config: &SimConfig) -> Result<Option<Self>> {
        let Some(dir) = &config.result_dir else {
            return Ok(None);
        };
        let tag = config
            .run_tag
            .clone()
            .unwrap_or_else(|| chrono::Local::now().format("%Y%m%d%H%M%S").to_string());
        Ok(Some(Self::new(dir, tag)?))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    fn path(&self, stem: &str, policy: &str) -> PathBuf {
        self.dir.join(format!("{stem}_{policy}_{}.csv", self.tag))
    }

    /// Write every per-policy file; returns the paths written
    pub fn write_policy(&self, report: &PolicyReport) -> Result<Vec<PathBuf>> {
        let policy = report.policy.as_str();
        let files = vec![
            self.path("out_lat_percentiles", policy),
            self.path("out_lat", policy),
            self.path("out_provision_lat_percentiles", policy),
            self.path("out_provision_lat", policy),
            self.path("out_meta", policy),
        ];

        write_percentiles(&files[0], &report.latency, report.mean_latency_ms)?;
        write_samples(&files[1], &report.latencies_ms)?;
        write_percentiles(&files[2], &report.provisioning, report.mean_provisioning_ms)?;
        write_samples(&files[3], &report.provisioning_ms)?;
        write_meta(&files[4], report)?;
        Ok(files)
    }

    pub fn write_summary(&self, config: &SimConfig, reports: &[PolicyReport]) -> Result<PathBuf> {
        let path = self.dir.join(format!("summary_{}.json", self.tag));
        let summary = Summary {
            run_tag: &self.tag,
            config,
            reports,
        };
        fs::write(&path, serde_json::to_string_pretty(&summary)?)?;
        Ok(path)
    }
}

/// One row; `mean` is the rounded mean (-1 when empty) rather than the raw one
fn write_percentiles(path: &Path, p: &LatencyPercentiles, mean: f64) -> Result<()> {
    let mut f = File::create(path)?;
    write!(f, "{},{},{},{},{},{:.0}", p.p5, p.p25, p.p50, p.p75, p.p95, mean)?;
    Ok(())
}

fn write_samples(path: &Path, samples: &[u64]) -> Result<()> {
    let mut f = BufWriter::new(File::create(path)?);
    for sample in samples {
        writeln!(f, "{sample}")?;
    }
    f.flush()?;
    Ok(())
}

fn write_meta(path: &Path, report: &PolicyReport) -> Result<()> {
    let mut f = File::create(path)?;
    writeln!(f, "cont_limit_rej,{}", report.container_limit_rejections)?;
    writeln!(f, "store_limit_rej,{}", report.store_limit_rejections)?;
    writeln!(f, "mean_lat,{:.0}", report.mean_latency_ms)?;
    writeln!(f, "rej_ratio,{}", report.rejection_ratio)?;
    Ok(())
}
