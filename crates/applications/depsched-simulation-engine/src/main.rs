//! DepSched Simulation Engine CLI
//!
//! Command-line interface for comparing dependency-aware container placement
//! policies on a simulated cluster

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use depsched_simulation_engine::{
    config::SimConfig,
    simulator::{PolicyReport, Simulator},
    synth::SyntheticTraceConfig,
    trace::{TraceProvider, TraceSnapshot, DEFAULT_MAX_IMAGE_SIZE},
    types::{EvictPolicy, Policy, GB, MB},
    workload::Workload,
};

#[derive(Parser, Debug)]
#[command(name = "depsched-sim")]
#[command(about = "Simulate layer-aware container placement policies", long_about = None)]
struct Args {
    /// JSON run configuration (fields not given keep their defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Trace snapshot; a synthetic trace is generated and saved if missing
    #[arg(short, long, default_value = "trace.json")]
    trace: PathBuf,

    /// Number of images in a generated synthetic trace
    #[arg(long)]
    synth_images: Option<usize>,

    /// Workload file to reuse (generated and saved if missing)
    #[arg(short, long)]
    workload: Option<PathBuf>,

    /// Policies to compare (comma-separated: dep,dep-soft,kube,monkey)
    #[arg(short, long)]
    policies: Option<String>,

    /// Number of nodes
    #[arg(long)]
    node_num: Option<usize>,

    /// Layer store per node in GB
    #[arg(long)]
    store_size_gb: Option<f64>,

    /// Container slots per node
    #[arg(long)]
    cont_cap: Option<usize>,

    /// Mean request arrivals per tick
    #[arg(long)]
    req_rate: Option<f64>,

    /// Ticks of arrivals
    #[arg(long)]
    sim_length: Option<u64>,

    /// Random seed for workload and scheduling
    #[arg(long)]
    seed: Option<u64>,

    /// Eviction policy (dep-lru, dep-lfu, image-lru)
    #[arg(long)]
    evict_policy: Option<EvictPolicy>,

    /// Evict at layer granularity for dependency-aware policies
    #[arg(long)]
    evict_dep: bool,

    /// Warm every node before the run
    #[arg(long)]
    precached: bool,

    /// Top-N images to warm (negative: random images)
    #[arg(long, allow_negative_numbers = true)]
    cached_rank: Option<i64>,

    /// Blend load balancing into scores with this weight
    #[arg(long)]
    lb_ratio: Option<f64>,

    /// Enable delay scheduling for dependency-aware policies
    #[arg(long)]
    delay_sched: bool,

    /// Directory for result files
    #[arg(long)]
    result_dir: Option<PathBuf>,

    /// Suffix for result files (defaults to a timestamp)
    #[arg(long)]
    run_tag: Option<String>,

    /// Skip writing result files
    #[arg(long)]
    no_results: bool,

    /// Output JSON file path for the reports (optional)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut SimConfig) -> anyhow::Result<()> {
        if let Some(policies) = &self.policies {
            config.policies = Policy::parse_list(policies)?;
        }
        if let Some(n) = self.node_num {
            config.node_num = n;
        }
        if let Some(gb) = self.store_size_gb {
            config.store_size = (gb * GB as f64) as u64;
        }
        if let Some(cap) = self.cont_cap {
            config.cont_cap = cap;
        }
        if let Some(rate) = self.req_rate {
            config.req_rate = rate;
        }
        if let Some(length) = self.sim_length {
            config.sim_length = length;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(policy) = self.evict_policy {
            config.evict_policy = policy;
        }
        config.evict_dep |= self.evict_dep;
        config.precached |= self.precached;
        if let Some(rank) = self.cached_rank {
            config.cached_rank = rank;
        }
        if self.lb_ratio.is_some() {
            config.lb_ratio = self.lb_ratio;
        }
        config.delay_sched |= self.delay_sched;
        if let Some(dir) = &self.result_dir {
            config.result_dir = Some(dir.clone());
        }
        if self.no_results {
            config.result_dir = None;
        }
        if self.run_tag.is_some() {
            config.run_tag = self.run_tag.clone();
        }
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "depsched_simulation_engine=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SimConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => SimConfig::default(),
    };
    args.apply(&mut config)?;
    config.validate().context("invalid configuration")?;

    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║  DepSched Simulation Engine                              ║");
    println!("╚══════════════════════════════════════════════════════════╝\n");

    println!("Configuration:");
    println!("  Nodes: {} x {} slots", config.node_num, config.cont_cap);
    println!("  Store: {:.1} GB per node", config.store_size as f64 / GB as f64);
    println!("  Arrivals: {} req/tick for {} ticks", config.req_rate, config.sim_length);
    println!(
        "  Eviction: {} (threshold {}, layer granularity {})",
        config.evict_policy, config.evict_th, config.evict_dep
    );
    println!(
        "  Policies: {}\n",
        config
            .policies
            .iter()
            .map(Policy::as_str)
            .collect::<Vec<_>>()
            .join(",")
    );

    let mut synth = SyntheticTraceConfig::default();
    if let Some(n) = args.synth_images {
        synth.num_images = n;
    }
    let mut trace = TraceSnapshot::load_or_generate(&args.trace, &synth)
        .with_context(|| format!("failed to load trace {}", args.trace.display()))?;
    let dropped = trace.retain_images_up_to(DEFAULT_MAX_IMAGE_SIZE);
    let stats = trace.summary();
    info!(
        "trace: {} images, {} layers, mean image {:.1} MB, {} oversized images dropped",
        stats.images,
        stats.layers,
        stats.mean_image_bytes as f64 / MB as f64,
        dropped
    );
    if stats.layers_without_pull_time > 0 {
        info!(
            "{} layers have no pull time, charged as {:?}",
            stats.layers_without_pull_time, config.missing_pull_time
        );
    }

    let workload = match &args.workload {
        Some(path) => Workload::load_or_generate(path, &config, &trace)
            .with_context(|| format!("failed to load workload {}", path.display()))?,
        None => Workload::generate(&config, &trace)?,
    };
    println!(
        "Workload: {} requests over {} ticks ({} images in trace)\n",
        workload.len(),
        workload.arrival_ticks(),
        trace.image_list().len()
    );

    let mut simulator = Simulator::new(config, &trace, workload)?;
    let reports = simulator.run_all()?;

    print_results(&reports);

    if let Some(output_path) = &args.output {
        println!("\nWriting results to {}...", output_path.display());
        let json = serde_json::to_string_pretty(&reports)?;
        fs::write(output_path, json)
            .with_context(|| format!("failed to write {}", output_path.display()))?;
        println!("  Results saved");
    }

    println!("\n✅ Simulation complete!\n");
    Ok(())
}

fn print_results(reports: &[PolicyReport]) {
    println!("\n╔══════════════════════════════════════════════════════════╗");
    println!("║  Simulation Results                                      ║");
    println!("╚══════════════════════════════════════════════════════════╝\n");

    println!(
        "{:<10} {:>12} {:>10} {:>10} {:>10} {:>10} {:>10} {:>8} {:>8}",
        "Policy", "Mean (ms)", "p50", "p95", "Accepted", "Cont rej", "Store rej", "Util", "Heat"
    );
    println!("{}", "-".repeat(96));

    for r in reports {
        println!(
            "{:<10} {:>12.0} {:>10} {:>10} {:>10} {:>10} {:>10} {:>8.3} {:>8.2}",
            r.policy.as_str(),
            r.mean_latency_ms,
            r.latency.p50,
            r.latency.p95,
            r.accepted,
            r.container_limit_rejections,
            r.store_limit_rejections,
            r.utilization,
            r.heating_p99,
        );
        if r.truncated {
            println!("  ⚠ truncated at {} ticks, {} requests unplaced", r.ticks, r.unplaced);
        }
    }

    if reports.len() > 1 {
        println!("\n{}", "-".repeat(96));
        println!("Mean startup latency vs {} baseline:", reports[0].policy);
        for r in reports.iter().skip(1) {
            match r.speedup {
                Some(ratio) => println!("  {:<10} {:>6.2}x", r.policy.as_str(), ratio),
                None => println!("  {:<10} {:>7}", r.policy.as_str(), "N/A"),
            }
        }
    }
}
