//! End-to-end simulation scenarios

use depsched_simulation_engine::cluster::{EvictionMode, Node};
use depsched_simulation_engine::scheduler::{
    DepPolicy, Outcome, Scheduler, SchedulerTunables,
};
use depsched_simulation_engine::synth::SyntheticTraceConfig;
use depsched_simulation_engine::trace::{MissingPullTime, PullTime, TraceBuilder, TraceSnapshot};
use depsched_simulation_engine::types::{EvictPolicy, Policy, Request, GB, MB};
use depsched_simulation_engine::{SimConfig, Simulator, Workload};

fn request(id: u64, images: &[&str], duration: u64) -> Request {
    Request::new(id, images.iter().map(|s| s.to_string()).collect(), duration)
}

/// One heavy base layer shared by every image, plus a small top layer each
fn shared_base_trace(images: usize) -> TraceSnapshot {
    let mut builder =
        TraceBuilder::new().layer("sha256:base", 500 * MB, Some(PullTime::new(15_000, 5_000)));
    for i in 0..images {
        builder = builder.layer(format!("sha256:top-{i}"), MB, Some(PullTime::new(80, 20)));
    }
    for i in 0..images {
        builder = builder.image(
            format!("img-{i}"),
            100.0 / (i + 1) as f64,
            ["sha256:base".to_string(), format!("sha256:top-{i}")],
        );
    }
    builder.build().unwrap()
}

#[test]
fn test_scenario_single_placement() {
    let trace = TraceBuilder::new()
        .layer("l1", 100, Some(PullTime::new(1_000, 200)))
        .layer("l2", 200, Some(PullTime::new(1_500, 300)))
        .image("A", 1.0, ["l1", "l2"])
        .build()
        .unwrap();
    let mut nodes = vec![Node::new(1000, 10)];
    let mut scheduler = Scheduler::new(SchedulerTunables::default(), 0, 16);
    let req = request(0, &["A"], 5);

    let outcome = scheduler.schedule(&req, &nodes, &DepPolicy, &trace);
    assert_eq!(outcome, Outcome::Placed(0));

    let placement = nodes[0].place(0, &req, false, &trace, MissingPullTime::Zero);
    assert_eq!(nodes[0].used_bytes, 300);
    assert_eq!(placement.provisioning_ms, 3000);
    assert_eq!(placement.departure_tick, 3 + 5);
    assert_eq!(nodes[0].departures[&8], vec!["A".to_string()]);
}

#[test]
fn test_scenario_single_slot_requeue() {
    let trace = TraceBuilder::new()
        .layer("l1", 100, None)
        .image("a", 1.0, ["l1"])
        .build()
        .unwrap();
    let config = SimConfig {
        node_num: 1,
        cont_cap: 1,
        store_size: 1000,
        req_rate: 2.0,
        sim_length: 1,
        result_dir: None,
        policies: vec![Policy::Dep],
        ..SimConfig::small()
    };
    let workload = Workload {
        arrivals: vec![2],
        requests: vec![request(0, &["a"], 1), request(1, &["a"], 1)],
    };
    let mut sim = Simulator::new(config, &trace, workload).unwrap();
    let report = sim.run_policy(Policy::Dep).unwrap();

    let ticks: Vec<u64> = report.placements.iter().map(|p| p.tick).collect();
    assert_eq!(ticks, vec![0, 1]);
    assert_eq!(report.container_limit_rejections, 1);
    assert_eq!(report.store_limit_rejections, 0);
    assert_eq!(report.latencies_ms, vec![0, 1000]);
}

#[test]
fn test_scenario_eviction_cascade() {
    // no sharing: the image and its only layer both go
    let trace = TraceBuilder::new()
        .layer("L1", 950, None)
        .image("A", 1.0, ["L1"])
        .build()
        .unwrap();
    let mut node = Node::new(1000, 4);
    node.warm(0, &["A".to_string()], false, 1000, &trace);
    node.evict(1, EvictionMode::Image, 0.1, 0, &trace);
    assert!(node.images.is_empty());
    assert!(node.layers.is_empty());

    // L1 shared with a still-cached image survives
    let trace = TraceBuilder::new()
        .layer("L1", 300, None)
        .layer("L2", 400, None)
        .layer("L3", 100, None)
        .image("A", 1.0, ["L1", "L2"])
        .image("B", 1.0, ["L1", "L3"])
        .build()
        .unwrap();
    let mut node = Node::new(1000, 4);
    node.warm(0, &["B".to_string()], false, 1000, &trace);
    node.warm(1, &["A".to_string()], false, 1000, &trace);
    node.evict(2, EvictionMode::Image, 0.3, 0, &trace);
    assert!(!node.images.contains_key("A"));
    assert!(node.images.contains_key("B"));
    assert!(node.layers.contains_key("L1"));
    node.verify(&trace).unwrap();
}

#[test]
fn test_scenario_policy_ordering() {
    let trace = shared_base_trace(10);
    let config = SimConfig {
        node_num: 4,
        store_size: 100 * GB,
        cont_cap: 1000,
        req_rate: 2.0,
        sim_length: 100,
        cont_length: 10,
        evict: false,
        result_dir: None,
        policies: vec![Policy::Dep, Policy::Kube, Policy::Monkey],
        ..SimConfig::small()
    };
    let mut sim = Simulator::from_config(config, &trace).unwrap();
    let reports = sim.run_all().unwrap();

    let dep = &reports[0];
    let kube = &reports[1];
    let monkey = &reports[2];
    for report in &reports {
        assert_eq!(report.accepted, sim.workload().len());
        assert_eq!(report.container_limit_rejections + report.store_limit_rejections, 0);
    }
    assert!(dep.mean_latency_ms <= kube.mean_latency_ms);
    assert!(kube.mean_latency_ms <= monkey.mean_latency_ms);
    assert!(dep.mean_latency_ms < monkey.mean_latency_ms);
    assert!(monkey.speedup.unwrap() > 1.0);
}

#[test]
fn test_identical_runs_are_identical() {
    let trace = SyntheticTraceConfig {
        num_images: 80,
        num_base_layers: 10,
        ..Default::default()
    }
    .generate()
    .unwrap();
    let config = SimConfig {
        node_num: 5,
        store_size: 2 * GB,
        cont_cap: 6,
        req_rate: 4.0,
        sim_length: 40,
        max_num_image: 2,
        result_dir: None,
        policies: vec![Policy::Dep, Policy::DepSoft, Policy::Kube, Policy::Monkey],
        ..SimConfig::small()
    };

    let first = Simulator::from_config(config.clone(), &trace)
        .unwrap()
        .run_all()
        .unwrap();
    let second = Simulator::from_config(config, &trace)
        .unwrap()
        .run_all()
        .unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_invariants_hold_under_pressure() {
    let trace = SyntheticTraceConfig {
        num_images: 60,
        num_base_layers: 8,
        seed: 11,
        ..Default::default()
    }
    .generate()
    .unwrap();

    for (evict_policy, evict_dep, hot_duration) in [
        (EvictPolicy::DepLru, true, 0),
        (EvictPolicy::DepLfu, true, 3),
        (EvictPolicy::ImageLru, false, 2),
    ] {
        let config = SimConfig {
            node_num: 6,
            store_size: 2 * GB,
            cont_cap: 4,
            req_rate: 3.0,
            sim_length: 60,
            max_num_image: 3,
            precached: true,
            cached_rank: -1,
            pinned: false,
            evict: true,
            evict_th: 0.2,
            evict_policy,
            evict_dep,
            hot_duration,
            lb_ratio: Some(0.5),
            max_ticks: 600,
            check_invariants: true,
            result_dir: None,
            policies: vec![Policy::Dep, Policy::DepSoft, Policy::Kube, Policy::Monkey],
            ..SimConfig::small()
        };
        let mut sim = Simulator::from_config(config, &trace).unwrap();
        let total = sim.workload().len();
        let reports = sim.run_all().unwrap();
        for report in reports {
            assert_eq!(report.accepted + report.unplaced, total);
            assert!(report.utilization >= 0.0);
        }
    }
}

#[test]
fn test_result_files_written_for_every_policy() {
    let dir = tempfile::tempdir().unwrap();
    let trace = shared_base_trace(4);
    let config = SimConfig {
        node_num: 2,
        store_size: 10 * GB,
        cont_cap: 8,
        req_rate: 1.0,
        sim_length: 10,
        result_dir: Some(dir.path().to_path_buf()),
        run_tag: Some("it".to_string()),
        policies: vec![Policy::Dep, Policy::Monkey],
        ..SimConfig::small()
    };
    Simulator::from_config(config, &trace)
        .unwrap()
        .run_all()
        .unwrap();

    for policy in ["dep", "monkey"] {
        for stem in ["out_lat_percentiles", "out_lat", "out_meta"] {
            assert!(dir.path().join(format!("{stem}_{policy}_it.csv")).exists());
        }
    }
    assert!(dir.path().join("summary_it.json").exists());
}
