use std::collections::HashSet;

use fleet_emu::alloc::demand;
use fleet_emu::*;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

mod common;
use common::*;

#[test]
fn test_mode_forced_shared_when_cores_exceed_host() {
    setup_test();
    let mut alloc =
        CoreAllocator::new(HostSpec::new(8, HOST_SCORE), AllocatorConfig::default()).unwrap();
    assert_eq!(alloc.set_mode(20, 1.0), PlacementMode::Shared);
}

#[test]
fn test_mode_spread_below_threshold() {
    setup_test();
    let config = AllocatorConfig {
        spread_threshold: 0.5,
        ..Default::default()
    };
    let mut alloc = CoreAllocator::new(HostSpec::new(8, HOST_SCORE), config).unwrap();
    assert_eq!(alloc.set_mode(3, 2.5), PlacementMode::Spread);
    assert_eq!(alloc.set_mode(3, 4.0), PlacementMode::Shared);
}

/// Ten 4-core devices at 500 points on an 8-core host.
#[test]
fn test_dense_fleet_is_shared() {
    setup_test();
    let mut mgr = manager(8);
    register_uniform(&mut mgr, 10, &device(4, 500.0));
    assert_eq!(mgr.plan_allocations().unwrap(), PlacementMode::Shared);

    let configs = mgr.get_all_configs().unwrap();
    assert_eq!(configs.len(), 10);
    for cfg in configs {
        assert!((cfg.per_core_limit - 0.4634).abs() < 1e-4);
        assert!((cfg.effective - 1.8535).abs() < 1e-3);
        let quota = cfg.constraints.cpu_quota as f64;
        assert!((quota - 185_340.0).abs() < 100.0, "quota {quota}");
        assert_eq!(cfg.constraints.cpu_quota, 185_356);
        assert_eq!(cfg.cores.len(), 4);
        assert_eq!(cfg.env["OMP_NUM_THREADS"], "2");
    }

    // The first two nodes share cores 0-3, the next two share 4-7, and the
    // fifth is the first to oversubscribe.
    let cpus: Vec<&str> = configs
        .iter()
        .map(|c| c.constraints.cpuset_cpus.as_str())
        .collect();
    assert_eq!(&cpus[..4], &["0-3", "0-3", "4-7", "4-7"]);
    assert!(configs[..4].iter().all(|c| !c.oversubscribed));
    assert!(configs[4].oversubscribed);

    let summary = mgr.get_allocation_summary().unwrap();
    assert_eq!(summary.oversubscribed_cores, (0..8).collect::<Vec<_>>());
    assert!((summary.total_used - 10.0 * 4.0 * 500.0 / HOST_SCORE).abs() < 1e-9);
    assert_capacity_accounting(&summary);
}

#[test]
fn test_single_full_speed_node_is_spread() {
    setup_test();
    let mut mgr = manager(8);
    register_uniform(&mut mgr, 1, &device(4, HOST_SCORE));
    assert_eq!(mgr.plan_allocations().unwrap(), PlacementMode::Spread);

    let cfg = mgr.get_container_config("n1").unwrap();
    let distinct: HashSet<usize> = cfg.cores.iter().copied().collect();
    assert_eq!(distinct.len(), 4);
    assert_eq!(cfg.constraints.cpu_quota, 400_000);
    assert_eq!(cfg.constraints.nano_cpus, 4_000_000_000);
    assert_eq!(cfg.constraints.cpu_shares, 4096);
    assert!(!cfg.oversubscribed);
    assert_eq!(cfg.mode, PlacementMode::Spread);
}

#[test]
fn test_fast_device_overscales() {
    setup_test();
    let d = demand(4, 2.0 * HOST_SCORE, HOST_SCORE, true);
    assert_eq!(d.cores_to_assign, 8);
    assert_eq!(d.per_core_limit, 1.0);
    assert_eq!(d.effective, 8.0);

    let mut mgr = manager(16);
    register_uniform(&mut mgr, 1, &device(4, 2.0 * HOST_SCORE));
    mgr.plan_allocations().unwrap();
    let cfg = mgr.get_container_config("n1").unwrap();
    assert_eq!(cfg.cores, (0..8).collect::<Vec<_>>());
    assert_eq!(cfg.effective, 8.0);
    assert_eq!(cfg.constraints.cpu_quota, 800_000);
    assert_eq!(cfg.env["MKL_NUM_THREADS"], "8");
}

#[test]
fn test_overscaling_disabled_caps_limit() {
    setup_test();
    let config = ResourceConfig {
        allocator: AllocatorConfig {
            allow_overscaling: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut mgr = manager_with(16, config);
    register_uniform(&mut mgr, 1, &device(4, 2.0 * HOST_SCORE));
    mgr.plan_allocations().unwrap();
    let cfg = mgr.get_container_config("n1").unwrap();
    assert_eq!(cfg.cores.len(), 4);
    assert_eq!(cfg.effective, 4.0);
}

#[test]
fn test_oversized_device_takes_whole_host() {
    setup_test();
    let mut mgr = manager(4);
    register_uniform(&mut mgr, 1, &device(4, 2.0 * HOST_SCORE));
    assert_eq!(mgr.plan_allocations().unwrap(), PlacementMode::Shared);

    let cfg = mgr.get_container_config("n1").unwrap();
    assert_eq!(cfg.cores, vec![0, 1, 2, 3]);
    assert_eq!(cfg.effective, 4.0);
    assert!(cfg.diagnostics.iter().any(|d| matches!(
        d,
        Diagnostic::CoresTruncated {
            requested: 8,
            assigned: 4,
            ..
        }
    )));
    assert!(!cfg.oversubscribed);
}

/// Random fleets that fit the host never push a core past capacity, in
/// either mode.
#[test]
fn test_capacity_conservation() {
    setup_test();
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut spread_seen = 0;

    for _ in 0..300 {
        let host_cores = rng.gen_range(2..=16);
        let mut mgr = manager(host_cores);
        let mut needed = 0;
        let mut i = 0;
        loop {
            let cores = rng.gen_range(1..=4);
            let score = rng.gen_range(100.0..=2.0 * HOST_SCORE);
            let d = demand(cores, score, HOST_SCORE, true);
            if needed + d.cores_to_assign > host_cores {
                break;
            }
            needed += d.cores_to_assign;
            i += 1;
            let request = ContainerRequest::new(format!("n{i}")).explicit(device(cores, score));
            mgr.add_container(request).unwrap();
        }

        if mgr.plan_allocations().unwrap() == PlacementMode::Spread {
            spread_seen += 1;
        }
        let summary = mgr.get_allocation_summary().unwrap();
        assert!(summary.oversubscribed_cores.is_empty(), "{summary:#?}");
        assert!(summary.records.iter().all(|r| !r.oversubscribed));
        assert!(summary.cores.iter().all(|c| c.used <= 1.0 + 1e-9));
        assert_capacity_accounting(&summary);
    }
    assert!(spread_seen > 0);
}

#[test]
fn test_records_follow_registration_order() {
    setup_test();
    let mut mgr = manager(8);
    for name in ["zeta", "alpha", "mid"] {
        mgr.add_container(ContainerRequest::new(name).explicit(device(1, 500.0)))
            .unwrap();
    }
    mgr.plan_allocations().unwrap();
    let names: Vec<&str> = mgr
        .get_all_configs()
        .unwrap()
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(names, vec!["zeta", "alpha", "mid"]);

    let summary = mgr.get_allocation_summary().unwrap();
    let cores: Vec<Vec<usize>> = summary.records.iter().map(|r| r.cores.clone()).collect();
    assert_eq!(cores, vec![vec![0], vec![1], vec![2]]);
}

#[test]
fn test_summary_serializes() {
    setup_test();
    let mut mgr = manager(2);
    register_uniform(&mut mgr, 3, &device(1, HOST_SCORE));
    mgr.plan_allocations().unwrap();
    let summary = mgr.get_allocation_summary().unwrap();
    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["mode"], "shared");
    assert_eq!(json["host_cores"], 2);
    assert_eq!(json["records"].as_array().unwrap().len(), 3);
    assert_eq!(
        json["records"][2]["diagnostics"][0]["kind"],
        "oversubscribed"
    );
}
