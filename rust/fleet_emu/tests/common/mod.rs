#![allow(dead_code)]

use fleet_emu::*;

pub const HOST_SCORE: f64 = 1079.0;

/// Initialize tracing from `RUST_LOG`.
///
/// `try_init()` is idempotent: the first call in the process installs the
/// subscriber, later calls are ignored.
pub fn setup_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn device(cores: u32, score: f64) -> DeviceSpec {
    DeviceSpec {
        cores,
        ram_gib: 1.0,
        freq_mhz: 1500.0,
        single_core_score: score,
    }
}

pub fn manager(host_cores: usize) -> ContainerResourceManager {
    manager_with(host_cores, ResourceConfig::default())
}

pub fn manager_with(host_cores: usize, config: ResourceConfig) -> ContainerResourceManager {
    let repo = ProfileRepository::default();
    let devices = repo
        .device_catalog(fleet_emu::catalog::DEVICE_CATALOG_FILE)
        .unwrap();
    ContainerResourceManager::new(HostSpec::new(host_cores, HOST_SCORE), config, Some(devices))
        .unwrap()
}

/// Register `count` identical explicit devices named `n1..=count`.
pub fn register_uniform(mgr: &mut ContainerResourceManager, count: usize, spec: &DeviceSpec) {
    for i in 1..=count {
        mgr.add_container(ContainerRequest::new(format!("n{i}")).explicit(spec.clone()))
            .unwrap();
    }
}

/// Every core's used capacity equals the sum of the limits of its nodes.
pub fn assert_capacity_accounting(summary: &AllocationSummary) {
    for core in &summary.cores {
        let expected: f64 = core
            .assigned
            .iter()
            .map(|name| {
                summary
                    .records
                    .iter()
                    .find(|r| &r.name == name)
                    .unwrap()
                    .per_core_limit
            })
            .sum();
        assert!(
            (core.used - expected).abs() < 1e-9,
            "core {}: used {} != assigned limits {}",
            core.id,
            core.used,
            expected
        );
    }
}
