// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Container registration and single-shot planning on top of
//! [`CoreAllocator`].

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;

use crate::alloc::AllocationSummary;
use crate::alloc::AllocatorConfig;
use crate::alloc::CoreAllocator;
use crate::alloc::Diagnostic;
use crate::alloc::PlacementMode;
use crate::alloc::RuntimeConstraints;
use crate::catalog::DeviceCatalog;
use crate::catalog::DeviceSpec;
use crate::error::FleetError;
use crate::error::Result;
use crate::host::HostSpec;
use crate::sampler::perturb_device;
use crate::sampler::Perturbation;

pub const DEFAULT_CORES_PER_CONTAINER: u32 = 1;
pub const DEFAULT_RAM_GIB: f64 = 2.0;

/// Fields of a perturbed archetype that are never randomized.
const LOCKED_DEVICE_FIELDS: [&str; 1] = ["cores"];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub perturbation: Perturbation,
    pub default_cores: u32,
    pub default_ram_gib: f64,
    pub allocator: AllocatorConfig,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            perturbation: Perturbation::default(),
            default_cores: DEFAULT_CORES_PER_CONTAINER,
            default_ram_gib: DEFAULT_RAM_GIB,
            allocator: AllocatorConfig::default(),
        }
    }
}

/// Where a container's device spec came from.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum DeviceSource {
    Explicit,
    Archetype(String),
    Default,
}

/// A container to register, built up with the chained setters.
#[derive(Clone, Debug, Default)]
pub struct ContainerRequest {
    name: String,
    explicit: Option<DeviceSpec>,
    archetype: Option<String>,
    index: Option<usize>,
}

impl ContainerRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Use `spec` as is. Takes priority over an archetype.
    pub fn explicit(mut self, spec: DeviceSpec) -> Self {
        self.explicit = Some(spec);
        self
    }

    /// Perturb the named catalog archetype.
    pub fn archetype(mut self, name: impl Into<String>) -> Self {
        self.archetype = Some(name.into());
        self
    }

    /// Seed for the perturbation. Defaults to the registration position.
    pub fn index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A registered container with its resolved device spec.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResourceRequest {
    pub name: String,
    pub index: usize,
    pub device: DeviceSpec,
    pub source: DeviceSource,
}

/// Everything the provisioning layer needs to start one container.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContainerConfig {
    pub name: String,
    pub index: usize,
    pub device: DeviceSpec,
    pub source: DeviceSource,
    pub cores: Vec<usize>,
    pub per_core_limit: f64,
    pub effective: f64,
    pub constraints: RuntimeConstraints,
    pub env: BTreeMap<String, String>,
    pub mode: PlacementMode,
    pub oversubscribed: bool,
    pub diagnostics: Vec<Diagnostic>,
}

pub struct ContainerResourceManager {
    host: HostSpec,
    config: ResourceConfig,
    devices: Option<DeviceCatalog>,
    allocator: CoreAllocator,
    requests: Vec<ResourceRequest>,
    configs: Vec<ContainerConfig>,
    by_name: HashMap<String, usize>,
    planned: bool,
}

impl ContainerResourceManager {
    pub fn new(
        host: HostSpec,
        config: ResourceConfig,
        devices: Option<DeviceCatalog>,
    ) -> Result<Self> {
        if config.default_cores == 0 {
            return Err(FleetError::InvalidParameter(
                "default cores per container must be at least 1".into(),
            ));
        }
        let allocator = CoreAllocator::new(host.clone(), config.allocator.clone())?;
        Ok(Self {
            host,
            config,
            devices,
            allocator,
            requests: vec![],
            configs: vec![],
            by_name: HashMap::new(),
            planned: false,
        })
    }

    pub fn host(&self) -> &HostSpec {
        &self.host
    }

    pub fn is_planned(&self) -> bool {
        self.planned
    }

    /// Registered containers in registration order.
    pub fn requests(&self) -> &[ResourceRequest] {
        &self.requests
    }

    fn default_device(&self) -> DeviceSpec {
        DeviceSpec {
            cores: self.config.default_cores,
            ram_gib: self.config.default_ram_gib,
            freq_mhz: self.host.max_freq_mhz.unwrap_or_default(),
            single_core_score: self.host.score,
        }
    }

    pub fn add_container(&mut self, request: ContainerRequest) -> Result<&ResourceRequest> {
        let name = request.name;
        if self.planned {
            return Err(FleetError::InvalidState(format!(
                "cannot add '{name}' after planning"
            )));
        }
        if self.by_name.contains_key(&name) {
            return Err(FleetError::InvalidState(format!(
                "container '{name}' is already registered"
            )));
        }

        let index = request.index.unwrap_or(self.requests.len());
        let (device, source) = match (request.explicit, request.archetype) {
            (Some(spec), _) => (spec, DeviceSource::Explicit),
            (None, Some(archetype)) => {
                let catalog = self.devices.as_ref().ok_or_else(|| {
                    FleetError::NotFound(format!(
                        "device '{archetype}' requested but no device catalog is configured"
                    ))
                })?;
                let spec = perturb_device(
                    catalog,
                    &archetype,
                    index,
                    &self.config.perturbation,
                    &LOCKED_DEVICE_FIELDS,
                )?;
                (spec, DeviceSource::Archetype(archetype))
            }
            (None, None) => (self.default_device(), DeviceSource::Default),
        };

        let score = device.single_core_score;
        if device.cores == 0 || !score.is_finite() || score <= 0.0 {
            return Err(FleetError::InvalidParameter(format!(
                "container '{name}' needs at least one core and a positive score"
            )));
        }

        debug!("registered {} ({:?}): {:?}", name, source, device);
        self.by_name.insert(name.clone(), self.requests.len());
        self.requests.push(ResourceRequest {
            name,
            index,
            device,
            source,
        });
        Ok(&self.requests[self.requests.len() - 1])
    }

    /// Flag fleet-wide mismatches between the devices and the host.
    fn check_host_fit(&mut self) {
        if let Some(host_bytes) = self.host.memory_bytes {
            let requested_bytes = self
                .requests
                .iter()
                .fold(0u64, |acc, r| acc.saturating_add(r.device.ram_bytes()));
            if requested_bytes > host_bytes {
                self.allocator.add_diagnostic(Diagnostic::MemoryOvercommitted {
                    requested_bytes,
                    host_bytes,
                });
            }
        }

        if let Some(host_max_mhz) = self.host.max_freq_mhz {
            for req in &self.requests {
                if req.device.freq_mhz > host_max_mhz {
                    self.allocator.add_diagnostic(Diagnostic::FrequencyAboveHost {
                        node: req.name.clone(),
                        freq_mhz: req.device.freq_mhz,
                        host_max_mhz,
                    });
                }
            }
        }
    }

    /// Choose the placement mode and allocate every registered container in
    /// registration order.
    ///
    /// On error the allocator is left empty and planning can be retried.
    pub fn plan_allocations(&mut self) -> Result<PlacementMode> {
        if self.planned {
            return Err(FleetError::InvalidState(
                "allocations are already planned, reset first".into(),
            ));
        }

        match self.allocate_all() {
            Ok(mode) => Ok(mode),
            Err(e) => {
                self.allocator.reset();
                self.configs.clear();
                Err(e)
            }
        }
    }

    fn allocate_all(&mut self) -> Result<PlacementMode> {
        let (total_cores, total_effective) =
            self.requests.iter().fold((0usize, 0.0f64), |(n, e), req| {
                let d = self
                    .allocator
                    .demand(req.device.cores, req.device.single_core_score);
                (n.saturating_add(d.cores_to_assign), e + d.effective)
            });
        let mode = self.allocator.set_mode(total_cores, total_effective);
        self.check_host_fit();

        let mut configs = Vec::with_capacity(self.requests.len());
        for req in &self.requests {
            let dev = &req.device;
            let rec = self.allocator.allocate(
                &req.name,
                dev.cores,
                dev.single_core_score,
                dev.ram_bytes(),
            )?;
            configs.push(ContainerConfig {
                name: req.name.clone(),
                index: req.index,
                device: dev.clone(),
                source: req.source.clone(),
                cores: rec.cores.clone(),
                per_core_limit: rec.per_core_limit,
                effective: rec.effective,
                constraints: rec.constraints.clone(),
                env: rec.env.clone(),
                mode: rec.mode,
                oversubscribed: rec.oversubscribed,
                diagnostics: rec.diagnostics.clone(),
            });
        }
        self.configs = configs;
        self.planned = true;

        let summary = self.allocator.summary();
        info!(
            "planned {} containers in {} mode on {}/{} cores ({} oversubscribed)",
            self.configs.len(),
            mode,
            summary.active_cores,
            summary.host_cores,
            summary.oversubscribed_cores.len()
        );
        Ok(mode)
    }

    fn ensure_planned(&self) -> Result<()> {
        if !self.planned {
            return Err(FleetError::InvalidState(
                "allocations have not been planned".into(),
            ));
        }
        Ok(())
    }

    pub fn get_container_config(&self, name: &str) -> Result<&ContainerConfig> {
        self.ensure_planned()?;
        self.by_name
            .get(name)
            .map(|&i| &self.configs[i])
            .ok_or_else(|| FleetError::NotFound(format!("container '{name}'")))
    }

    pub fn get_all_configs(&self) -> Result<&[ContainerConfig]> {
        self.ensure_planned()?;
        Ok(&self.configs)
    }

    pub fn get_allocation_summary(&self) -> Result<AllocationSummary> {
        self.ensure_planned()?;
        Ok(self.allocator.summary())
    }

    pub fn reset(&mut self) {
        self.requests.clear();
        self.configs.clear();
        self.by_name.clear();
        self.allocator.reset();
        self.planned = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> DeviceCatalog {
        let mut catalog = DeviceCatalog::default();
        catalog.insert(
            "rpi4",
            DeviceSpec {
                cores: 4,
                ram_gib: 4.0,
                freq_mhz: 1500.0,
                single_core_score: 187.0,
            },
        );
        catalog
    }

    fn manager(cores: usize) -> ContainerResourceManager {
        ContainerResourceManager::new(
            HostSpec::new(cores, 1079.0),
            ResourceConfig::default(),
            Some(catalog()),
        )
        .unwrap()
    }

    #[test]
    fn test_spec_priority() {
        let mut mgr = manager(8);
        let explicit = DeviceSpec {
            cores: 2,
            ram_gib: 1.0,
            freq_mhz: 1000.0,
            single_core_score: 300.0,
        };
        let src = mgr
            .add_container(
                ContainerRequest::new("a")
                    .explicit(explicit.clone())
                    .archetype("rpi4"),
            )
            .unwrap()
            .source
            .clone();
        assert_eq!(src, DeviceSource::Explicit);

        let b = mgr
            .add_container(ContainerRequest::new("b").archetype("rpi4"))
            .unwrap();
        assert_eq!(b.source, DeviceSource::Archetype("rpi4".into()));
        assert_eq!(b.device.cores, 4);
        assert_eq!(b.index, 1);

        let c = mgr.add_container(ContainerRequest::new("c")).unwrap();
        assert_eq!(c.source, DeviceSource::Default);
        assert_eq!(c.device.cores, 1);
        assert_eq!(c.device.ram_gib, 2.0);
        assert_eq!(c.device.single_core_score, 1079.0);
    }

    #[test]
    fn test_explicit_index_seeds_perturbation() {
        let mut a = manager(8);
        let mut b = manager(8);
        let x = a
            .add_container(ContainerRequest::new("x").archetype("rpi4").index(7))
            .unwrap()
            .device
            .clone();
        b.add_container(ContainerRequest::new("pad")).unwrap();
        let y = b
            .add_container(ContainerRequest::new("y").archetype("rpi4").index(7))
            .unwrap()
            .device
            .clone();
        assert_eq!(x, y);
    }

    #[test]
    fn test_registration_errors() {
        let mut mgr = manager(4);
        mgr.add_container(ContainerRequest::new("a")).unwrap();
        assert!(mgr
            .add_container(ContainerRequest::new("a"))
            .unwrap_err()
            .is_invalid_state());
        assert!(mgr
            .add_container(ContainerRequest::new("b").archetype("pdp11"))
            .unwrap_err()
            .is_not_found());

        let mut bare =
            ContainerResourceManager::new(HostSpec::new(4, 1079.0), ResourceConfig::default(), None)
                .unwrap();
        assert!(bare
            .add_container(ContainerRequest::new("b").archetype("rpi4"))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_lifecycle() {
        let mut mgr = manager(4);
        mgr.add_container(ContainerRequest::new("a")).unwrap();
        assert!(mgr.get_all_configs().unwrap_err().is_invalid_state());
        assert!(mgr.get_container_config("a").unwrap_err().is_invalid_state());
        assert!(mgr.get_allocation_summary().unwrap_err().is_invalid_state());

        mgr.plan_allocations().unwrap();
        assert!(mgr.plan_allocations().unwrap_err().is_invalid_state());
        assert!(mgr
            .add_container(ContainerRequest::new("b"))
            .unwrap_err()
            .is_invalid_state());
        assert!(mgr.get_container_config("zz").unwrap_err().is_not_found());
        assert_eq!(mgr.get_all_configs().unwrap().len(), 1);

        mgr.reset();
        assert!(!mgr.is_planned());
        assert!(mgr.requests().is_empty());
        mgr.add_container(ContainerRequest::new("b")).unwrap();
        mgr.plan_allocations().unwrap();
        assert_eq!(mgr.get_container_config("b").unwrap().cores, vec![0]);
    }

    fn explicit(score: f64) -> DeviceSpec {
        DeviceSpec {
            cores: 2,
            ram_gib: 1.0,
            freq_mhz: 1000.0,
            single_core_score: score,
        }
    }

    #[test]
    fn test_non_finite_score_is_rejected() {
        let mut mgr = manager(4);
        for score in [f64::INFINITY, f64::NAN, -1.0] {
            assert!(mgr
                .add_container(ContainerRequest::new("x").explicit(explicit(score)))
                .unwrap_err()
                .is_invalid_parameter());
        }
        assert!(mgr.requests().is_empty());
    }

    #[test]
    fn test_huge_scores_saturate_demand() {
        let mut mgr = manager(4);
        mgr.add_container(ContainerRequest::new("a").explicit(explicit(1e25)))
            .unwrap();
        mgr.add_container(ContainerRequest::new("b").explicit(explicit(1e25)))
            .unwrap();

        assert_eq!(mgr.plan_allocations().unwrap(), PlacementMode::Shared);
        for name in ["a", "b"] {
            let cfg = mgr.get_container_config(name).unwrap();
            assert_eq!(cfg.cores, vec![0, 1, 2, 3]);
            assert_eq!(cfg.effective, 4.0);
            assert!(cfg
                .diagnostics
                .iter()
                .any(|d| matches!(d, Diagnostic::CoresTruncated { assigned: 4, .. })));
        }
    }

    #[test]
    fn test_failed_plan_can_be_retried() {
        let mut mgr = manager(4);
        mgr.add_container(ContainerRequest::new("a").explicit(explicit(500.0)))
            .unwrap();
        mgr.add_container(ContainerRequest::new("b").explicit(explicit(500.0)))
            .unwrap();
        mgr.requests[1].device.single_core_score = f64::INFINITY;

        assert!(mgr.plan_allocations().unwrap_err().is_invalid_parameter());
        assert!(!mgr.is_planned());
        assert!(mgr.allocator.records().is_empty());
        assert_eq!(mgr.allocator.mode(), None);

        mgr.requests[1].device.single_core_score = 500.0;
        mgr.plan_allocations().unwrap();
        assert_eq!(mgr.get_all_configs().unwrap().len(), 2);
        assert_eq!(mgr.get_allocation_summary().unwrap().records.len(), 2);
    }

    #[test]
    fn test_host_fit_diagnostics() {
        let host = HostSpec::new(8, 1079.0)
            .with_memory_bytes(4 << 30)
            .with_max_freq_mhz(1200.0);
        let mut mgr =
            ContainerResourceManager::new(host, ResourceConfig::default(), Some(catalog()))
                .unwrap();
        for name in ["a", "b", "c"] {
            mgr.add_container(ContainerRequest::new(name).explicit(DeviceSpec {
                cores: 1,
                ram_gib: 2.0,
                freq_mhz: 1500.0,
                single_core_score: 500.0,
            }))
            .unwrap();
        }
        mgr.plan_allocations().unwrap();
        let diags = mgr.get_allocation_summary().unwrap().diagnostics;
        assert!(diags.iter().any(|d| matches!(
            d,
            Diagnostic::MemoryOvercommitted { requested_bytes, .. } if *requested_bytes == 6 << 30
        )));
        assert_eq!(
            diags
                .iter()
                .filter(|d| matches!(d, Diagnostic::FrequencyAboveHost { .. }))
                .count(),
            3
        );
    }
}
