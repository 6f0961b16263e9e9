// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde_json::Value;

use crate::alloc::AllocatorConfig;
use crate::alloc::DEFAULT_CPU_PERIOD;
use crate::alloc::DEFAULT_SPREAD_THRESHOLD;
use crate::catalog::DEVICE_CATALOG_FILE;
use crate::catalog::NETWORK_CATALOG_FILE;
use crate::error::FleetError;
use crate::error::Result;
use crate::host::DEFAULT_HOST_SCORE;
use crate::manager::ResourceConfig;
use crate::manager::DEFAULT_CORES_PER_CONTAINER;
use crate::manager::DEFAULT_RAM_GIB;
use crate::sampler::normalize;
use crate::sampler::Perturbation;
use crate::sampler::ProfileSelector;

/// Experiment documents may nest their settings under this key.
const SECTION_KEY: &str = "containernet";

/// Distinguish an explicit `null` from an absent key.
fn explicit_null<'de, D, T>(d: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(d).map(Some)
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkOverride {
    pub delay_ms: Option<f64>,
    pub bandwidth_mbps: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub loss_percent: Option<f64>,
}

impl LinkOverride {
    pub fn is_empty(&self) -> bool {
        self.delay_ms.is_none()
            && self.bandwidth_mbps.is_none()
            && self.jitter_ms.is_none()
            && self.loss_percent.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintOverride {
    pub cpu_period: Option<u64>,
    pub cpu_quota: Option<u64>,
    pub cpuset_cpus: Option<String>,
    pub memory_mb: Option<u64>,
}

/// Settings for one container that take priority over the fleet-wide ones.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeOverride {
    pub id: Option<usize>,
    /// `Some(None)` pins the node to no device profile.
    #[serde(deserialize_with = "explicit_null")]
    pub device_type: Option<Option<String>>,
    #[serde(deserialize_with = "explicit_null")]
    pub network_type: Option<Option<String>>,
    pub link: LinkOverride,
    pub constraints: ConstraintOverride,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Total containers. Falls back to `clients + 1`.
    pub num_containers: Option<usize>,
    pub clients: usize,
    pub host_single_core_score: f64,
    pub device_variance: f64,
    pub device_correlation: f64,
    pub cpu_spread_threshold: f64,
    pub cpu_period: u64,
    pub default_cores_per_container: u32,
    pub default_ram_gib: f64,
    pub allow_overscaling: bool,
    pub device_type: Option<ProfileSelector>,
    pub network_type: Option<ProfileSelector>,
    pub network_correlation: Option<f64>,
    pub default_delay_ms: f64,
    /// 0 leaves bandwidth unshaped.
    pub default_bandwidth_mbps: f64,
    pub default_jitter_ms: f64,
    pub device_catalog: PathBuf,
    pub network_catalog: PathBuf,
    pub nodes: Vec<NodeOverride>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            num_containers: None,
            clients: 1,
            host_single_core_score: DEFAULT_HOST_SCORE,
            device_variance: 0.2,
            device_correlation: 0.5,
            cpu_spread_threshold: DEFAULT_SPREAD_THRESHOLD,
            cpu_period: DEFAULT_CPU_PERIOD,
            default_cores_per_container: DEFAULT_CORES_PER_CONTAINER,
            default_ram_gib: DEFAULT_RAM_GIB,
            allow_overscaling: true,
            device_type: None,
            network_type: None,
            network_correlation: None,
            default_delay_ms: 0.0,
            default_bandwidth_mbps: 0.0,
            default_jitter_ms: 0.0,
            device_catalog: PathBuf::from(DEVICE_CATALOG_FILE),
            network_catalog: PathBuf::from(NETWORK_CATALOG_FILE),
            nodes: vec![],
        }
    }
}

impl ExperimentConfig {
    /// Read an experiment document. Validation happens at planning time.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                FleetError::NotFound(format!("config '{}'", path.display()))
            } else {
                FleetError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        let doc: Value = serde_json::from_str(&content).map_err(|source| FleetError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_value(doc).map_err(|source| FleetError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse settings from a document, unwrapping the optional
    /// `containernet` section.
    pub fn from_value(mut doc: Value) -> std::result::Result<Self, serde_json::Error> {
        if let Some(section) = doc.get_mut(SECTION_KEY).map(Value::take) {
            doc = section;
        }
        serde_json::from_value(doc)
    }

    pub fn container_count(&self) -> usize {
        self.num_containers.unwrap_or(self.clients + 1)
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(FleetError::InvalidParameter(msg));

        if self.container_count() == 0 {
            return bad("experiment needs at least one container".into());
        }
        if !(self.host_single_core_score > 0.0) || !self.host_single_core_score.is_finite() {
            return bad(format!(
                "host_single_core_score must be positive, got {}",
                self.host_single_core_score
            ));
        }
        if !(self.cpu_spread_threshold > 0.0 && self.cpu_spread_threshold <= 1.0) {
            return bad(format!(
                "cpu_spread_threshold must be within (0, 1], got {}",
                self.cpu_spread_threshold
            ));
        }
        if !(self.device_variance >= 0.0) {
            return bad(format!(
                "device_variance must not be negative, got {}",
                self.device_variance
            ));
        }
        for (name, rho) in [
            ("device_correlation", Some(self.device_correlation)),
            ("network_correlation", self.network_correlation),
        ] {
            if let Some(rho) = rho {
                if !(-1.0..=1.0).contains(&rho) {
                    return bad(format!("{name} must be within [-1, 1], got {rho}"));
                }
            }
        }
        if self.default_cores_per_container == 0 {
            return bad("default_cores_per_container must be at least 1".into());
        }
        Ok(())
    }

    /// Override for container `id`. Later entries win.
    pub fn node_override(&self, id: usize) -> Option<&NodeOverride> {
        self.nodes.iter().rev().find(|n| n.id == Some(id))
    }

    pub fn device_type_for(&self, id: usize) -> Option<&str> {
        if let Some(pinned) = self.node_override(id).and_then(|n| n.device_type.as_ref()) {
            return normalize(pinned.as_deref());
        }
        self.device_type.as_ref()?.for_container(id)
    }

    pub fn network_type_for(&self, id: usize) -> Option<&str> {
        if let Some(pinned) = self.node_override(id).and_then(|n| n.network_type.as_ref()) {
            return normalize(pinned.as_deref());
        }
        self.network_type.as_ref()?.for_container(id)
    }

    pub fn resource_config(&self) -> ResourceConfig {
        ResourceConfig {
            perturbation: Perturbation {
                variation: self.device_variance,
                correlation: self.device_correlation,
            },
            default_cores: self.default_cores_per_container,
            default_ram_gib: self.default_ram_gib,
            allocator: AllocatorConfig {
                spread_threshold: self.cpu_spread_threshold,
                allow_overscaling: self.allow_overscaling,
                cpu_period: self.cpu_period,
            },
        }
    }
}
