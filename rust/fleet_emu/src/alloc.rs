// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Core allocator
//!
//! Packs per-node CPU demand onto the host's physical cores. Each core has a
//! capacity of 1.0; a node asks for `cores_to_assign` cores at
//! `per_core_limit` each.
//!
//! The placement mode is chosen once per planning pass:
//!
//!```text
//!     Spread   every node gets the least loaded cores, so nodes stay
//!              isolated from each other as long as the fleet fits.
//!     Shared   nodes are packed onto the fullest cores that still have
//!              room, and only spill onto emptier cores (or oversubscribe)
//!              when nothing else fits.
//!```
//!
//! Ties between equally loaded cores always go to the lowest core id.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;

use crate::error::FleetError;
use crate::error::Result;
use crate::host::format_cpulist;
use crate::host::HostSpec;

pub const DEFAULT_CPU_PERIOD: u64 = 100_000;
pub const DEFAULT_SPREAD_THRESHOLD: f64 = 0.8;
pub const CORE_CAPACITY: f64 = 1.0;

/// Capacities closer than this are considered equal.
const CAPACITY_EPSILON: f64 = 1e-9;

/// Environment variables that size the thread pools of common numeric
/// runtimes.
pub const THREAD_HINT_VARS: [&str; 5] = [
    "OMP_NUM_THREADS",
    "MKL_NUM_THREADS",
    "OPENBLAS_NUM_THREADS",
    "NUMEXPR_NUM_THREADS",
    "VECLIB_MAXIMUM_THREADS",
];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Spread is chosen only while the fleet's effective demand stays below
    /// this fraction of the host's cores.
    pub spread_threshold: f64,
    /// Let devices faster than a host core claim extra cores.
    pub allow_overscaling: bool,
    /// CFS period in microseconds.
    pub cpu_period: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            spread_threshold: DEFAULT_SPREAD_THRESHOLD,
            allow_overscaling: true,
            cpu_period: DEFAULT_CPU_PERIOD,
        }
    }
}

impl AllocatorConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.spread_threshold > 0.0 && self.spread_threshold <= 1.0) {
            return Err(FleetError::InvalidParameter(format!(
                "spread threshold must be within (0, 1], got {}",
                self.spread_threshold
            )));
        }
        if self.cpu_period == 0 {
            return Err(FleetError::InvalidParameter(
                "cpu period must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementMode {
    Spread,
    Shared,
}

impl fmt::Display for PlacementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlacementMode::Spread => write!(f, "spread"),
            PlacementMode::Shared => write!(f, "shared"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CoreState {
    pub id: usize,
    pub capacity: f64,
    /// Sum of the per-core limits of every node in `assigned`.
    pub used: f64,
    pub assigned: Vec<String>,
}

impl CoreState {
    fn new(id: usize) -> Self {
        Self {
            id,
            capacity: CORE_CAPACITY,
            used: 0.0,
            assigned: vec![],
        }
    }

    pub fn available(&self) -> f64 {
        self.capacity - self.used
    }

    pub fn is_oversubscribed(&self) -> bool {
        self.used > self.capacity + CAPACITY_EPSILON
    }
}

/// Per-node CPU demand derived from the device score relative to the host.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Demand {
    pub perf_ratio: f64,
    pub cores_to_assign: usize,
    pub per_core_limit: f64,
    pub effective: f64,
}

/// A device with `cores` cores of `score` each, on a host whose cores score
/// `host_score`.
///
/// Slower devices keep their core count and get a fractional share of each
/// core. Faster devices either saturate their cores, or with overscaling
/// claim `ceil(cores * ratio)` full cores.
pub fn demand(cores: u32, score: f64, host_score: f64, allow_overscaling: bool) -> Demand {
    let cores = cores as f64;
    let raw = score / host_score;

    if allow_overscaling && raw > 1.0 {
        let effective = cores * raw;
        Demand {
            perf_ratio: raw,
            cores_to_assign: (effective - CAPACITY_EPSILON).ceil() as usize,
            per_core_limit: 1.0,
            effective,
        }
    } else {
        let ratio = raw.min(1.0);
        Demand {
            perf_ratio: raw,
            cores_to_assign: cores as usize,
            per_core_limit: ratio,
            effective: cores * ratio,
        }
    }
}

/// Container runtime parameters for one node.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RuntimeConstraints {
    pub cpu_period: u64,
    pub cpu_quota: u64,
    pub cpu_shares: u64,
    pub nano_cpus: u64,
    pub cpuset: Vec<usize>,
    pub cpuset_cpus: String,
    pub memory_bytes: u64,
}

impl RuntimeConstraints {
    fn new(period: u64, effective: f64, cores: &[usize], memory_bytes: u64) -> Self {
        let mut cpuset = cores.to_vec();
        cpuset.sort_unstable();
        cpuset.dedup();

        Self {
            cpu_period: period,
            cpu_quota: (period as f64 * effective) as u64,
            cpu_shares: (effective * 1024.0) as u64,
            nano_cpus: (effective * 1e9) as u64,
            cpuset_cpus: format_cpulist(&cpuset),
            cpuset,
            memory_bytes,
        }
    }
}

/// Non-fatal findings recorded while planning.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// Cores pushed above capacity by this node.
    Oversubscribed { node: String, cores: Vec<usize> },
    /// The node wanted more cores than the host has and got all of them.
    CoresTruncated {
        node: String,
        requested: usize,
        assigned: usize,
    },
    /// The fleet's RAM exceeds the host's.
    MemoryOvercommitted { requested_bytes: u64, host_bytes: u64 },
    /// A device is clocked above the host's maximum frequency.
    FrequencyAboveHost {
        node: String,
        freq_mhz: f64,
        host_max_mhz: f64,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::Oversubscribed { node, cores } => write!(
                f,
                "{node}: cores {} oversubscribed",
                format_cpulist(cores)
            ),
            Diagnostic::CoresTruncated {
                node,
                requested,
                assigned,
            } => write!(
                f,
                "{node}: requested {requested} cores, host has {assigned}"
            ),
            Diagnostic::MemoryOvercommitted {
                requested_bytes,
                host_bytes,
            } => write!(
                f,
                "fleet requests {requested_bytes} bytes of memory, host has {host_bytes}"
            ),
            Diagnostic::FrequencyAboveHost {
                node,
                freq_mhz,
                host_max_mhz,
            } => write!(
                f,
                "{node}: {freq_mhz:.0} MHz exceeds host maximum {host_max_mhz:.0} MHz"
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AllocationRecord {
    pub name: String,
    /// Assigned core ids in selection order.
    pub cores: Vec<usize>,
    pub per_core_limit: f64,
    pub effective: f64,
    pub perf_ratio: f64,
    pub constraints: RuntimeConstraints,
    pub env: BTreeMap<String, String>,
    pub mode: PlacementMode,
    pub oversubscribed: bool,
    pub diagnostics: Vec<Diagnostic>,
}

impl AllocationRecord {
    /// `max(1, ceil(effective))`, the suggested worker thread count.
    pub fn thread_hint(&self) -> u64 {
        thread_hint(self.effective)
    }
}

fn thread_hint(effective: f64) -> u64 {
    (effective.ceil() as u64).max(1)
}

#[derive(Clone, Debug, Serialize)]
pub struct AllocationSummary {
    pub host_cores: usize,
    pub host_score: f64,
    pub mode: Option<PlacementMode>,
    pub active_cores: usize,
    pub total_used: f64,
    pub cores: Vec<CoreState>,
    pub records: Vec<AllocationRecord>,
    pub oversubscribed_cores: Vec<usize>,
    /// Fleet-wide findings. Per-node ones stay on their record.
    pub diagnostics: Vec<Diagnostic>,
}

/// Bin-packs node demand onto host cores.
#[derive(Debug)]
pub struct CoreAllocator {
    host: HostSpec,
    config: AllocatorConfig,
    mode: Option<PlacementMode>,
    cores: Vec<CoreState>,
    records: Vec<AllocationRecord>,
    by_name: HashMap<String, usize>,
    diagnostics: Vec<Diagnostic>,
}

/// Total-order key for a capacity value, equal within [`CAPACITY_EPSILON`].
fn capacity_key(v: f64) -> i64 {
    (v / CAPACITY_EPSILON).round() as i64
}

impl CoreAllocator {
    pub fn new(host: HostSpec, config: AllocatorConfig) -> Result<Self> {
        host.validate()?;
        config.validate()?;
        let cores = (0..host.cores).map(CoreState::new).collect();
        Ok(Self {
            host,
            config,
            mode: None,
            cores,
            records: vec![],
            by_name: HashMap::new(),
            diagnostics: vec![],
        })
    }

    pub fn host(&self) -> &HostSpec {
        &self.host
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn mode(&self) -> Option<PlacementMode> {
        self.mode
    }

    pub fn cores(&self) -> &[CoreState] {
        &self.cores
    }

    pub fn records(&self) -> &[AllocationRecord] {
        &self.records
    }

    pub fn record(&self, name: &str) -> Option<&AllocationRecord> {
        self.by_name.get(name).map(|&i| &self.records[i])
    }

    pub fn reset(&mut self) {
        self.cores = (0..self.host.cores).map(CoreState::new).collect();
        self.records.clear();
        self.by_name.clear();
        self.diagnostics.clear();
        self.mode = None;
    }

    pub fn demand(&self, cores: u32, score: f64) -> Demand {
        demand(cores, score, self.host.score, self.config.allow_overscaling)
    }

    /// Pick the placement mode for a fleet needing `total_cores_needed`
    /// cores with `total_effective` cores' worth of work.
    pub fn set_mode(&mut self, total_cores_needed: usize, total_effective: f64) -> PlacementMode {
        let host_cores = self.host.cores as f64;
        let mode = if total_cores_needed > self.host.cores {
            PlacementMode::Shared
        } else if total_effective < host_cores * self.config.spread_threshold {
            PlacementMode::Spread
        } else {
            PlacementMode::Shared
        };

        info!(
            "placement mode {}: {} cores needed, {:.3} effective, {} host cores",
            mode, total_cores_needed, total_effective, self.host.cores
        );
        self.mode = Some(mode);
        mode
    }

    /// Record a fleet-wide finding in the summary.
    pub fn add_diagnostic(&mut self, diag: Diagnostic) {
        debug!("{}", diag);
        self.diagnostics.push(diag);
    }

    /// Core ids to give a node, best first.
    fn rank_cores(&self, mode: PlacementMode, limit: f64) -> Vec<usize> {
        let mut order: Vec<&CoreState> = self.cores.iter().collect();
        match mode {
            PlacementMode::Spread => {
                order.sort_by_key(|c| (Reverse(capacity_key(c.available())), c.id));
                order.into_iter().map(|c| c.id).collect()
            }
            PlacementMode::Shared => {
                let (mut fit, mut rest): (Vec<&CoreState>, Vec<&CoreState>) = order
                    .drain(..)
                    .partition(|c| c.available() + CAPACITY_EPSILON >= limit);
                fit.sort_by_key(|c| (Reverse(capacity_key(c.used)), c.id));
                rest.sort_by_key(|c| (capacity_key(c.used), c.id));
                fit.into_iter().chain(rest).map(|c| c.id).collect()
            }
        }
    }

    /// Place node `name` and derive its runtime constraints.
    pub fn allocate(
        &mut self,
        name: &str,
        cores: u32,
        score: f64,
        memory_bytes: u64,
    ) -> Result<&AllocationRecord> {
        let Some(mode) = self.mode else {
            return Err(FleetError::InvalidState(format!(
                "cannot allocate '{name}' before the placement mode is set"
            )));
        };
        if self.by_name.contains_key(name) {
            return Err(FleetError::InvalidState(format!(
                "'{name}' is already allocated"
            )));
        }
        if cores == 0 || !score.is_finite() || score <= 0.0 {
            return Err(FleetError::InvalidParameter(format!(
                "'{name}' needs at least one core and a positive score, got {cores} cores at {score}"
            )));
        }

        let demand = self.demand(cores, score);
        let limit = demand.per_core_limit;
        let mut diagnostics = vec![];

        let (nr_assign, effective) = if demand.cores_to_assign > self.host.cores {
            let diag = Diagnostic::CoresTruncated {
                node: name.to_string(),
                requested: demand.cores_to_assign,
                assigned: self.host.cores,
            };
            debug!("{}", diag);
            diagnostics.push(diag);
            (self.host.cores, self.host.cores as f64 * limit)
        } else {
            (demand.cores_to_assign, demand.effective)
        };

        let chosen: Vec<usize> = self
            .rank_cores(mode, limit)
            .into_iter()
            .take(nr_assign)
            .collect();

        let mut hot = vec![];
        for &id in &chosen {
            let core = &mut self.cores[id];
            core.used += limit;
            core.assigned.push(name.to_string());
            if core.is_oversubscribed() {
                hot.push(id);
            }
        }

        let oversubscribed = !hot.is_empty();
        if oversubscribed {
            let diag = Diagnostic::Oversubscribed {
                node: name.to_string(),
                cores: hot,
            };
            debug!("{}", diag);
            diagnostics.push(diag);
        }

        let constraints =
            RuntimeConstraints::new(self.config.cpu_period, effective, &chosen, memory_bytes);
        let hint = thread_hint(effective).to_string();
        let env = THREAD_HINT_VARS
            .iter()
            .map(|var| (var.to_string(), hint.clone()))
            .collect();

        debug!(
            "{}: mode={} cores={} limit={:.4} effective={:.4} quota={}",
            name, mode, constraints.cpuset_cpus, limit, effective, constraints.cpu_quota
        );

        self.by_name.insert(name.to_string(), self.records.len());
        self.records.push(AllocationRecord {
            name: name.to_string(),
            cores: chosen,
            per_core_limit: limit,
            effective,
            perf_ratio: demand.perf_ratio,
            constraints,
            env,
            mode,
            oversubscribed,
            diagnostics,
        });
        Ok(&self.records[self.records.len() - 1])
    }

    pub fn summary(&self) -> AllocationSummary {
        AllocationSummary {
            host_cores: self.host.cores,
            host_score: self.host.score,
            mode: self.mode,
            active_cores: self.cores.iter().filter(|c| !c.assigned.is_empty()).count(),
            total_used: self.cores.iter().map(|c| c.used).sum(),
            cores: self.cores.clone(),
            records: self.records.clone(),
            oversubscribed_cores: self
                .cores
                .iter()
                .filter(|c| c.is_oversubscribed())
                .map(|c| c.id)
                .collect(),
            diagnostics: self.diagnostics.clone(),
        }
    }
}
