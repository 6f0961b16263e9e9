// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Experiment planning
//!
//! Turns an [`ExperimentConfig`] into the per-container runtime constraints
//! and per-link shaping parameters of a whole experiment:
//!
//! 1. register `c0..c{n-1}` with their device types and plan the cores,
//! 2. resolve each node's link (explicit override, then a sampled network
//!    profile seeded with the container id, then the defaults),
//! 3. apply per-node constraint overrides on top of the planned values.

use serde::Serialize;
use tracing::debug;
use tracing::info;

use crate::alloc::AllocationSummary;
use crate::catalog::NetworkCatalog;
use crate::catalog::ProfileRepository;
use crate::config::ConstraintOverride;
use crate::config::ExperimentConfig;
use crate::error::Result;
use crate::host::read_cpulist;
use crate::host::HostSpec;
use crate::manager::ContainerConfig;
use crate::manager::ContainerRequest;
use crate::manager::ContainerResourceManager;
use crate::sampler::sample_profile;

const MIB: u64 = 1024 * 1024;

pub fn container_name(id: usize) -> String {
    format!("c{id}")
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum LinkSource {
    Override,
    Profile(String),
    Default,
}

/// Shaping for the link between a node and its router.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LinkParams {
    /// End-to-end delay.
    pub delay_ms: f64,
    /// Delay applied on each of the two hops.
    pub per_hop_delay_ms: f64,
    /// `None` leaves bandwidth unshaped.
    pub bandwidth_mbps: Option<f64>,
    pub jitter_ms: f64,
    pub loss_percent: f64,
    pub source: LinkSource,
}

impl LinkParams {
    fn new(
        delay_ms: f64,
        bandwidth_mbps: f64,
        jitter_ms: f64,
        loss_percent: f64,
        source: LinkSource,
    ) -> Self {
        Self {
            delay_ms,
            per_hop_delay_ms: delay_ms / 2.0,
            bandwidth_mbps: (bandwidth_mbps > 0.0).then_some(bandwidth_mbps),
            jitter_ms,
            loss_percent,
            source,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct NodePlan {
    pub id: usize,
    pub device_type: Option<String>,
    pub network_type: Option<String>,
    pub container: ContainerConfig,
    pub link: LinkParams,
}

#[derive(Clone, Debug, Serialize)]
pub struct ExperimentPlan {
    pub host: HostSpec,
    pub nodes: Vec<NodePlan>,
    pub summary: AllocationSummary,
}

impl ExperimentPlan {
    pub fn build(
        config: &ExperimentConfig,
        host: HostSpec,
        repo: &ProfileRepository,
    ) -> Result<Self> {
        config.validate()?;
        let count = config.container_count();

        let devices = if (0..count).any(|id| config.device_type_for(id).is_some()) {
            Some(repo.device_catalog(&config.device_catalog)?)
        } else {
            None
        };
        let network = if (0..count).any(|id| needs_link_sample(config, id)) {
            Some(repo.network_catalog(&config.network_catalog)?)
        } else {
            None
        };

        let mut manager =
            ContainerResourceManager::new(host.clone(), config.resource_config(), devices)?;
        for id in 0..count {
            let mut request = ContainerRequest::new(container_name(id)).index(id);
            if let Some(device) = config.device_type_for(id) {
                request = request.archetype(device);
            }
            manager.add_container(request)?;
        }
        manager.plan_allocations()?;

        let mut nodes = Vec::with_capacity(count);
        for (id, planned) in manager.get_all_configs()?.iter().enumerate() {
            let mut container = planned.clone();
            if let Some(node) = config.node_override(id) {
                apply_constraints(&mut container, &node.constraints)?;
            }
            let link = resolve_link(config, id, network.as_ref())?;
            debug!("{}: link {:?}", container.name, link);

            nodes.push(NodePlan {
                id,
                device_type: config.device_type_for(id).map(str::to_string),
                network_type: config.network_type_for(id).map(str::to_string),
                container,
                link,
            });
        }

        let summary = manager.get_allocation_summary()?;
        info!(
            "experiment plan ready: {} nodes, {} diagnostics",
            nodes.len(),
            summary.diagnostics.len()
                + nodes
                    .iter()
                    .map(|n| n.container.diagnostics.len())
                    .sum::<usize>()
        );

        Ok(Self {
            host,
            nodes,
            summary,
        })
    }
}

fn has_link_override(config: &ExperimentConfig, id: usize) -> bool {
    config
        .node_override(id)
        .is_some_and(|n| !n.link.is_empty())
}

fn needs_link_sample(config: &ExperimentConfig, id: usize) -> bool {
    !has_link_override(config, id) && config.network_type_for(id).is_some()
}

fn resolve_link(
    config: &ExperimentConfig,
    id: usize,
    network: Option<&NetworkCatalog>,
) -> Result<LinkParams> {
    if let Some(link) = config
        .node_override(id)
        .map(|n| &n.link)
        .filter(|l| !l.is_empty())
    {
        return Ok(LinkParams::new(
            link.delay_ms.unwrap_or(config.default_delay_ms),
            link.bandwidth_mbps.unwrap_or(config.default_bandwidth_mbps),
            link.jitter_ms.unwrap_or(config.default_jitter_ms),
            link.loss_percent.unwrap_or(0.0),
            LinkSource::Override,
        ));
    }

    if let (Some(profile), Some(network)) = (config.network_type_for(id), network) {
        let sample = sample_profile(network, profile, id, None, config.network_correlation)?;
        return Ok(LinkParams::new(
            sample.delay_ms().unwrap_or(config.default_delay_ms),
            sample.bandwidth_mbps().unwrap_or(config.default_bandwidth_mbps),
            sample.jitter_ms().unwrap_or(config.default_jitter_ms),
            sample.loss_percent().unwrap_or(0.0),
            LinkSource::Profile(profile.to_string()),
        ));
    }

    Ok(LinkParams::new(
        config.default_delay_ms,
        config.default_bandwidth_mbps,
        config.default_jitter_ms,
        0.0,
        LinkSource::Default,
    ))
}

fn apply_constraints(container: &mut ContainerConfig, o: &ConstraintOverride) -> Result<()> {
    let c = &mut container.constraints;
    if let Some(period) = o.cpu_period {
        c.cpu_period = period;
    }
    if let Some(quota) = o.cpu_quota {
        c.cpu_quota = quota;
    }
    if let Some(cpus) = &o.cpuset_cpus {
        c.cpuset = read_cpulist(cpus)?;
        c.cpuset_cpus = cpus.clone();
    }
    if let Some(mb) = o.memory_mb {
        c.memory_bytes = mb * MIB;
    }
    Ok(())
}
