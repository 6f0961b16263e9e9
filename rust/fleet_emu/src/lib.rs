// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # fleet_emu
//!
//! Sampling and CPU planning for emulated device fleets.
//!
//! A fleet is a set of containers, each standing in for a physical device
//! (a Raspberry Pi, a phone, a small x86 box) behind a shaped network link.
//! This crate decides what each device looks like and how it maps onto the
//! host:
//!
//! - [`catalog`]: device and network archetype documents, loaded once per
//!   process.
//! - [`sampler`]: seed-keyed, optionally correlated draws of link
//!   parameters and perturbed device specs.
//! - [`alloc`]: the core allocator that turns device scores into per-core
//!   limits, picks Spread or Shared placement and emits CFS quota, shares
//!   and cpusets.
//! - [`manager`]: container registration and single-shot planning.
//! - [`experiment`]: a whole experiment from an [`ExperimentConfig`].
//!
//! Nothing here talks to a container runtime or a scheduler; the output is
//! the set of parameters to hand to one.

pub mod alloc;
pub mod catalog;
pub mod config;
pub mod error;
pub mod experiment;
pub mod host;
pub mod manager;
pub mod sampler;
pub mod stats;

pub use alloc::AllocationRecord;
pub use alloc::AllocationSummary;
pub use alloc::AllocatorConfig;
pub use alloc::CoreAllocator;
pub use alloc::Diagnostic;
pub use alloc::PlacementMode;
pub use alloc::RuntimeConstraints;
pub use catalog::DeviceCatalog;
pub use catalog::DeviceSpec;
pub use catalog::NetworkCatalog;
pub use catalog::ProfileRepository;
pub use config::ExperimentConfig;
pub use error::FleetError;
pub use error::Result;
pub use experiment::ExperimentPlan;
pub use experiment::LinkParams;
pub use host::format_cpulist;
pub use host::HostSpec;
pub use manager::ContainerConfig;
pub use manager::ContainerRequest;
pub use manager::ContainerResourceManager;
pub use manager::ResourceConfig;
pub use sampler::perturb_device;
pub use sampler::sample_link;
pub use sampler::LinkSample;
pub use sampler::Perturbation;
pub use sampler::ProfileSelector;
pub use stats::deep_find;
pub use stats::ParamStats;
