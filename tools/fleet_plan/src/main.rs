// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
mod cli;

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use fleet_emu::catalog::DeviceSpec;
use fleet_emu::ExperimentConfig;
use fleet_emu::ExperimentPlan;
use fleet_emu::HostSpec;
use fleet_emu::Perturbation;
use fleet_emu::ProfileRepository;
use fleet_emu::ProfileSelector;
use serde::Serialize;
use tracing::info;
use tracing::warn;
use tracing_subscriber::filter::EnvFilter;

use cli::Commands;
use cli::Opts;

fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| match EnvFilter::try_new(log_level) {
            Ok(filter) => Ok(filter),
            Err(e) => {
                eprintln!(
                    "invalid log envvar: {}, using info, err is: {}",
                    log_level, e
                );
                EnvFilter::try_new("info")
            }
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
    {
        Ok(()) => {}
        Err(e) => eprintln!("failed to init logger: {}", e),
    }
}

fn emit<T: Serialize>(value: &T, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    match output {
        Some(path) => {
            fs::write(path, json + "\n")
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("wrote {}", path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{json}").context("Failed to write to stdout")?;
        }
    }
    Ok(())
}

fn host_spec(opts: &Opts, config_score: f64) -> Result<HostSpec> {
    let score = opts.host_score.unwrap_or(config_score);
    let mut host = HostSpec::detect(score).context("Failed to describe the host")?;
    if let Some(cores) = opts.host_cores {
        if cores == 0 {
            bail!("--host-cores must be at least 1");
        }
        host.cores = cores;
    }
    Ok(host)
}

fn cmd_plan(
    opts: &Opts,
    repo: &ProfileRepository,
    config: &Path,
    output: Option<&Path>,
) -> Result<()> {
    let config = ExperimentConfig::load(config)
        .with_context(|| format!("Failed to load experiment config {}", config.display()))?;
    let host = host_spec(opts, config.host_single_core_score)?;
    info!(
        "planning {} containers on {} cores (score {})",
        config.container_count(),
        host.cores,
        host.score
    );

    let plan = ExperimentPlan::build(&config, host, repo).context("Failed to plan experiment")?;
    for node in &plan.nodes {
        for diag in &node.container.diagnostics {
            warn!("{}", diag);
        }
    }
    for diag in &plan.summary.diagnostics {
        warn!("{}", diag);
    }
    emit(&plan, output)
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logging(&opts.log_level);

    let repo = match &opts.data_dir {
        Some(dir) => ProfileRepository::new(dir),
        None => ProfileRepository::default(),
    };

    match &opts.command {
        Commands::Plan { config, output } => cmd_plan(&opts, &repo, config, output.as_deref()),
        Commands::SampleLink {
            profile,
            index,
            conn_type,
            correlation,
            catalog,
        } => {
            let network = repo
                .network_catalog(catalog)
                .with_context(|| format!("Failed to load network catalog {}", catalog.display()))?;
            let selector = ProfileSelector::Single(profile.clone());
            let sample = fleet_emu::sample_link(
                &network,
                &selector,
                *index,
                conn_type.as_deref(),
                *correlation,
            )
            .with_context(|| format!("Failed to sample link profile '{profile}'"))?;
            emit(&sample, None)
        }
        Commands::PerturbDevice {
            name,
            index,
            variation,
            correlation,
            locked,
            catalog,
        } => {
            for key in locked {
                if !DeviceSpec::FIELDS.contains(&key.as_str()) {
                    bail!(
                        "unknown device field '{}', expected one of {:?}",
                        key,
                        DeviceSpec::FIELDS
                    );
                }
            }
            let devices = repo
                .device_catalog(catalog)
                .with_context(|| format!("Failed to load device catalog {}", catalog.display()))?;
            let perturbation = Perturbation {
                variation: *variation,
                correlation: *correlation,
            };
            let locked: Vec<&str> = locked.iter().map(String::as_str).collect();
            let spec = fleet_emu::perturb_device(&devices, name, *index, &perturbation, &locked)
                .with_context(|| format!("Failed to perturb device '{name}'"))?;
            emit(&spec, None)
        }
    }
}
