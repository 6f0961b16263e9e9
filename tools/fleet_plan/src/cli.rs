// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use fleet_emu::catalog::DEVICE_CATALOG_FILE;
use fleet_emu::catalog::NETWORK_CATALOG_FILE;

/// Plan device, link and CPU constraints for an emulated fleet.
///
/// Results are printed as JSON on stdout; logs go to stderr.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Opts {
    /// Specify the logging level. Accepts rust's envfilter syntax for modular
    /// logging: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html#example-syntax. Examples: ["info", "warn,fleet_emu=debug"]
    #[clap(long, default_value = "info")]
    pub log_level: String,

    /// Number of host cores to plan for. Detected from sysfs if unset.
    #[clap(long)]
    pub host_cores: Option<usize>,

    /// Single-core benchmark score of one host core. Overrides the value in
    /// the experiment config.
    #[clap(long)]
    pub host_score: Option<f64>,

    /// Directory searched for catalogs not found at the given path.
    #[clap(long, env = "FLEET_EMU_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Plan every container and link of an experiment")]
    Plan {
        /// Experiment config (JSON).
        #[arg(short, long)]
        config: PathBuf,
        /// Write the plan here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    #[command(about = "Sample link parameters from a network profile")]
    SampleLink {
        /// Profile or connection type name.
        profile: String,
        #[arg(short, long, default_value = "1")]
        index: usize,
        /// Use one connection type instead of averaging all of them.
        #[arg(long)]
        conn_type: Option<String>,
        #[arg(long)]
        correlation: Option<f64>,
        #[arg(long, default_value = NETWORK_CATALOG_FILE)]
        catalog: PathBuf,
    },
    #[command(about = "Draw a perturbed sample of a device archetype")]
    PerturbDevice {
        name: String,
        #[arg(short, long, default_value = "1")]
        index: usize,
        #[arg(long, default_value = "0.2")]
        variation: f64,
        #[arg(long, default_value = "0.5")]
        correlation: f64,
        /// Field to copy from the archetype unchanged. Repeatable.
        #[arg(long = "lock")]
        locked: Vec<String>,
        #[arg(long, default_value = DEVICE_CATALOG_FILE)]
        catalog: PathBuf,
    },
}
