// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Description of the physical host the fleet is packed onto.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use sscanf::sscanf;
use tracing::debug;

use crate::error::FleetError;
use crate::error::Result;

/// Single-core benchmark score of the reference host.
pub const DEFAULT_HOST_SCORE: f64 = 1079.0;

const CPU_ONLINE_PATH: &str = "sys/devices/system/cpu/online";
const CPU_MAX_FREQ_PATH: &str = "sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_max_freq";
const MEMINFO_PATH: &str = "proc/meminfo";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostSpec {
    /// Number of physical cores available for placement.
    pub cores: usize,
    /// Single-core benchmark score of one host core.
    pub score: f64,
    #[serde(default)]
    pub memory_bytes: Option<u64>,
    #[serde(default)]
    pub max_freq_mhz: Option<f64>,
}

impl HostSpec {
    pub fn new(cores: usize, score: f64) -> Self {
        Self {
            cores,
            score,
            memory_bytes: None,
            max_freq_mhz: None,
        }
    }

    pub fn with_memory_bytes(mut self, bytes: u64) -> Self {
        self.memory_bytes = Some(bytes);
        self
    }

    pub fn with_max_freq_mhz(mut self, mhz: f64) -> Self {
        self.max_freq_mhz = Some(mhz);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.cores == 0 {
            return Err(FleetError::InvalidParameter(
                "host must have at least one core".into(),
            ));
        }
        if !self.score.is_finite() || self.score <= 0.0 {
            return Err(FleetError::InvalidParameter(format!(
                "host score must be positive, got {}",
                self.score
            )));
        }
        Ok(())
    }

    /// Describe the running machine. The score cannot be measured here and
    /// is taken as given.
    pub fn detect(score: f64) -> Result<Self> {
        Self::detect_from(Path::new("/"), score)
    }

    /// Like [`Self::detect`], reading `proc` and `sys` under `root`.
    pub fn detect_from(root: &Path, score: f64) -> Result<Self> {
        let cores = match fs::read_to_string(root.join(CPU_ONLINE_PATH)) {
            Ok(list) => read_cpulist(&list)?.len(),
            Err(e) => {
                debug!("cpu online list unavailable ({e}), using available parallelism");
                std::thread::available_parallelism().map_or(1, |n| n.get())
            }
        };

        let memory_bytes = fs::read_to_string(root.join(MEMINFO_PATH))
            .ok()
            .and_then(|s| parse_mem_total(&s));
        let max_freq_mhz = fs::read_to_string(root.join(CPU_MAX_FREQ_PATH))
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .map(|khz| khz / 1000.0);

        let host = Self {
            cores,
            score,
            memory_bytes,
            max_freq_mhz,
        };
        host.validate()?;
        debug!("detected host {:?}", host);
        Ok(host)
    }
}

fn parse_mem_total(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemTotal:")?;
        let kib: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
        Some(kib * 1024)
    })
}

/// Parse a kernel cpulist such as `0-3,6`.
pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim().trim_end_matches('\0');
    let mut cpu_ids = vec![];
    if cpulist.is_empty() {
        return Ok(cpu_ids);
    }
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    return Err(FleetError::InvalidParameter(format!(
                        "failed to parse cpulist {}",
                        group.trim()
                    )));
                }
            },
        };
        cpu_ids.extend(min..=max);
    }
    Ok(cpu_ids)
}

/// Render core ids as a cpulist, collapsing consecutive runs.
pub fn format_cpulist(cpus: &[usize]) -> String {
    let mut cpus = cpus.to_vec();
    cpus.sort_unstable();
    cpus.dedup();

    let mut groups = vec![];
    let mut iter = cpus.into_iter().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        groups.push(if start == end {
            format!("{start}")
        } else {
            format!("{start}-{end}")
        });
    }
    groups.join(",")
}
