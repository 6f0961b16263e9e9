// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Seed-keyed sampling of link and device characteristics
//!
//! Every call builds its own generator from the node index, so the same
//! (catalog, profile, node index, connection type, correlation) always
//! produces the same draw, across calls and across process restarts.
//! Nothing here touches shared random state.
//!
//! Correlated draws use a covariance with `1` on the diagonal and the
//! correlation coefficient elsewhere, scaled by the outer product of the
//! per-parameter standard deviations:
//!
//!```text
//!     C[i][j] = (i == j ? 1 : rho) * sd[i] * sd[j]
//!     x       = mean + L * z,   L * L^T = C,   z ~ N(0, I)
//!```

use std::collections::BTreeMap;

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::Deserialize;
use serde::Serialize;

use crate::catalog::DeviceCatalog;
use crate::catalog::DeviceSpec;
use crate::catalog::NetworkCatalog;
use crate::error::FleetError;
use crate::error::Result;
use crate::stats::deep_find;
use crate::stats::ParamStats;

pub const LINK_DELAY_KEY: &str = "delay_ms";
pub const LINK_BANDWIDTH_KEY: &str = "band_mbps";
pub const LINK_JITTER_KEY: &str = "jitter_ms";
pub const LINK_LOSS_KEY: &str = "loss_percent";

/// Relative tolerance for treating a Cholesky pivot as zero.
const PSD_TOLERANCE: f64 = 1e-10;

/// Profile names that mean "leave this node unconstrained".
fn is_unset(name: &str) -> bool {
    matches!(name.to_ascii_lowercase().as_str(), "" | "none" | "nan")
}

pub(crate) fn normalize(name: Option<&str>) -> Option<&str> {
    name.filter(|n| !is_unset(n))
}

/// Which profile a node uses: one name for every node, or one entry per
/// node. Entries of `null`, `"none"`, `"nan"` or `""` select no profile.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProfileSelector {
    Single(String),
    PerNode(Vec<Option<String>>),
}

impl ProfileSelector {
    /// Profile name for sampling node `node_index`.
    ///
    /// Per-node lists are 1-based: node `i` takes entry `i - 1`, and indices
    /// past the end reuse the last entry. Index 0 selects no profile.
    pub fn resolve(&self, node_index: usize) -> Option<&str> {
        match self {
            ProfileSelector::Single(_) => self.entry(0),
            ProfileSelector::PerNode(_) => self.entry(node_index.checked_sub(1)?),
        }
    }

    /// Profile name for container `id` of an experiment.
    ///
    /// Same as [`resolve`](Self::resolve) except that container 0, which
    /// is a real node here, shares entry 0 with container 1.
    pub fn for_container(&self, id: usize) -> Option<&str> {
        self.entry(id.saturating_sub(1))
    }

    fn entry(&self, i: usize) -> Option<&str> {
        match self {
            ProfileSelector::Single(name) => normalize(Some(name.as_str())),
            ProfileSelector::PerNode(names) => {
                let entry = names.get(i).or_else(|| names.last())?;
                normalize(entry.as_deref())
            }
        }
    }
}

impl From<&str> for ProfileSelector {
    fn from(name: &str) -> Self {
        ProfileSelector::Single(name.to_string())
    }
}

/// Sampled characteristics of one emulated link, keyed by parameter name.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LinkSample {
    pub profile: String,
    pub connection_type: Option<String>,
    pub values: BTreeMap<String, f64>,
}

impl LinkSample {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn delay_ms(&self) -> Option<f64> {
        self.get(LINK_DELAY_KEY)
    }

    pub fn bandwidth_mbps(&self) -> Option<f64> {
        self.get(LINK_BANDWIDTH_KEY)
    }

    pub fn jitter_ms(&self) -> Option<f64> {
        self.get(LINK_JITTER_KEY)
    }

    pub fn loss_percent(&self) -> Option<f64> {
        self.get(LINK_LOSS_KEY)
    }
}

/// Relative spread and cross-field correlation for device perturbation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Perturbation {
    pub variation: f64,
    pub correlation: f64,
}

impl Default for Perturbation {
    fn default() -> Self {
        Self {
            variation: 0.2,
            correlation: 0.5,
        }
    }
}

fn node_rng(node_index: usize) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(node_index as u64)
}

/// Sample link parameters for node `node_index`.
///
/// Returns `Ok(None)` when the selector assigns no profile to this node.
pub fn sample_link(
    catalog: &NetworkCatalog,
    selector: &ProfileSelector,
    node_index: usize,
    conn_type: Option<&str>,
    correlation: Option<f64>,
) -> Result<Option<LinkSample>> {
    match selector.resolve(node_index) {
        Some(profile) => {
            sample_profile(catalog, profile, node_index, conn_type, correlation).map(Some)
        }
        None => Ok(None),
    }
}

/// Sample link parameters from a named profile or connection-type alias.
pub fn sample_profile(
    catalog: &NetworkCatalog,
    name: &str,
    node_index: usize,
    conn_type: Option<&str>,
    correlation: Option<f64>,
) -> Result<LinkSample> {
    let (profile, conn_type) = resolve_profile(catalog, name, conn_type)?;

    let stats = match &conn_type {
        Some(conn) => ParamStats::extract(catalog.connection_set(&profile, conn)?),
        None => {
            let sets: Vec<ParamStats> = catalog
                .connection_sets(&profile)?
                .into_iter()
                .map(|(_, entry)| ParamStats::extract(entry))
                .collect();
            ParamStats::average(&sets)?
        }
    };

    let mut rng = node_rng(node_index);
    let draw = match correlation {
        Some(rho) => correlated_normal(&stats.means, &stats.stddevs, rho, &mut rng)?,
        None => independent_normal(&stats.means, &stats.stddevs, &mut rng),
    };

    let values = stats
        .keys
        .into_iter()
        .zip(draw)
        .map(|(k, v)| (k, v.max(0.0)))
        .collect();

    Ok(LinkSample {
        profile,
        connection_type: conn_type,
        values,
    })
}

/// Map a profile name or connection-type alias to (profile, connection type).
fn resolve_profile(
    catalog: &NetworkCatalog,
    name: &str,
    conn_type: Option<&str>,
) -> Result<(String, Option<String>)> {
    if catalog.has_profile(name) {
        return Ok((name.to_string(), conn_type.map(str::to_string)));
    }

    let (path, _) = deep_find(catalog.root(), name)?;
    match (
        path.first().and_then(|s| s.as_key()),
        path.get(1).and_then(|s| s.as_key()),
    ) {
        (Some(profile), Some(conn)) => Ok((profile.to_string(), Some(conn.to_string()))),
        _ => Err(FleetError::NotFound(format!(
            "'{name}' does not name a network profile or connection type"
        ))),
    }
}

/// Draw a perturbed copy of device archetype `name` for node `node_index`.
///
/// Fields listed in `locked` are copied verbatim. The rest are drawn from a
/// correlated normal around the archetype values with a standard deviation
/// of `variation * |value|`, rounded when the archetype value is integral
/// and clamped to at least 1.
pub fn perturb_device(
    catalog: &DeviceCatalog,
    name: &str,
    node_index: usize,
    perturbation: &Perturbation,
    locked: &[&str],
) -> Result<DeviceSpec> {
    let archetype = catalog.get(name)?;
    if !perturbation.variation.is_finite() || perturbation.variation < 0.0 {
        return Err(FleetError::InvalidParameter(format!(
            "variation must be a non-negative number, got {}",
            perturbation.variation
        )));
    }

    let keys: Vec<&str> = DeviceSpec::FIELDS
        .iter()
        .copied()
        .filter(|k| !locked.contains(k))
        .collect();
    let mut sample = archetype.clone();
    if keys.is_empty() {
        return Ok(sample);
    }

    let means: Vec<f64> = keys
        .iter()
        .map(|k| archetype.get(k).unwrap_or_default())
        .collect();
    let sigma: Vec<f64> = means
        .iter()
        .map(|m| perturbation.variation * m.abs())
        .collect();

    let mut rng = node_rng(node_index);
    let draw = correlated_normal(&means, &sigma, perturbation.correlation, &mut rng)?;

    for ((key, mean), value) in keys.iter().zip(&means).zip(draw) {
        let value = if mean.fract() == 0.0 {
            value.round()
        } else {
            value
        };
        sample.set(key, value.max(1.0));
    }
    Ok(sample)
}

fn standard_normals(n: usize, rng: &mut impl Rng) -> Vec<f64> {
    (0..n).map(|_| rng.sample::<f64, _>(StandardNormal)).collect()
}

/// Independent normal draw per parameter.
pub fn independent_normal(means: &[f64], stddevs: &[f64], rng: &mut impl Rng) -> Vec<f64> {
    let z = standard_normals(means.len(), rng);
    means
        .iter()
        .zip(stddevs)
        .zip(z)
        .map(|((m, s), z)| m + s * z)
        .collect()
}

/// One multivariate normal draw with uniform pairwise correlation `rho`.
pub fn correlated_normal(
    means: &[f64],
    stddevs: &[f64],
    rho: f64,
    rng: &mut impl Rng,
) -> Result<Vec<f64>> {
    if !(-1.0..=1.0).contains(&rho) {
        return Err(FleetError::InvalidParameter(format!(
            "correlation must be within [-1, 1], got {rho}"
        )));
    }

    let l = cholesky(&uniform_covariance(stddevs, rho))?;
    let z = standard_normals(means.len(), rng);

    Ok(means
        .iter()
        .enumerate()
        .map(|(i, m)| m + (0..=i).map(|k| l[i][k] * z[k]).sum::<f64>())
        .collect())
}

pub fn uniform_covariance(stddevs: &[f64], rho: f64) -> Vec<Vec<f64>> {
    let n = stddevs.len();
    (0..n)
        .map(|i| {
            (0..n)
                .map(|j| {
                    let c = if i == j { 1.0 } else { rho };
                    c * stddevs[i] * stddevs[j]
                })
                .collect()
        })
        .collect()
}

/// Lower-triangular factor of a positive semi-definite matrix.
///
/// Zero pivots (zero-variance parameters, perfect correlation) are accepted
/// as long as the rest of their column is zero too.
pub fn cholesky(cov: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
    let n = cov.len();
    let scale = (0..n).map(|i| cov[i][i].abs()).fold(0.0, f64::max);
    let tol = PSD_TOLERANCE * scale;
    let not_psd = || {
        FleetError::InvalidParameter("covariance matrix is not positive semi-definite".into())
    };

    let mut l = vec![vec![0.0; n]; n];
    for j in 0..n {
        let d = cov[j][j] - (0..j).map(|k| l[j][k] * l[j][k]).sum::<f64>();
        if d < -tol {
            return Err(not_psd());
        }
        let pivot = if d > tol { d.sqrt() } else { 0.0 };
        l[j][j] = pivot;

        for i in j + 1..n {
            let s = cov[i][j] - (0..j).map(|k| l[i][k] * l[j][k]).sum::<f64>();
            if pivot > 0.0 {
                l[i][j] = s / pivot;
            } else if s.abs() > tol.sqrt() * scale.sqrt() {
                return Err(not_psd());
            }
        }
    }
    Ok(l)
}
