// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-parameter (mean, stddev) extraction from catalog entries and the
//! depth-first alias lookup used to resolve connection-type names.

use std::fmt;

use serde_json::Map;
use serde_json::Value;

use crate::error::FleetError;
use crate::error::Result;

/// Fallback relative spread when a parameter has no usable range.
pub const DEFAULT_REL_STDDEV: f64 = 0.2;

/// Means and standard deviations of the parameters in one entry, in
/// document order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamStats {
    pub keys: Vec<String>,
    pub means: Vec<f64>,
    pub stddevs: Vec<f64>,
}

impl ParamStats {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Derive stats from `{param: {typical, range: [min, max]}}`.
    ///
    /// A range covers roughly four standard deviations of a normal
    /// distribution, so stddev = (max - min) / 4. Without a usable range the
    /// stddev falls back to 20% of |typical|. Entries lacking `typical` are
    /// skipped.
    pub fn extract(entry: &Map<String, Value>) -> Self {
        let mut stats = Self::default();
        for (key, field) in entry {
            let Some(typical) = field.get("typical").and_then(Value::as_f64) else {
                continue;
            };
            let stddev = match field.get("range").and_then(range_bounds) {
                Some((lo, hi)) if hi > lo => (hi - lo) / 4.0,
                _ => DEFAULT_REL_STDDEV * typical.abs(),
            };
            stats.keys.push(key.clone());
            stats.means.push(typical);
            stats.stddevs.push(stddev);
        }
        stats
    }

    /// Element-wise mean over several entries that share one key list.
    pub fn average<'a>(sets: impl IntoIterator<Item = &'a ParamStats>) -> Result<ParamStats> {
        let mut iter = sets.into_iter();
        let Some(first) = iter.next() else {
            return Ok(ParamStats::default());
        };

        let mut acc = first.clone();
        let mut count = 1usize;
        for set in iter {
            if set.keys != acc.keys {
                return Err(FleetError::InconsistentSchema(format!(
                    "parameter keys {:?} do not match {:?}",
                    set.keys, acc.keys
                )));
            }
            for i in 0..acc.len() {
                acc.means[i] += set.means[i];
                acc.stddevs[i] += set.stddevs[i];
            }
            count += 1;
        }

        let n = count as f64;
        acc.means.iter_mut().for_each(|m| *m /= n);
        acc.stddevs.iter_mut().for_each(|s| *s /= n);
        Ok(acc)
    }
}

fn range_bounds(range: &Value) -> Option<(f64, f64)> {
    match range.as_array()?.as_slice() {
        [lo, hi, ..] => Some((lo.as_f64()?, hi.as_f64()?)),
        _ => None,
    }
}

/// One step of a path into a JSON document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl PathSegment {
    pub fn as_key(&self) -> Option<&str> {
        match self {
            PathSegment::Key(k) => Some(k),
            PathSegment::Index(_) => None,
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => write!(f, "{k}"),
            PathSegment::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// Depth-first search for `key` anywhere in `doc`.
///
/// Objects are checked for a direct hit before descending into their
/// children; children are visited in document order and the first match
/// wins. Returns the path ending in `key` and the value found there.
pub fn deep_find<'a>(doc: &'a Value, key: &str) -> Result<(Vec<PathSegment>, &'a Value)> {
    let mut path = Vec::new();
    match visit(doc, key, &mut path) {
        Some(found) => Ok((path, found)),
        None => Err(FleetError::NotFound(format!(
            "'{key}' not found anywhere in catalog"
        ))),
    }
}

fn visit<'a>(node: &'a Value, key: &str, path: &mut Vec<PathSegment>) -> Option<&'a Value> {
    match node {
        Value::Object(map) => {
            if let Some(hit) = map.get(key) {
                path.push(PathSegment::Key(key.to_string()));
                return Some(hit);
            }
            for (k, child) in map {
                path.push(PathSegment::Key(k.clone()));
                if let Some(hit) = visit(child, key, path) {
                    return Some(hit);
                }
                path.pop();
            }
            None
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                path.push(PathSegment::Index(i));
                if let Some(hit) = visit(child, key, path) {
                    return Some(hit);
                }
                path.pop();
            }
            None
        }
        _ => None,
    }
}
