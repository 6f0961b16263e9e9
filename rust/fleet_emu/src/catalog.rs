// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Profile catalogs
//!
//! Device and network archetypes live in two JSON documents:
//!
//!```text
//!     device_specs.json    name -> {cores, ram_gib, freq_mhz, single_core_score}
//!     network_specs.json   profile -> [connection type ->] parameter -> {typical, range}
//!```
//!
//! [`ProfileRepository::load`] reads a document from the given path, or from
//! the installation directory if the path does not exist as given. Parsed
//! documents are cached process-wide by resolved path, so every catalog is
//! read at most once per process and shared read-only afterwards.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use lazy_static::lazy_static;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use tracing::debug;

use crate::error::FleetError;
use crate::error::Result;

pub const DEVICE_CATALOG_FILE: &str = "device_specs.json";
pub const NETWORK_CATALOG_FILE: &str = "network_specs.json";

lazy_static! {
    static ref CATALOG_CACHE: Mutex<HashMap<PathBuf, Arc<Value>>> = Mutex::new(HashMap::new());
}

/// Locates and caches catalog documents.
#[derive(Debug, Clone)]
pub struct ProfileRepository {
    install_dir: PathBuf,
}

impl Default for ProfileRepository {
    fn default() -> Self {
        Self::new(Self::bundled_dir())
    }
}

impl ProfileRepository {
    pub fn new(install_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
        }
    }

    /// Directory holding the catalogs shipped with this crate.
    pub fn bundled_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("data")
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// Find `path` as given, then relative to the installation directory.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        let fallback = self.install_dir.join(path);
        if fallback.is_file() {
            return Ok(fallback);
        }
        Err(FleetError::NotFound(format!(
            "catalog '{}' (also tried '{}')",
            path.display(),
            fallback.display()
        )))
    }

    /// Load and cache the raw JSON document at `path`.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Arc<Value>> {
        let resolved = self.resolve(path)?;

        let mut cache = CATALOG_CACHE.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(doc) = cache.get(&resolved) {
            return Ok(doc.clone());
        }

        let content = fs::read_to_string(&resolved).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                FleetError::NotFound(format!("catalog '{}'", resolved.display()))
            } else {
                FleetError::Io {
                    path: resolved.clone(),
                    source,
                }
            }
        })?;
        let doc: Value = serde_json::from_str(&content).map_err(|source| FleetError::Json {
            path: resolved.clone(),
            source,
        })?;

        debug!("loaded catalog {}", resolved.display());
        let doc = Arc::new(doc);
        cache.insert(resolved, doc.clone());
        Ok(doc)
    }

    pub fn device_catalog(&self, path: impl AsRef<Path>) -> Result<DeviceCatalog> {
        let path = path.as_ref();
        let doc = self.load(path)?;
        DeviceCatalog::from_value(&doc).map_err(|source| FleetError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn network_catalog(&self, path: impl AsRef<Path>) -> Result<NetworkCatalog> {
        let doc = self.load(path.as_ref())?;
        NetworkCatalog::new(doc)
    }
}

/// Hardware description of a device archetype or of one perturbed sample
/// of it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub cores: u32,
    pub ram_gib: f64,
    pub freq_mhz: f64,
    pub single_core_score: f64,
}

impl DeviceSpec {
    pub const FIELDS: [&'static str; 4] = ["cores", "ram_gib", "freq_mhz", "single_core_score"];

    /// Field values in [`Self::FIELDS`] order.
    pub fn values(&self) -> [f64; 4] {
        [
            self.cores as f64,
            self.ram_gib,
            self.freq_mhz,
            self.single_core_score,
        ]
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        Self::FIELDS
            .iter()
            .position(|f| *f == key)
            .map(|i| self.values()[i])
    }

    /// Overwrite one field by name. Returns false for an unknown key.
    pub fn set(&mut self, key: &str, value: f64) -> bool {
        match key {
            "cores" => self.cores = value.round().max(0.0) as u32,
            "ram_gib" => self.ram_gib = value,
            "freq_mhz" => self.freq_mhz = value,
            "single_core_score" => self.single_core_score = value,
            _ => return false,
        }
        true
    }

    pub fn ram_bytes(&self) -> u64 {
        (self.ram_gib * GIB).max(0.0) as u64
    }
}

pub const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Named device archetypes. Entries are never mutated after load.
#[derive(Clone, Debug, Default)]
pub struct DeviceCatalog {
    devices: BTreeMap<String, DeviceSpec>,
}

impl DeviceCatalog {
    pub fn from_value(doc: &Value) -> std::result::Result<Self, serde_json::Error> {
        let devices = BTreeMap::<String, DeviceSpec>::deserialize(doc)?;
        Ok(Self { devices })
    }

    pub fn get(&self, name: &str) -> Result<&DeviceSpec> {
        self.devices
            .get(name)
            .ok_or_else(|| FleetError::NotFound(format!("device '{name}'")))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(|k| k.as_str())
    }

    pub fn insert(&mut self, name: impl Into<String>, spec: DeviceSpec) {
        self.devices.insert(name.into(), spec);
    }
}

/// Network profiles, kept as the tagged JSON tree so that aliases can be
/// resolved anywhere in the document.
#[derive(Clone, Debug)]
pub struct NetworkCatalog {
    doc: Arc<Value>,
}

impl NetworkCatalog {
    pub fn new(doc: Arc<Value>) -> Result<Self> {
        if !doc.is_object() {
            return Err(FleetError::InvalidParameter(
                "network catalog must be a JSON object".into(),
            ));
        }
        Ok(Self { doc })
    }

    pub fn from_value(doc: Value) -> Result<Self> {
        Self::new(Arc::new(doc))
    }

    pub fn root(&self) -> &Value {
        &self.doc
    }

    fn profiles(&self) -> &Map<String, Value> {
        // Checked in new().
        self.doc.as_object().expect("network catalog root is an object")
    }

    pub fn has_profile(&self, name: &str) -> bool {
        self.profiles().contains_key(name)
    }

    pub fn profile_names(&self) -> impl Iterator<Item = &str> {
        self.profiles().keys().map(|k| k.as_str())
    }

    /// Parameter sets of a profile, keyed by connection type, in document
    /// order. A profile whose parameters sit directly under it yields one
    /// set keyed by the profile name.
    pub fn connection_sets<'a>(
        &'a self,
        profile: &'a str,
    ) -> Result<Vec<(&'a str, &'a Map<String, Value>)>> {
        let entry = self
            .profiles()
            .get(profile)
            .and_then(Value::as_object)
            .ok_or_else(|| FleetError::NotFound(format!("network profile '{profile}'")))?;

        if is_parameter_set(entry) {
            return Ok(vec![(profile, entry)]);
        }

        Ok(entry
            .iter()
            .filter_map(|(conn, v)| v.as_object().map(|m| (conn.as_str(), m)))
            .collect())
    }

    pub fn connection_set<'a>(
        &'a self,
        profile: &'a str,
        conn_type: &str,
    ) -> Result<&'a Map<String, Value>> {
        self.connection_sets(profile)?
            .into_iter()
            .find(|(c, _)| *c == conn_type)
            .map(|(_, m)| m)
            .ok_or_else(|| {
                FleetError::NotFound(format!(
                    "connection type '{conn_type}' in profile '{profile}'"
                ))
            })
    }
}

/// A parameter set maps parameter names to `{typical, range}` objects.
fn is_parameter_set(entry: &Map<String, Value>) -> bool {
    entry
        .values()
        .any(|v| v.as_object().is_some_and(|m| m.contains_key("typical")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_load_falls_back_to_install_dir() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("devs.json"), r#"{"a": 1}"#).unwrap();

        let repo = ProfileRepository::new(tmp.path());
        let doc = repo.load("devs.json").unwrap();
        assert_eq!(doc["a"], json!(1));
    }

    #[test]
    fn test_load_missing_everywhere_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let repo = ProfileRepository::new(tmp.path());
        let err = repo.load("missing_specs.json").unwrap_err();
        assert!(err.is_not_found(), "got {err}");
    }

    #[test]
    fn test_load_is_cached_per_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cached.json");
        std::fs::write(&path, r#"{"v": 1}"#).unwrap();

        let repo = ProfileRepository::new(tmp.path());
        let first = repo.load(&path).unwrap();

        // A rewrite is not observed: the document is loaded once.
        std::fs::write(&path, r#"{"v": 2}"#).unwrap();
        let second = repo.load(&path).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second["v"], json!(1));
    }

    #[test]
    fn test_malformed_document_is_json_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("bad.json"), "{ nope").unwrap();
        let repo = ProfileRepository::new(tmp.path());
        assert!(matches!(
            repo.load("bad.json"),
            Err(FleetError::Json { .. })
        ));
    }

    #[test]
    fn test_bundled_catalogs() {
        let repo = ProfileRepository::default();
        let devices = repo.device_catalog(DEVICE_CATALOG_FILE).unwrap();
        let rpi4 = devices.get("rpi4").unwrap();
        assert_eq!(rpi4.cores, 4);
        assert_eq!(rpi4.single_core_score, 187.0);
        assert!(devices.get("rpi9").unwrap_err().is_not_found());

        let net = repo.network_catalog(NETWORK_CATALOG_FILE).unwrap();
        assert!(net.has_profile("low"));
        let conns: Vec<_> = net
            .connection_sets("low")
            .unwrap()
            .into_iter()
            .map(|(c, _)| c)
            .collect();
        assert_eq!(conns, vec!["4g_lte", "3g_hspa"]);
    }

    #[test]
    fn test_flat_profile_is_single_connection_set() {
        let net = NetworkCatalog::from_value(json!({
            "lab": {
                "delay_ms": {"typical": 5.0},
                "band_mbps": {"typical": 100.0}
            }
        }))
        .unwrap();
        let sets = net.connection_sets("lab").unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].0, "lab");
        let lab = net.connection_set("lab", "lab").unwrap();
        assert!(lab.contains_key("band_mbps"));
        assert!(net.connection_set("lab", "wifi").unwrap_err().is_not_found());
    }

    #[test]
    fn test_device_spec_field_access() {
        let mut spec = DeviceSpec {
            cores: 4,
            ram_gib: 2.0,
            freq_mhz: 1500.0,
            single_core_score: 300.0,
        };
        assert_eq!(spec.get("freq_mhz"), Some(1500.0));
        assert_eq!(spec.get("gpu"), None);
        assert!(spec.set("cores", 5.6));
        assert_eq!(spec.cores, 6);
        assert!(!spec.set("gpu", 1.0));
        assert_eq!(spec.ram_bytes(), 2 * 1024 * 1024 * 1024);
    }
}
