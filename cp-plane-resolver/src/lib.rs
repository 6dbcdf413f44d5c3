//! Loads `<HO3>/config/control_plane_chain.json` and resolves a directory
//! to the enclosing plane context, enforcing the tier reference direction.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use cp_types::{Tier, TypeError};

pub const CHAIN_CONFIG_RELATIVE_PATH: &str = "config/control_plane_chain.json";

#[derive(Debug, thiserror::Error)]
pub enum PlaneResolverError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed chain config at {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    InvalidTier(#[from] TypeError),
    #[error("no plane declared in chain config for type {0}")]
    PlaneNotDeclared(String),
    #[error("path {0} is not under any declared plane root")]
    NoEnclosingPlane(PathBuf),
}

#[derive(Debug, Clone, Deserialize)]
struct RawPlaneEntry {
    name: String,
    #[serde(rename = "type")]
    plane_type: String,
    root: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawChainConfig {
    planes: Vec<RawPlaneEntry>,
}

/// A resolved plane: its declared identity plus the fixed directory
/// taxonomy every plane root exposes.
#[derive(Debug, Clone, Serialize)]
pub struct PlaneContext {
    pub name: String,
    pub plane_type: Tier,
    pub root: PathBuf,
    pub pristine_roots: Vec<String>,
    pub derived_roots: Vec<String>,
    pub ledger_path: PathBuf,
    pub installed_dir: PathBuf,
    pub receipts_dir: PathBuf,
}

impl PlaneContext {
    fn from_raw(entry: &RawPlaneEntry) -> Result<Self, PlaneResolverError> {
        let root = PathBuf::from(&entry.root);
        Ok(Self {
            name: entry.name.clone(),
            plane_type: Tier::parse(&entry.plane_type)?,
            pristine_roots: vec!["HOT/kernel".to_string(), "HOT/scripts".to_string()],
            derived_roots: vec!["registries".to_string(), "packages_store".to_string(), "tmp".to_string(), "_staging".to_string(), "installed".to_string()],
            ledger_path: root.join("ledger"),
            installed_dir: root.join("installed"),
            receipts_dir: root.join("installed"),
            root,
        })
    }
}

/// Ordered, cached parse of the chain config.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub planes: Vec<PlaneContext>,
}

impl ChainConfig {
    pub fn load(ho3_root: &Path) -> Result<Self, PlaneResolverError> {
        let path = ho3_root.join(CHAIN_CONFIG_RELATIVE_PATH);
        let content = fs::read_to_string(&path).map_err(|e| PlaneResolverError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let raw: RawChainConfig = serde_json::from_str(&content).map_err(|e| PlaneResolverError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
        let planes = raw.planes.iter().map(PlaneContext::from_raw).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { planes })
    }

    pub fn plane_by_type(&self, tier: Tier) -> Option<&PlaneContext> {
        self.planes.iter().find(|p| p.plane_type == tier)
    }

    pub fn plane_by_name(&self, name: &str) -> Option<&PlaneContext> {
        self.planes.iter().find(|p| p.name == name)
    }

    /// Walk `path` upward to find the declared plane root it lives under.
    pub fn get_current_plane(&self, path: &Path) -> Option<&PlaneContext> {
        let mut best: Option<&PlaneContext> = None;
        for plane in &self.planes {
            if path.starts_with(&plane.root) {
                match best {
                    Some(b) if b.root.as_os_str().len() >= plane.root.as_os_str().len() => {}
                    _ => best = Some(plane),
                }
            }
        }
        best
    }
}

static CACHE: Lazy<RwLock<HashMap<PathBuf, ChainConfig>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Cached load keyed by `ho3_root`; callers that mutate the chain config on
/// disk mid-process should use [`ChainConfig::load`] directly instead.
pub fn cached_chain_config(ho3_root: &Path) -> Result<ChainConfig, PlaneResolverError> {
    if let Some(cached) = CACHE.read().unwrap().get(ho3_root) {
        return Ok(cached.clone());
    }
    let config = ChainConfig::load(ho3_root)?;
    CACHE.write().unwrap().insert(ho3_root.to_path_buf(), config.clone());
    Ok(config)
}

/// `declared ∈ {"any", current.name}`.
pub fn validate_target_plane(declared: &str, current: &PlaneContext) -> bool {
    declared == "any" || declared == current.name
}

/// A plane may reference the same tier or any higher-privilege tier's
/// interfaces; HO3 may reference nothing below it.
pub fn validate_external_interface_direction(current_plane: Tier, source_plane: Tier) -> bool {
    source_plane >= current_plane
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path) {
        let config_dir = dir.join("config");
        fs::create_dir_all(&config_dir).unwrap();
        let json = serde_json::json!({
            "planes": [
                {"name": "ho3", "type": "HO3", "root": dir.join("ho3").to_string_lossy()},
                {"name": "ho2", "type": "HO2", "root": dir.join("ho2").to_string_lossy()},
                {"name": "ho1", "type": "HO1", "root": dir.join("ho1").to_string_lossy()},
            ]
        });
        fs::write(config_dir.join("control_plane_chain.json"), serde_json::to_string_pretty(&json).unwrap()).unwrap();
    }

    #[test]
    fn loads_ordered_planes() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path());
        let config = ChainConfig::load(dir.path()).unwrap();
        assert_eq!(config.planes.len(), 3);
        assert_eq!(config.planes[0].plane_type, Tier::HO3);
    }

    #[test]
    fn get_current_plane_resolves_nested_path() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path());
        let config = ChainConfig::load(dir.path()).unwrap();
        let nested = dir.path().join("ho2").join("work_orders").join("WO-1");
        let plane = config.get_current_plane(&nested).unwrap();
        assert_eq!(plane.name, "ho2");
    }

    #[test]
    fn target_plane_validation() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path());
        let config = ChainConfig::load(dir.path()).unwrap();
        let ho2 = config.plane_by_name("ho2").unwrap();
        assert!(validate_target_plane("any", ho2));
        assert!(validate_target_plane("ho2", ho2));
        assert!(!validate_target_plane("ho1", ho2));
    }

    #[test]
    fn external_interface_direction_blocks_downward_reference() {
        assert!(validate_external_interface_direction(Tier::HO2, Tier::HO3));
        assert!(validate_external_interface_direction(Tier::HO2, Tier::HO2));
        assert!(!validate_external_interface_direction(Tier::HO2, Tier::HO1));
        assert!(!validate_external_interface_direction(Tier::HO3, Tier::HO2));
    }
}
