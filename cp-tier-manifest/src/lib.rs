//! `tier.json`: the on-disk descriptor that makes a filesystem root a plane.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cp_types::Tier;

pub const MANIFEST_FILE_NAME: &str = "tier.json";

#[derive(Debug, thiserror::Error)]
pub enum TierManifestError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed tier.json at {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid tier value: {0}")]
    InvalidTier(#[from] cp_types::TypeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Active,
    Archived,
    Closed,
}

/// Raw, serde-facing representation. `tier` accepts legacy aliases on read
/// (via [`Tier::parse`]) and is always normalized to canonical on write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierManifest {
    pub tier: String,
    pub ledger_path: String,
    #[serde(default)]
    pub parent_ledger: Option<String>,
    #[serde(default)]
    pub work_order_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
}

impl TierManifest {
    pub fn new(tier: Tier, ledger_path: impl Into<String>, parent_ledger: Option<String>) -> Self {
        Self {
            tier: tier.as_str().to_string(),
            ledger_path: ledger_path.into(),
            parent_ledger,
            work_order_id: None,
            session_id: None,
            status: InstanceStatus::Active,
            created_at: Utc::now(),
        }
    }

    pub fn tier(&self) -> Result<Tier, TierManifestError> {
        Ok(Tier::parse(&self.tier)?)
    }

    /// Load from `<plane_root>/tier.json`, normalizing legacy tier aliases.
    pub fn load(plane_root: &Path) -> Result<Self, TierManifestError> {
        let path = plane_root.join(MANIFEST_FILE_NAME);
        let content = fs::read_to_string(&path).map_err(|e| TierManifestError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut manifest: TierManifest = serde_json::from_str(&content).map_err(|e| TierManifestError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
        let normalized = manifest.tier()?;
        manifest.tier = normalized.as_str().to_string();
        Ok(manifest)
    }

    /// Write to `<plane_root>/tier.json`, normalizing the tier field first.
    pub fn save(&self, plane_root: &Path) -> Result<(), TierManifestError> {
        let mut normalized = self.clone();
        normalized.tier = self.tier()?.as_str().to_string();
        let path = plane_root.join(MANIFEST_FILE_NAME);
        let content = serde_json::to_string_pretty(&normalized).map_err(|e| TierManifestError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
        fs::write(&path, content).map_err(|e| TierManifestError::Io {
            path: path.display().to_string(),
            source: e,
        })
    }

    pub fn absolute_ledger_path(&self, plane_root: &Path) -> PathBuf {
        plane_root.join(&self.ledger_path)
    }
}

/// Walk `p` upward until a directory bearing `tier.json` is found.
pub fn find_for_path(p: &Path) -> Option<(PathBuf, TierManifest)> {
    let mut current = if p.is_dir() { Some(p.to_path_buf()) } else { p.parent().map(Path::to_path_buf) };
    while let Some(dir) = current {
        let candidate = dir.join(MANIFEST_FILE_NAME);
        if candidate.is_file() {
            if let Ok(manifest) = TierManifest::load(&dir) {
                return Some((dir, manifest));
            }
        }
        current = dir.parent().map(Path::to_path_buf);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_and_normalizes_legacy_alias() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = TierManifest {
            tier: "HOT".to_string(),
            ledger_path: "ledger/governance.jsonl".to_string(),
            parent_ledger: None,
            work_order_id: None,
            session_id: None,
            status: InstanceStatus::Active,
            created_at: Utc::now(),
        };
        manifest.save(dir.path()).unwrap();
        let loaded = TierManifest::load(dir.path()).unwrap();
        assert_eq!(loaded.tier, "HO3");
        assert_eq!(loaded.tier().unwrap(), Tier::HO3);
    }

    #[test]
    fn absolute_ledger_path_joins_plane_root() {
        let m = TierManifest::new(Tier::HO2, "ledger/workorder.jsonl", None);
        let root = Path::new("/t/ho2");
        assert_eq!(m.absolute_ledger_path(root), root.join("ledger/workorder.jsonl"));
    }

    #[test]
    fn find_for_path_walks_upward() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        fs::create_dir_all(&nested).unwrap();
        let manifest = TierManifest::new(Tier::HO1, "ledger/session.jsonl", None);
        manifest.save(dir.path()).unwrap();

        let found = find_for_path(&nested);
        assert!(found.is_some());
        let (root, _) = found.unwrap();
        assert_eq!(root, dir.path());
    }

    #[test]
    fn find_for_path_returns_none_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_for_path(dir.path()).is_none());
    }
}
