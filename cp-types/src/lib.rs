//! Shared domain types for the control plane: tiers, ids, manifests,
//! receipts, and derived-registry rows. No behavior beyond construction,
//! validation, and (de)serialization lives here — every crate in this
//! workspace depends on this one so it has to stay inert.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use cp_hasher::{hash_string, is_valid_hash, Hash, HashError};

#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    #[error("invalid package id {0:?}: must match PKG-[A-Z0-9-]+")]
    InvalidPackageId(String),
    #[error("invalid tier {0:?}: must be one of HO3, HO2, HO1")]
    InvalidTier(String),
    #[error("invalid plane id {0:?}: must be one of ho1, ho2, ho3")]
    InvalidPlaneId(String),
    #[error("invalid hash: {0}")]
    InvalidHash(#[from] HashError),
}

/// One of the three fixed privilege tiers. `Ord` reflects privilege, so
/// `Tier::HO3 > Tier::HO2 > Tier::HO1` is a real, meaningful comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    HO1,
    HO2,
    HO3,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::HO3 => "HO3",
            Tier::HO2 => "HO2",
            Tier::HO1 => "HO1",
        }
    }

    /// Accepts canonical names plus a legacy alias table, always returning canonical.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        match s.trim().to_uppercase().as_str() {
            "HO3" | "HOT" => Ok(Tier::HO3),
            "HO2" => Ok(Tier::HO2),
            "HO1" => Ok(Tier::HO1),
            other => Err(TypeError::InvalidTier(other.to_string())),
        }
    }

    /// The lowercase `plane_id` form used in package manifests (`ho1`/`ho2`/`ho3`).
    pub fn parse_plane_id(s: &str) -> Result<Self, TypeError> {
        match s.trim().to_lowercase().as_str() {
            "ho3" => Ok(Tier::HO3),
            "ho2" => Ok(Tier::HO2),
            "ho1" => Ok(Tier::HO1),
            other => Err(TypeError::InvalidPlaneId(other.to_string())),
        }
    }

    pub fn plane_id(&self) -> &'static str {
        match self {
            Tier::HO3 => "ho3",
            Tier::HO2 => "ho2",
            Tier::HO1 => "ho1",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate a `PKG-[A-Z0-9-]+` identifier.
pub fn is_valid_package_id(s: &str) -> bool {
    match s.strip_prefix("PKG-") {
        Some(rest) => !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'-'),
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageId(String);

impl PackageId {
    pub fn parse(s: impl Into<String>) -> Result<Self, TypeError> {
        let s = s.into();
        if !is_valid_package_id(&s) {
            return Err(TypeError::InvalidPackageId(s));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PackageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Path classification as returned by the path classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathClass {
    Pristine,
    Derived,
    AppendOnly,
    External,
}

impl std::fmt::Display for PathClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PathClass::Pristine => "PRISTINE",
            PathClass::Derived => "DERIVED",
            PathClass::AppendOnly => "APPEND_ONLY",
            PathClass::External => "EXTERNAL",
        };
        f.write_str(s)
    }
}

/// One declared file in a package manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub path: String,
    pub sha256: String,
    pub classification: String,
}

/// An external-interface reference a package declares it consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalInterface {
    pub name: String,
    pub source_plane: String,
}

/// The author-declared package manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub package_id: String,
    pub schema_version: String,
    pub version: String,
    pub spec_id: String,
    pub plane_id: String,
    pub package_type: String,
    pub assets: Vec<Asset>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub framework_id: Option<String>,
    #[serde(default)]
    pub target_plane: Option<String>,
    #[serde(default)]
    pub external_interfaces: Vec<ExternalInterface>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// One `{path, sha256}` entry recorded in an install receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptFile {
    pub path: String,
    pub sha256: String,
}

/// `installed/<PKG-ID>/receipt.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallReceipt {
    pub id: String,
    pub version: String,
    pub installed_at: DateTime<Utc>,
    pub plane_root: String,
    pub archive_digest: String,
    pub files: Vec<ReceiptFile>,
    pub factory_version: String,
    #[serde(default)]
    pub tainted: bool,
    #[serde(default)]
    pub taint_reason: Option<String>,
    #[serde(default)]
    pub tainted_at: Option<DateTime<Utc>>,
}

/// One row of `registries/file_ownership.csv`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileOwnershipRow {
    pub file_path: String,
    pub owner_package_id: String,
    pub sha256: String,
    pub classification: String,
    pub installed_date: String,
    pub replaced_date: String,
    pub superseded_by: String,
}

/// One row of `registries/packages_state.csv`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackagesStateRow {
    pub package_id: String,
    pub version: String,
    pub state: String,
    pub installed_date: String,
    pub uninstalled_date: String,
}

/// A row of `registries/frameworks_registry.csv` or `specs_registry.csv`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameworkRow {
    pub framework_id: String,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpecRow {
    pub spec_id: String,
    pub framework_id: String,
    pub name: String,
    pub version: String,
}

/// A row of `registries/packages_registry.csv`, maintained by the Package
/// Factory's G6 gate rather than hand-curated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageRegistryRow {
    pub package_id: String,
    pub version: String,
    pub archive_digest: String,
    pub registered_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_ordering_reflects_privilege() {
        assert!(Tier::HO3 > Tier::HO2);
        assert!(Tier::HO2 > Tier::HO1);
    }

    #[test]
    fn tier_parse_accepts_legacy_hot_alias() {
        assert_eq!(Tier::parse("HOT").unwrap(), Tier::HO3);
        assert_eq!(Tier::parse("ho2").unwrap(), Tier::HO2);
    }

    #[test]
    fn package_id_validation() {
        assert!(PackageId::parse("PKG-ABC-001").is_ok());
        assert!(PackageId::parse("pkg-abc").is_err());
        assert!(PackageId::parse("PKG-").is_err());
        assert!(PackageId::parse("NOTPKG-1").is_err());
    }

    #[test]
    fn manifest_round_trips_through_json() {
        let m = Manifest {
            package_id: "PKG-A".into(),
            schema_version: "1".into(),
            version: "0.1.0".into(),
            spec_id: "SPEC-1".into(),
            plane_id: "ho2".into(),
            package_type: "library".into(),
            assets: vec![Asset {
                path: "lib/a.py".into(),
                sha256: hash_string("x").to_string(),
                classification: "PRISTINE".into(),
            }],
            dependencies: vec![],
            framework_id: None,
            target_plane: None,
            external_interfaces: vec![],
            metadata: HashMap::new(),
        };
        let json = serde_json::to_string(&m).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.package_id, m.package_id);
        assert_eq!(back.assets.len(), 1);
    }
}
