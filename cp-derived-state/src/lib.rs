//! Reconstructs `file_ownership.csv` and `packages_state.csv` from the
//! package-lifecycle ledger (`PACKAGE_LIFECYCLE` events, decision
//! `INSTALLED`/`UNINSTALLED`) plus each installed package's manifest.
//!
//! Every ownership conflict is recorded; if any are found the rebuild is
//! refused wholesale (no partial, half-conflicting output) and the caller
//! gets a distinct error so a CLI can map it to exit code 2, not 1.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use cp_ledger_engine::{LedgerClient, LedgerEntry};
use cp_registry_store::DerivedRegistry;
use cp_types::{FileOwnershipRow, Manifest, PackagesStateRow};

pub const PACKAGE_LIFECYCLE_EVENT_TYPE: &str = "PACKAGE_LIFECYCLE";
pub const DECISION_INSTALLED: &str = "INSTALLED";
pub const DECISION_UNINSTALLED: &str = "UNINSTALLED";

#[derive(Debug, thiserror::Error)]
pub enum DerivedStateError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Ledger(#[from] cp_ledger_engine::LedgerError),
    #[error(transparent)]
    Registry(#[from] cp_registry_store::RegistryError),
    #[error("ownership conflicts detected during rebuild")]
    Conflicts(Vec<String>),
}

fn io_err(path: &Path, source: io::Error) -> DerivedStateError {
    DerivedStateError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn date_part(timestamp: &str) -> String {
    timestamp.split('T').next().unwrap_or(timestamp).to_string()
}

fn load_manifest(plane_root: &Path, package_id: &str) -> Result<Manifest, DerivedStateError> {
    let path = plane_root.join("installed").join(package_id).join("manifest.json");
    let content = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    serde_json::from_str(&content).map_err(|e| io_err(&path, io::Error::new(io::ErrorKind::InvalidData, e)))
}

struct Builder {
    rows: Vec<FileOwnershipRow>,
    active: HashMap<String, usize>,
    conflicts: Vec<String>,
}

impl Builder {
    fn new() -> Self {
        Self {
            rows: Vec::new(),
            active: HashMap::new(),
            conflicts: Vec::new(),
        }
    }

    fn install(&mut self, package_id: &str, manifest: &Manifest, installed_date: &str) {
        for asset in &manifest.assets {
            match self.active.get(&asset.path).copied() {
                None => {
                    let idx = self.rows.len();
                    self.rows.push(FileOwnershipRow {
                        file_path: asset.path.clone(),
                        owner_package_id: package_id.to_string(),
                        sha256: asset.sha256.clone(),
                        classification: asset.classification.clone(),
                        installed_date: installed_date.to_string(),
                        replaced_date: String::new(),
                        superseded_by: String::new(),
                    });
                    self.active.insert(asset.path.clone(), idx);
                }
                Some(idx) if self.rows[idx].owner_package_id == package_id => {
                    // Idempotent re-install by the same owner: refresh the hash/date in place.
                    self.rows[idx].sha256 = asset.sha256.clone();
                    self.rows[idx].installed_date = installed_date.to_string();
                }
                Some(idx) => {
                    let current_owner = self.rows[idx].owner_package_id.clone();
                    if manifest.dependencies.iter().any(|d| d == &current_owner) {
                        self.rows[idx].replaced_date = installed_date.to_string();
                        self.rows[idx].superseded_by = package_id.to_string();
                        let new_idx = self.rows.len();
                        self.rows.push(FileOwnershipRow {
                            file_path: asset.path.clone(),
                            owner_package_id: package_id.to_string(),
                            sha256: asset.sha256.clone(),
                            classification: asset.classification.clone(),
                            installed_date: installed_date.to_string(),
                            replaced_date: String::new(),
                            superseded_by: String::new(),
                        });
                        self.active.insert(asset.path.clone(), new_idx);
                    } else {
                        self.conflicts.push(format!("OWNERSHIP_CONFLICT: {} claimed by {package_id}, owned by {current_owner}", asset.path));
                    }
                }
            }
        }
    }

    fn uninstall(&mut self, package_id: &str) {
        let to_drop: Vec<String> = self
            .active
            .iter()
            .filter(|(_, &idx)| self.rows[idx].owner_package_id == package_id)
            .map(|(path, _)| path.clone())
            .collect();
        for path in to_drop {
            if let Some(idx) = self.active.remove(&path) {
                self.rows[idx].owner_package_id = String::new();
            }
        }
        self.rows.retain(|r| !r.owner_package_id.is_empty());
        self.active = self.rows.iter().enumerate().filter(|(_, r)| r.superseded_by.is_empty()).map(|(i, r)| (r.file_path.clone(), i)).collect();
    }
}

pub struct RebuildOutcome {
    pub file_ownership: Vec<FileOwnershipRow>,
    pub packages_state: Vec<PackagesStateRow>,
}

/// Rebuild both derived registries for `plane_root`, reading lifecycle
/// events from `ledger` in chronological (append) order.
pub fn rebuild(plane_root: &Path, ledger: &LedgerClient) -> Result<RebuildOutcome, DerivedStateError> {
    let entries: Vec<LedgerEntry> = ledger.read_by_event_type(PACKAGE_LIFECYCLE_EVENT_TYPE)?;

    let mut builder = Builder::new();
    let mut states: HashMap<String, PackagesStateRow> = HashMap::new();

    for entry in &entries {
        let package_id = entry.submission_id.clone();
        let version = entry.metadata.get("version").and_then(|v| v.as_str()).unwrap_or("0.0.0").to_string();
        let date = date_part(&entry.timestamp);

        match entry.decision.as_str() {
            DECISION_INSTALLED => {
                let manifest = load_manifest(plane_root, &package_id)?;
                builder.install(&package_id, &manifest, &date);
                states.insert(
                    package_id.clone(),
                    PackagesStateRow {
                        package_id: package_id.clone(),
                        version,
                        state: DECISION_INSTALLED.to_string(),
                        installed_date: date.clone(),
                        uninstalled_date: String::new(),
                    },
                );
            }
            DECISION_UNINSTALLED => {
                builder.uninstall(&package_id);
                let installed_date = states.get(&package_id).map(|s| s.installed_date.clone()).unwrap_or_default();
                states.insert(
                    package_id.clone(),
                    PackagesStateRow {
                        package_id: package_id.clone(),
                        version,
                        state: DECISION_UNINSTALLED.to_string(),
                        installed_date,
                        uninstalled_date: date,
                    },
                );
            }
            other => {
                tracing::warn!(decision = other, "unrecognized PACKAGE_LIFECYCLE decision, ignoring");
            }
        }
    }

    if !builder.conflicts.is_empty() {
        return Err(DerivedStateError::Conflicts(builder.conflicts));
    }

    Ok(RebuildOutcome {
        file_ownership: builder.rows,
        packages_state: states.into_values().collect(),
    })
}

/// Rebuild and persist both registries through [`DerivedRegistry`].
pub fn rebuild_and_write(plane_root: &Path, ledger: &LedgerClient, governed_roots: &[String]) -> Result<RebuildOutcome, DerivedStateError> {
    let outcome = rebuild(plane_root, ledger)?;
    let registry = DerivedRegistry::new(plane_root);
    registry.write_file_ownership(governed_roots, outcome.file_ownership.clone())?;
    registry.write_packages_state(governed_roots, outcome.packages_state.clone())?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cp_ledger_engine::{LedgerOptions, NewEntry};
    use cp_types::Asset;
    use serde_json::Map;

    fn write_manifest(plane_root: &Path, package_id: &str, assets: Vec<Asset>, dependencies: Vec<String>) {
        let dir = plane_root.join("installed").join(package_id);
        fs::create_dir_all(&dir).unwrap();
        let manifest = Manifest {
            package_id: package_id.to_string(),
            schema_version: "1.0.0".into(),
            version: "0.1.0".into(),
            spec_id: "SPEC-1".into(),
            plane_id: "ho2".into(),
            package_type: "library".into(),
            assets,
            dependencies,
            framework_id: None,
            target_plane: None,
            external_interfaces: vec![],
            metadata: Default::default(),
        };
        fs::write(dir.join("manifest.json"), serde_json::to_string_pretty(&manifest).unwrap()).unwrap();
    }

    fn lifecycle_entry(package_id: &str, decision: &str, version: &str) -> NewEntry {
        let mut metadata = Map::new();
        metadata.insert("version".into(), serde_json::Value::String(version.to_string()));
        NewEntry::new(PACKAGE_LIFECYCLE_EVENT_TYPE, package_id, decision, "lifecycle event").with_metadata(metadata)
    }

    #[test]
    fn fresh_install_assigns_ownership() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "PKG-A",
            vec![Asset {
                path: "lib/a.py".into(),
                sha256: "sha256:".to_string() + &"0".repeat(64),
                classification: "PRISTINE".into(),
            }],
            vec![],
        );
        let mut ledger = LedgerClient::open(&dir.path().join("ledger/packages.jsonl"), None, LedgerOptions::default()).unwrap();
        ledger.write(lifecycle_entry("PKG-A", DECISION_INSTALLED, "0.1.0")).unwrap();
        ledger.flush().unwrap();

        let outcome = rebuild(dir.path(), &ledger).unwrap();
        assert_eq!(outcome.file_ownership.len(), 1);
        assert_eq!(outcome.file_ownership[0].owner_package_id, "PKG-A");
        assert_eq!(outcome.packages_state[0].state, "INSTALLED");
    }

    #[test]
    fn conflicting_second_owner_is_reported_and_rebuild_refused() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "PKG-A",
            vec![Asset {
                path: "lib/x.py".into(),
                sha256: "sha256:".to_string() + &"0".repeat(64),
                classification: "PRISTINE".into(),
            }],
            vec![],
        );
        write_manifest(
            dir.path(),
            "PKG-B",
            vec![Asset {
                path: "lib/x.py".into(),
                sha256: "sha256:".to_string() + &"1".repeat(64),
                classification: "PRISTINE".into(),
            }],
            vec![],
        );
        let mut ledger = LedgerClient::open(&dir.path().join("ledger/packages.jsonl"), None, LedgerOptions::default()).unwrap();
        ledger.write(lifecycle_entry("PKG-A", DECISION_INSTALLED, "0.1.0")).unwrap();
        ledger.write(lifecycle_entry("PKG-B", DECISION_INSTALLED, "0.1.0")).unwrap();
        ledger.flush().unwrap();

        let err = rebuild(dir.path(), &ledger).unwrap_err();
        match err {
            DerivedStateError::Conflicts(conflicts) => assert!(conflicts[0].contains("PKG-A")),
            other => panic!("expected conflicts, got {other:?}"),
        }
    }

    #[test]
    fn transfer_to_declared_dependency_supersedes_without_conflict() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "PKG-A",
            vec![Asset {
                path: "lib/x.py".into(),
                sha256: "sha256:".to_string() + &"0".repeat(64),
                classification: "PRISTINE".into(),
            }],
            vec![],
        );
        write_manifest(
            dir.path(),
            "PKG-B",
            vec![Asset {
                path: "lib/x.py".into(),
                sha256: "sha256:".to_string() + &"1".repeat(64),
                classification: "PRISTINE".into(),
            }],
            vec!["PKG-A".to_string()],
        );
        let mut ledger = LedgerClient::open(&dir.path().join("ledger/packages.jsonl"), None, LedgerOptions::default()).unwrap();
        ledger.write(lifecycle_entry("PKG-A", DECISION_INSTALLED, "0.1.0")).unwrap();
        ledger.write(lifecycle_entry("PKG-B", DECISION_INSTALLED, "0.1.0")).unwrap();
        ledger.flush().unwrap();

        let outcome = rebuild(dir.path(), &ledger).unwrap();
        assert_eq!(outcome.file_ownership.len(), 2);
        let old = outcome.file_ownership.iter().find(|r| r.owner_package_id == "PKG-A").unwrap();
        assert!(!old.superseded_by.is_empty());
        let current = outcome.file_ownership.iter().find(|r| r.owner_package_id == "PKG-B").unwrap();
        assert!(current.superseded_by.is_empty());
    }

    #[test]
    fn uninstall_drops_ownership_rows() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "PKG-A",
            vec![Asset {
                path: "lib/a.py".into(),
                sha256: "sha256:".to_string() + &"0".repeat(64),
                classification: "PRISTINE".into(),
            }],
            vec![],
        );
        let mut ledger = LedgerClient::open(&dir.path().join("ledger/packages.jsonl"), None, LedgerOptions::default()).unwrap();
        ledger.write(lifecycle_entry("PKG-A", DECISION_INSTALLED, "0.1.0")).unwrap();
        ledger.write(lifecycle_entry("PKG-A", DECISION_UNINSTALLED, "0.1.0")).unwrap();
        ledger.flush().unwrap();

        let outcome = rebuild(dir.path(), &ledger).unwrap();
        assert!(outcome.file_ownership.is_empty());
        assert_eq!(outcome.packages_state[0].state, "UNINSTALLED");
    }
}
