//! Read-only query surface over ledgers, registries, and installed
//! manifests. Every function returns its answer paired with an
//! [`EvidencePointer`] so a downstream reader can re-hash the pointed
//! artifact and confirm it saw the same bytes. Nothing in this crate
//! writes anything.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

use cp_hasher::{hash_file, hash_string};
use cp_ledger_engine::{LedgerClient, LedgerEntry};
use cp_path_classifier::{classify, Classification};
use cp_registry_store::{CuratedRegistry, DerivedRegistry, RegistryError};
use cp_types::{InstallReceipt, Manifest};

#[derive(Debug, thiserror::Error)]
pub enum InspectorError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed json at {0}")]
    MalformedJson(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Ledger(#[from] cp_ledger_engine::LedgerError),
}

fn io_err(path: &Path, source: io::Error) -> InspectorError {
    InspectorError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EvidenceSource {
    Ledger,
    File,
    Registry,
}

/// Proof of where an answer came from: a reader can re-hash `path` (or the
/// `range` within a ledger) and confirm it matches `hash`.
#[derive(Debug, Clone, Serialize)]
pub struct EvidencePointer {
    pub source: EvidenceSource,
    pub path: String,
    pub range: Option<(u64, u64)>,
    pub hash: String,
    pub timestamp: String,
}

fn file_pointer(path: &Path) -> Result<EvidencePointer, InspectorError> {
    let hash = hash_file(path).map_err(|_| io_err(path, io::Error::new(io::ErrorKind::NotFound, "could not hash file")))?;
    Ok(EvidencePointer {
        source: EvidenceSource::File,
        path: path.display().to_string(),
        range: None,
        hash: hash.to_string(),
        timestamp: now_rfc3339(),
    })
}

fn ledger_pointer(ledger_path: &Path, range: Option<(u64, u64)>, last_entry_hash: &str, timestamp: &str) -> EvidencePointer {
    EvidencePointer {
        source: EvidenceSource::Ledger,
        path: ledger_path.display().to_string(),
        range,
        hash: last_entry_hash.to_string(),
        timestamp: timestamp.to_string(),
    }
}

fn registry_pointer(path: &Path, content_hash: &str) -> EvidencePointer {
    EvidencePointer {
        source: EvidenceSource::Registry,
        path: path.display().to_string(),
        range: None,
        hash: content_hash.to_string(),
        timestamp: now_rfc3339(),
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Every installed package's receipt on this plane.
pub fn list_installed(plane_root: &Path) -> Result<Vec<(InstallReceipt, EvidencePointer)>, InspectorError> {
    let installed_dir = plane_root.join("installed");
    if !installed_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut package_ids: Vec<String> = fs::read_dir(&installed_dir)
        .map_err(|e| io_err(&installed_dir, e))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
        .collect();
    package_ids.sort();

    let mut results = Vec::new();
    for package_id in package_ids {
        let receipt_path = installed_dir.join(&package_id).join("receipt.json");
        if !receipt_path.is_file() {
            continue;
        }
        let content = fs::read_to_string(&receipt_path).map_err(|e| io_err(&receipt_path, e))?;
        let receipt: InstallReceipt = serde_json::from_str(&content).map_err(|_| InspectorError::MalformedJson(receipt_path.display().to_string()))?;
        let pointer = file_pointer(&receipt_path)?;
        results.push((receipt, pointer));
    }
    Ok(results)
}

/// The most recent `limit` ledger entries whose `decision` reads as a gate
/// failure (`FAILED`, `DENIED`, `REJECTED`).
pub fn last_gate_failures(ledger: &LedgerClient, ledger_path: &Path, limit: usize) -> Result<Vec<(LedgerEntry, EvidencePointer)>, InspectorError> {
    const FAILURE_DECISIONS: &[&str] = &["FAILED", "DENIED", "REJECTED"];
    let all = ledger.read_all()?;
    let failures: Vec<LedgerEntry> = all.into_iter().filter(|e| FAILURE_DECISIONS.contains(&e.decision.as_str())).collect();
    let start = failures.len().saturating_sub(limit);
    Ok(failures[start..]
        .iter()
        .cloned()
        .map(|entry| {
            let pointer = ledger_pointer(ledger_path, None, &entry.entry_hash, &entry.timestamp);
            (entry, pointer)
        })
        .collect())
}

/// Full ordered replay of one session's ledger, for a downstream agent to
/// reconstruct exactly what an HO1 session saw and did.
pub fn replay_ho1(session_ledger: &LedgerClient, session_ledger_path: &Path) -> Result<(Vec<LedgerEntry>, EvidencePointer), InspectorError> {
    let entries = session_ledger.read_all()?;
    let last_hash = entries.last().map(|e| e.entry_hash.clone()).unwrap_or_default();
    let last_timestamp = entries.last().map(|e| e.timestamp.clone()).unwrap_or_else(now_rfc3339);
    let pointer = ledger_pointer(session_ledger_path, Some((0, entries.len() as u64)), &last_hash, &last_timestamp);
    Ok((entries, pointer))
}

/// Classify a candidate path against the plane's directory taxonomy.
pub fn explain_path(plane_root: &Path, governed_roots: &[String], candidate: &Path) -> (Classification, EvidencePointer) {
    let classification = classify(plane_root, governed_roots, candidate);
    let pointer = EvidencePointer {
        source: EvidenceSource::File,
        path: candidate.display().to_string(),
        range: None,
        hash: hash_string(&classification.explanation).to_string(),
        timestamp: now_rfc3339(),
    };
    (classification, pointer)
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub frameworks_count: usize,
    pub specs_count: usize,
    pub file_ownership_count: usize,
    pub packages_state_count: usize,
    pub packages_registry_count: usize,
}

/// Row counts across every registry on this plane.
pub fn get_registry_stats(plane_root: &Path, curated: &CuratedRegistry, derived: &DerivedRegistry) -> Result<(RegistryStats, EvidencePointer), InspectorError> {
    let stats = RegistryStats {
        frameworks_count: curated.frameworks()?.len(),
        specs_count: curated.specs()?.len(),
        file_ownership_count: derived.file_ownership()?.len(),
        packages_state_count: derived.packages_state()?.len(),
        packages_registry_count: derived.packages_registry()?.len(),
    };
    let content_hash = hash_string(&serde_json::to_string(&stats).expect("stats serialize"));
    let pointer = registry_pointer(&plane_root.join("registries"), content_hash.as_str());
    Ok((stats, pointer))
}

/// Verify the full hash chain and report whether it holds.
pub fn get_governance_chain(ledger: &LedgerClient, ledger_path: &Path) -> Result<((bool, Vec<String>), EvidencePointer), InspectorError> {
    let (ok, issues) = ledger.verify_chain();
    let entries = ledger.read_all()?;
    let last_hash = entries.last().map(|e| e.entry_hash.clone()).unwrap_or_default();
    let last_timestamp = entries.last().map(|e| e.timestamp.clone()).unwrap_or_else(now_rfc3339);
    let pointer = ledger_pointer(ledger_path, Some((0, entries.len() as u64)), &last_hash, &last_timestamp);
    Ok(((ok, issues), pointer))
}

/// The manifest an installed package declared at install time.
pub fn get_manifest_requirements(plane_root: &Path, package_id: &str) -> Result<(Manifest, EvidencePointer), InspectorError> {
    let manifest_path = plane_root.join("installed").join(package_id).join("manifest.json");
    let content = fs::read_to_string(&manifest_path).map_err(|e| io_err(&manifest_path, e))?;
    let manifest: Manifest = serde_json::from_str(&content).map_err(|_| InspectorError::MalformedJson(manifest_path.display().to_string()))?;
    let pointer = file_pointer(&manifest_path)?;
    Ok((manifest, pointer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cp_ledger_engine::NewEntry;
    use cp_types::ReceiptFile;
    use std::collections::HashMap;

    fn write_receipt(plane_root: &Path, package_id: &str) {
        let dir = plane_root.join("installed").join(package_id);
        fs::create_dir_all(&dir).unwrap();
        let receipt = InstallReceipt {
            id: package_id.to_string(),
            version: "0.1.0".into(),
            installed_at: chrono::Utc::now(),
            plane_root: plane_root.display().to_string(),
            archive_digest: "sha256:".to_string() + &"0".repeat(64),
            files: vec![ReceiptFile {
                path: "a.txt".into(),
                sha256: "sha256:".to_string() + &"1".repeat(64),
            }],
            factory_version: "0.1.0".into(),
            tainted: false,
            taint_reason: None,
            tainted_at: None,
        };
        fs::write(dir.join("receipt.json"), serde_json::to_string_pretty(&receipt).unwrap()).unwrap();
    }

    #[test]
    fn list_installed_returns_empty_when_no_installed_dir() {
        let dir = tempfile::tempdir().unwrap();
        let result = list_installed(dir.path()).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn list_installed_returns_sorted_receipts_with_evidence() {
        let dir = tempfile::tempdir().unwrap();
        write_receipt(dir.path(), "PKG-B");
        write_receipt(dir.path(), "PKG-A");
        let result = list_installed(dir.path()).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].0.id, "PKG-A");
        assert_eq!(result[0].1.source, EvidenceSource::File);
    }

    #[test]
    fn last_gate_failures_filters_failure_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let ledger_path = dir.path().join("governance.jsonl");
        let mut ledger = LedgerClient::with_default_options(&ledger_path, None).unwrap();
        ledger.write(NewEntry::new("preflight", "SUB-1", "PASSED", "ok")).unwrap();
        ledger.write(NewEntry::new("preflight", "SUB-2", "FAILED", "bad")).unwrap();
        let failures = last_gate_failures(&ledger, &ledger_path, 10).unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0.submission_id, "SUB-2");
    }

    #[test]
    fn explain_path_reports_classification_with_evidence() {
        let dir = tempfile::tempdir().unwrap();
        let (classification, pointer) = explain_path(dir.path(), &[], &dir.path().join("ledger/x.jsonl"));
        assert_eq!(classification.class, cp_types::PathClass::AppendOnly);
        assert_eq!(pointer.source, EvidenceSource::File);
    }

    #[test]
    fn get_governance_chain_reports_validity() {
        let dir = tempfile::tempdir().unwrap();
        let ledger_path = dir.path().join("governance.jsonl");
        let mut ledger = LedgerClient::with_default_options(&ledger_path, None).unwrap();
        ledger.write(NewEntry::new("x", "SUB-1", "D", "r")).unwrap();
        let ((ok, issues), pointer) = get_governance_chain(&ledger, &ledger_path).unwrap();
        assert!(ok, "{issues:?}");
        assert_eq!(pointer.source, EvidenceSource::Ledger);
    }

    #[test]
    fn get_manifest_requirements_reads_installed_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let install_dir = dir.path().join("installed/PKG-A");
        fs::create_dir_all(&install_dir).unwrap();
        let manifest = Manifest {
            package_id: "PKG-A".into(),
            schema_version: "1".into(),
            version: "0.1.0".into(),
            spec_id: "SPEC-1".into(),
            plane_id: "ho2".into(),
            package_type: "library".into(),
            assets: vec![],
            dependencies: vec![],
            framework_id: None,
            target_plane: None,
            external_interfaces: vec![],
            metadata: HashMap::new(),
        };
        fs::write(install_dir.join("manifest.json"), serde_json::to_string(&manifest).unwrap()).unwrap();
        let (read_back, pointer) = get_manifest_requirements(dir.path(), "PKG-A").unwrap();
        assert_eq!(read_back.package_id, "PKG-A");
        assert_eq!(pointer.source, EvidenceSource::File);
    }
}
