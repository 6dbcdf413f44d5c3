//! Thin, composable validators layered on top of the preflight gate suite
//! and the package factory: `preflight` re-checks an archive before it's
//! trusted, `postflight` confirms an install landed exactly as received,
//! `drift_check` looks for divergence after the fact, and `quarantine`
//! flags a package without removing it.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use serde_yaml::Value as YamlValue;
use tracing::warn;

use cp_hasher::hash_file;
use cp_ledger_engine::{LedgerClient, LedgerError, NewEntry};
use cp_package_factory::{gate_plane_rules, gate_tier_dependency};
use cp_path_classifier::{assert_write_allowed, WriteViolation};
use cp_plane_resolver::PlaneContext;
use cp_types::{InstallReceipt, Manifest, Tier};

#[derive(Debug, thiserror::Error)]
pub enum SealGuardError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed manifest.json inside archive")]
    MalformedManifest,
    #[error("manifest.json not found inside archive")]
    ManifestNotFound,
    #[error("malformed receipt at {0}")]
    MalformedReceipt(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Write(#[from] WriteViolation),
}

fn io_err(path: &Path, source: io::Error) -> SealGuardError {
    SealGuardError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// One check's outcome. Unlike the package factory's numbered gates, seal
/// guard checks are named for what they validate since they don't map onto
/// a fixed G-number sequence.
#[derive(Debug, Clone, Serialize)]
pub struct SealReport {
    pub gate: String,
    pub passed: bool,
    pub message: String,
}

impl SealReport {
    fn ok(gate: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            gate: gate.into(),
            passed: true,
            message: message.into(),
        }
    }

    fn fail(gate: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            gate: gate.into(),
            passed: false,
            message: message.into(),
        }
    }
}

/// By convention the archive carries its own `manifest.json` at the tar
/// root alongside the declared assets, so seal guard can rehydrate a
/// package description from the archive alone.
pub fn extract_manifest_from_archive(archive_bytes: &[u8]) -> Result<Manifest, SealGuardError> {
    let gz = flate2::read::GzDecoder::new(archive_bytes);
    let mut archive = tar::Archive::new(gz);
    for entry in archive.entries().map_err(|e| io_err(Path::new("<archive>"), e))? {
        let mut entry = entry.map_err(|e| io_err(Path::new("<archive>"), e))?;
        let path = entry.path().map_err(|e| io_err(Path::new("<archive>"), e))?.to_path_buf();
        if path == Path::new("manifest.json") {
            let manifest: Manifest = serde_json::from_reader(&mut entry).map_err(|_| SealGuardError::MalformedManifest)?;
            return Ok(manifest);
        }
    }
    Err(SealGuardError::ManifestNotFound)
}

/// Best-effort check against `policies/install_policy.yaml`, loaded as
/// opaque YAML: recognizes an optional `denied_package_types` list and an
/// optional `require_framework_id` flag, ignoring everything else.
fn check_install_policy(policies_dir: &Path, manifest: &Manifest) -> SealReport {
    let policy_path = policies_dir.join("install_policy.yaml");
    if !policy_path.is_file() {
        return SealReport::ok("INSTALL_POLICY", "no install_policy.yaml present");
    }
    let content = match fs::read_to_string(&policy_path) {
        Ok(c) => c,
        Err(e) => return SealReport::fail("INSTALL_POLICY", format!("could not read {}: {e}", policy_path.display())),
    };
    let value: YamlValue = match serde_yaml::from_str(&content) {
        Ok(v) => v,
        Err(e) => return SealReport::fail("INSTALL_POLICY", format!("malformed install_policy.yaml: {e}")),
    };
    if let Some(denied) = value.get("denied_package_types").and_then(|v| v.as_sequence()) {
        if denied.iter().any(|d| d.as_str() == Some(manifest.package_type.as_str())) {
            return SealReport::fail("INSTALL_POLICY", format!("package_type {:?} is denied by install policy", manifest.package_type));
        }
    }
    if value.get("require_framework_id").and_then(|v| v.as_bool()) == Some(true) && manifest.framework_id.is_none() {
        return SealReport::fail("INSTALL_POLICY", "install policy requires framework_id but manifest has none".to_string());
    }
    SealReport::ok("INSTALL_POLICY", "install policy satisfied")
}

/// Strict-mode-only: a `spec_id` must be present. Full registration against
/// `specs_registry.csv` is the preflight crate's G1 gate; this is a cheap
/// pre-check seal guard can run without a registry handle.
fn check_attention_policy(manifest: &Manifest, strict_mode: bool) -> SealReport {
    if !strict_mode {
        return SealReport::ok("ATTENTION_POLICY", "not in strict mode, skipped");
    }
    if manifest.spec_id.trim().is_empty() {
        return SealReport::fail("ATTENTION_POLICY", "strict mode requires a non-empty spec_id".to_string());
    }
    SealReport::ok("ATTENTION_POLICY", "spec_id present")
}

/// Re-validate an archive before it's trusted: tier-dependency rule,
/// plane-target/direction rules, install-policy, and (strict mode only)
/// attention-policy.
pub fn preflight(
    archive_bytes: &[u8],
    current_plane: &PlaneContext,
    dependency_tiers: &HashMap<String, Tier>,
    policies_dir: &Path,
    strict_mode: bool,
    is_genesis: bool,
) -> Result<Vec<SealReport>, SealGuardError> {
    let manifest = extract_manifest_from_archive(archive_bytes)?;

    let tier_report = gate_tier_dependency(&manifest, dependency_tiers, is_genesis);
    let plane_report = gate_plane_rules(&manifest, current_plane);
    let policy_report = check_install_policy(policies_dir, &manifest);
    let attention_report = check_attention_policy(&manifest, strict_mode);

    Ok(vec![
        SealReport {
            gate: tier_report.gate.to_string(),
            passed: tier_report.passed,
            message: tier_report.message,
        },
        SealReport {
            gate: plane_report.gate.to_string(),
            passed: plane_report.passed,
            message: plane_report.message,
        },
        policy_report,
        attention_report,
    ])
}

fn load_receipt(plane_root: &Path, package_id: &str) -> Result<InstallReceipt, SealGuardError> {
    let path = plane_root.join("installed").join(package_id).join("receipt.json");
    let content = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    serde_json::from_str(&content).map_err(|_| SealGuardError::MalformedReceipt(path.display().to_string()))
}

fn save_receipt(plane_root: &Path, governed_roots: &[String], package_id: &str, receipt: &InstallReceipt) -> Result<(), SealGuardError> {
    let path = plane_root.join("installed").join(package_id).join("receipt.json");
    assert_write_allowed(plane_root, governed_roots, &path)?;
    fs::write(&path, serde_json::to_string_pretty(receipt).expect("receipt serializes")).map_err(|e| io_err(&path, e))
}

fn check_files(plane_root: &Path, receipt: &InstallReceipt) -> Vec<String> {
    let mut problems = Vec::new();
    for file in &receipt.files {
        let full_path = plane_root.join(&file.path);
        match hash_file(&full_path) {
            Ok(actual) if actual.to_string() == file.sha256 => {}
            Ok(actual) => problems.push(format!("{}: expected {}, found {actual}", file.path, file.sha256)),
            Err(e) => problems.push(format!("{}: {e}", file.path)),
        }
    }
    problems
}

/// Immediately after install: the receipt's `plane_root` must match the
/// current plane, and every listed file must exist with a matching hash.
pub fn postflight(plane_root: &Path, package_id: &str) -> Result<SealReport, SealGuardError> {
    let receipt = load_receipt(plane_root, package_id)?;
    if receipt.plane_root != plane_root.display().to_string() {
        return Ok(SealReport::fail(
            "POSTFLIGHT",
            format!("receipt plane_root {:?} does not match current plane {}", receipt.plane_root, plane_root.display()),
        ));
    }
    let problems = check_files(plane_root, &receipt);
    if problems.is_empty() {
        Ok(SealReport::ok("POSTFLIGHT", format!("{} files verified", receipt.files.len())))
    } else {
        Ok(SealReport::fail("POSTFLIGHT", problems.join("; ")))
    }
}

/// For every package installed on this plane, compare current file hashes
/// against the receipt and report drift per package.
pub fn drift_check(plane_root: &Path) -> Result<Vec<SealReport>, SealGuardError> {
    let installed_dir = plane_root.join("installed");
    if !installed_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut reports = Vec::new();
    let mut package_ids: Vec<String> = fs::read_dir(&installed_dir)
        .map_err(|e| io_err(&installed_dir, e))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
        .collect();
    package_ids.sort();

    for package_id in package_ids {
        let receipt = match load_receipt(plane_root, &package_id) {
            Ok(r) => r,
            Err(e) => {
                reports.push(SealReport::fail(format!("DRIFT:{package_id}"), e.to_string()));
                continue;
            }
        };
        let problems = check_files(plane_root, &receipt);
        reports.push(if problems.is_empty() {
            SealReport::ok(format!("DRIFT:{package_id}"), "no drift")
        } else {
            SealReport::fail(format!("DRIFT:{package_id}"), problems.join("; "))
        });
    }
    Ok(reports)
}

/// Mark a package tainted without removing it: it stays installed and
/// queryable, but every listing must surface the taint.
pub fn quarantine(plane_root: &Path, governed_roots: &[String], package_id: &str, reason: &str, ledger: &mut LedgerClient) -> Result<(), SealGuardError> {
    let mut receipt = load_receipt(plane_root, package_id)?;
    receipt.tainted = true;
    receipt.taint_reason = Some(reason.to_string());
    receipt.tainted_at = Some(Utc::now());
    save_receipt(plane_root, governed_roots, package_id, &receipt)?;

    ledger.write(NewEntry::new("package_quarantine", package_id, "QUARANTINED", reason))?;
    warn!(package_id, reason, "package quarantined");
    Ok(())
}
