//! Orchestrates the full package pipeline: preflight, tier/plane rules,
//! deterministic packing, signing, attestation, registration, install,
//! post-install integrity and a final ledger verify. Each phase is a gate;
//! gates G1 through G7 stop the pipeline on failure, G8 and G9 only warn.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::Compression;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};

use cp_hasher::{hash_bytes, hash_file, Hash};
use cp_ledger_engine::{LedgerClient, LedgerError, NewEntry};
use cp_path_classifier::{assert_write_allowed, with_install_mode, WriteViolation};
use cp_plane_resolver::{validate_external_interface_direction, validate_target_plane, PlaneContext};
use cp_preflight::{PreflightContext, PreflightError, PreflightResult};
use cp_registry_store::{CuratedRegistry, DerivedRegistry, RegistryError};
use cp_types::{InstallReceipt, Manifest, PackageRegistryRow, ReceiptFile, Tier, TypeError};

type HmacSha256 = Hmac<Sha256>;

/// Event type each gate's ledger entry is written under.
pub const GATE_EVENT_TYPE: &str = "PACKAGE_FACTORY_GATE";

#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Preflight(#[from] PreflightError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Write(#[from] WriteViolation),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("gate {0} failed: {1}")]
    GateFailed(Gate, String),
}

fn io_err(path: &Path, source: io::Error) -> FactoryError {
    FactoryError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Gate {
    G1,
    G2,
    G2b,
    G3,
    G4,
    G5,
    G6,
    G7,
    G8,
    G9,
}

impl std::fmt::Display for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Gate::G1 => "G1",
            Gate::G2 => "G2",
            Gate::G2b => "G2b",
            Gate::G3 => "G3",
            Gate::G4 => "G4",
            Gate::G5 => "G5",
            Gate::G6 => "G6",
            Gate::G7 => "G7",
            Gate::G8 => "G8",
            Gate::G9 => "G9",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GateReport {
    pub gate: Gate,
    pub passed: bool,
    pub message: String,
}

impl GateReport {
    fn ok(gate: Gate, message: impl Into<String>) -> Self {
        Self {
            gate,
            passed: true,
            message: message.into(),
        }
    }

    fn fail(gate: Gate, message: impl Into<String>) -> Self {
        Self {
            gate,
            passed: false,
            message: message.into(),
        }
    }
}

/// `{builder, build_timestamp, build_env_hash, factory_version}` per G5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attestation {
    pub builder: String,
    pub build_timestamp: DateTime<Utc>,
    pub build_env_hash: String,
    pub factory_version: String,
}

pub const FACTORY_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct FactoryOptions {
    pub allow_unsigned: bool,
    pub allow_unattested: bool,
    /// G0 genesis installs must declare zero dependencies.
    pub is_genesis: bool,
}

impl Default for FactoryOptions {
    fn default() -> Self {
        Self {
            allow_unsigned: false,
            allow_unattested: false,
            is_genesis: false,
        }
    }
}

/// G2: a tier may only depend on packages installed at its own tier or a
/// higher-privilege one; a genesis install must declare zero dependencies.
pub fn gate_tier_dependency(manifest: &Manifest, dependency_tiers: &HashMap<String, Tier>, is_genesis: bool) -> GateReport {
    if is_genesis {
        if !manifest.dependencies.is_empty() {
            return GateReport::fail(Gate::G2, "genesis-tier package must declare zero dependencies".to_string());
        }
        return GateReport::ok(Gate::G2, "genesis install, no dependencies");
    }
    let current_tier = match Tier::parse_plane_id(&manifest.plane_id) {
        Ok(t) => t,
        Err(e) => return GateReport::fail(Gate::G2, e.to_string()),
    };
    for dep in &manifest.dependencies {
        match dependency_tiers.get(dep) {
            Some(dep_tier) if *dep_tier >= current_tier => {}
            Some(dep_tier) => {
                return GateReport::fail(
                    Gate::G2,
                    format!("dependency {dep} resolves to {dep_tier}, lower privilege than {current_tier}"),
                )
            }
            None => return GateReport::fail(Gate::G2, format!("dependency {dep} has no known tier")),
        }
    }
    GateReport::ok(Gate::G2, format!("{} dependencies at equal-or-higher privilege", manifest.dependencies.len()))
}

/// G2b: `target_plane` must resolve under the current plane, and every
/// external interface must reference an equal-or-higher-privilege plane.
pub fn gate_plane_rules(manifest: &Manifest, current_plane: &PlaneContext) -> GateReport {
    let declared_target = manifest.target_plane.as_deref().unwrap_or("any");
    if !validate_target_plane(declared_target, current_plane) {
        return GateReport::fail(Gate::G2b, format!("target_plane {declared_target:?} does not match current plane {}", current_plane.name));
    }
    for iface in &manifest.external_interfaces {
        let source_tier = match Tier::parse_plane_id(&iface.source_plane) {
            Ok(t) => t,
            Err(e) => return GateReport::fail(Gate::G2b, e.to_string()),
        };
        if !validate_external_interface_direction(current_plane.plane_type, source_tier) {
            return GateReport::fail(
                Gate::G2b,
                format!("external interface {:?} references {} which is lower privilege than {}", iface.name, source_tier, current_plane.plane_type),
            );
        }
    }
    GateReport::ok(Gate::G2b, "target plane and external interfaces respect direction")
}

/// Build a tar.gz over `manifest.assets`, read from `source_dir`, with
/// entries sorted by path and fixed metadata (mode 0644, uid/gid 0, mtime
/// 0, fixed gzip compression level) so that packing the same source twice
/// produces byte-identical archives.
pub fn pack_deterministic(source_dir: &Path, manifest: &Manifest) -> Result<Vec<u8>, FactoryError> {
    let mut assets = manifest.assets.clone();
    assets.sort_by(|a, b| a.path.cmp(&b.path));

    let mut tar_bytes = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_bytes);
        for asset in &assets {
            let full_path = source_dir.join(&asset.path);
            let data = fs::read(&full_path).map_err(|e| io_err(&full_path, e))?;
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(0);
            header.set_cksum();
            builder.append_data(&mut header, &asset.path, data.as_slice()).map_err(|e| io_err(&full_path, e))?;
        }
        builder.finish().map_err(|e| io_err(source_dir, e))?;
    }

    let mut gz = flate2::GzBuilder::new().mtime(0).write(Vec::new(), Compression::new(6));
    gz.write_all(&tar_bytes).map_err(|e| io_err(source_dir, e))?;
    gz.finish().map_err(|e| io_err(source_dir, e))
}

/// Pack the source twice and compare digests bit-for-bit. Used by the
/// verify path; production packs once via [`pack_deterministic`] and trusts
/// the algorithm's determinism.
pub fn verify_pack_determinism(source_dir: &Path, manifest: &Manifest) -> Result<(GateReport, Hash), FactoryError> {
    let first = pack_deterministic(source_dir, manifest)?;
    let second = pack_deterministic(source_dir, manifest)?;
    let first_digest = hash_bytes(&first);
    let second_digest = hash_bytes(&second);
    if first_digest != second_digest {
        return Ok((
            GateReport::fail(Gate::G3, format!("pack is not deterministic: {first_digest} != {second_digest}")),
            first_digest,
        ));
    }
    Ok((GateReport::ok(Gate::G3, format!("archive digest {first_digest}")), first_digest))
}

/// G4: HMAC-SHA256 over the archive digest string, keyed by
/// `CONTROL_PLANE_SIGNING_KEY`. Returns `Ok(None)` only when `allow_unsigned`
/// waives the requirement.
pub fn sign_digest(archive_digest: &Hash, signing_key: Option<&str>, allow_unsigned: bool) -> Result<(GateReport, Option<String>), FactoryError> {
    match signing_key {
        Some(key) => {
            let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
            mac.update(archive_digest.as_str().as_bytes());
            let sig = hex::encode(mac.finalize().into_bytes());
            Ok((GateReport::ok(Gate::G4, "archive signed"), Some(sig)))
        }
        None if allow_unsigned => {
            warn!("packing without a signature: CONTROL_PLANE_SIGNING_KEY not set and --allow-unsigned waived it");
            Ok((GateReport::ok(Gate::G4, "unsigned (waived)"), None))
        }
        None => Ok((GateReport::fail(Gate::G4, "CONTROL_PLANE_SIGNING_KEY not set and --allow-unsigned not passed"), None)),
    }
}

/// G5: build the attestation record, unless `allow_unattested` and no
/// builder identity was supplied.
pub fn build_attestation(builder: &str, allow_unattested: bool, now: DateTime<Utc>) -> Result<(GateReport, Option<Attestation>), FactoryError> {
    if builder.is_empty() {
        if allow_unattested {
            return Ok((GateReport::ok(Gate::G5, "unattested (waived)"), None));
        }
        return Ok((GateReport::fail(Gate::G5, "no builder identity supplied and --allow-unattested not passed"), None));
    }
    let build_env_hash = cp_hasher::hash_string(&format!("{builder}:{FACTORY_VERSION}:{}", std::env::consts::OS)).to_string();
    let attestation = Attestation {
        builder: builder.to_string(),
        build_timestamp: now,
        build_env_hash,
        factory_version: FACTORY_VERSION.to_string(),
    };
    Ok((GateReport::ok(Gate::G5, format!("attested by {builder}")), Some(attestation)))
}

/// G6: register `{package_id, version, archive_digest, registered_at}` in
/// `packages_registry.csv`.
pub fn register_package(
    derived: &DerivedRegistry,
    governed_roots: &[String],
    manifest: &Manifest,
    archive_digest: &Hash,
    now: DateTime<Utc>,
) -> Result<GateReport, FactoryError> {
    let row = PackageRegistryRow {
        package_id: manifest.package_id.clone(),
        version: manifest.version.clone(),
        archive_digest: archive_digest.to_string(),
        registered_at: now.to_rfc3339(),
    };
    derived.register_package(governed_roots, row)?;
    Ok(GateReport::ok(Gate::G6, format!("registered {} at {}", manifest.package_id, archive_digest)))
}

/// G7: extract every declared asset into the plane at its declared path,
/// then write `installed/<package_id>/manifest.json` and `receipt.json`.
pub fn install_package(
    plane_root: &Path,
    governed_roots: &[String],
    manifest: &Manifest,
    archive_bytes: &[u8],
    archive_digest: &Hash,
    now: DateTime<Utc>,
) -> Result<GateReport, FactoryError> {
    let gz = flate2::read::GzDecoder::new(archive_bytes);
    let mut archive = tar::Archive::new(gz);
    let mut files = Vec::new();

    let result = with_install_mode(|| -> Result<(), FactoryError> {
        for entry in archive.entries().map_err(|e| io_err(plane_root, e))? {
            let mut entry = entry.map_err(|e| io_err(plane_root, e))?;
            let rel_path = entry.path().map_err(|e| io_err(plane_root, e))?.to_path_buf();
            let dest = plane_root.join(&rel_path);
            assert_write_allowed(plane_root, governed_roots, &dest)?;
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf).map_err(|e| io_err(&dest, e))?;
            fs::write(&dest, &buf).map_err(|e| io_err(&dest, e))?;
            files.push(ReceiptFile {
                path: rel_path.to_string_lossy().replace('\\', "/"),
                sha256: hash_bytes(&buf).to_string(),
            });
        }
        Ok(())
    });
    result?;

    let installed_dir = plane_root.join("installed").join(&manifest.package_id);
    assert_write_allowed(plane_root, governed_roots, &installed_dir.join("manifest.json"))?;
    fs::create_dir_all(&installed_dir).map_err(|e| io_err(&installed_dir, e))?;
    fs::write(installed_dir.join("manifest.json"), serde_json::to_string_pretty(manifest).expect("manifest serializes")).map_err(|e| io_err(&installed_dir, e))?;

    let receipt = InstallReceipt {
        id: manifest.package_id.clone(),
        version: manifest.version.clone(),
        installed_at: now,
        plane_root: plane_root.display().to_string(),
        archive_digest: archive_digest.to_string(),
        files,
        factory_version: FACTORY_VERSION.to_string(),
        tainted: false,
        taint_reason: None,
        tainted_at: None,
    };
    fs::write(installed_dir.join("receipt.json"), serde_json::to_string_pretty(&receipt).expect("receipt serializes")).map_err(|e| io_err(&installed_dir, e))?;

    Ok(GateReport::ok(Gate::G7, format!("installed {} files for {}", receipt.files.len(), manifest.package_id)))
}

/// G8: recompute every installed file's hash against the receipt. Warn-only.
pub fn verify_integrity(plane_root: &Path, package_id: &str) -> Result<GateReport, FactoryError> {
    let receipt_path = plane_root.join("installed").join(package_id).join("receipt.json");
    let content = fs::read_to_string(&receipt_path).map_err(|e| io_err(&receipt_path, e))?;
    let receipt: InstallReceipt = serde_json::from_str(&content).map_err(|_| io_err(&receipt_path, io::Error::new(io::ErrorKind::InvalidData, "malformed receipt")))?;
    let mut mismatches = Vec::new();
    for file in &receipt.files {
        let full_path = plane_root.join(&file.path);
        match hash_file(&full_path) {
            Ok(actual) if actual.to_string() == file.sha256 => {}
            Ok(actual) => mismatches.push(format!("{}: expected {}, found {actual}", file.path, file.sha256)),
            Err(e) => mismatches.push(format!("{}: {e}", file.path)),
        }
    }
    if mismatches.is_empty() {
        Ok(GateReport::ok(Gate::G8, format!("{} files verified", receipt.files.len())))
    } else {
        Ok(GateReport::fail(Gate::G8, mismatches.join("; ")))
    }
}

/// Everything a full pipeline run needs. G1's preflight fields mirror
/// [`cp_preflight::PreflightContext`]; the rest feed gates G2 through G7.
pub struct FactoryContext<'a> {
    pub manifest_path: PathBuf,
    pub source_dir: PathBuf,
    pub plane_root: PathBuf,
    pub governed_roots: Vec<String>,
    pub current_plane: &'a PlaneContext,
    pub dependency_tiers: HashMap<String, Tier>,
    pub curated: &'a CuratedRegistry,
    pub derived: &'a DerivedRegistry,
    pub builder: String,
    pub signing_key: Option<String>,
    pub options: FactoryOptions,
    /// Package id the caller declared up front, used as the ledger
    /// submission id for every gate entry, including G1 which runs
    /// before the manifest itself has been parsed.
    pub package_id: String,
    /// Ledger each gate's report is appended to as it is produced.
    pub ledger: &'a mut LedgerClient,
}

fn log_gate(ledger: &mut LedgerClient, package_id: &str, report: &GateReport) -> Result<(), FactoryError> {
    let decision = if report.passed { "PASS" } else { "FAIL" };
    let mut metadata = serde_json::Map::new();
    metadata.insert("gate".to_string(), serde_json::Value::String(report.gate.to_string()));
    ledger.write(NewEntry::new(GATE_EVENT_TYPE, package_id, decision, report.message.clone()).with_metadata(metadata))?;
    Ok(())
}

/// Full pipeline output: every gate's report, in order, plus the parsed
/// manifest and produced attestation/signature when the pipeline reached
/// that far.
pub struct PipelineOutcome {
    pub reports: Vec<GateReport>,
    pub manifest: Option<Manifest>,
    pub archive_digest: Option<Hash>,
    pub signature: Option<String>,
    pub attestation: Option<Attestation>,
}

impl PipelineOutcome {
    pub fn passed(&self) -> bool {
        self.reports.iter().all(|r| r.passed)
    }
}

/// Run the full G1-G9 pipeline, stopping at the first failing stop-gate
/// (G1 through G7). G8 and G9 always run and only ever warn. Every gate's
/// report is appended to `ctx.ledger` as it is produced, so a failing run
/// leaves the same audit trail a passing one does.
pub fn run_pipeline(ctx: &mut FactoryContext, now: DateTime<Utc>) -> Result<PipelineOutcome, FactoryError> {
    let mut reports: Vec<GateReport> = Vec::new();
    macro_rules! push {
        ($report:expr) => {{
            let report = $report;
            log_gate(ctx.ledger, &ctx.package_id, &report)?;
            let passed = report.passed;
            reports.push(report);
            passed
        }};
    }

    let preflight_ctx = PreflightContext {
        manifest_path: ctx.manifest_path.clone(),
        source_dir: ctx.source_dir.clone(),
        installing_package_id: String::new(),
        plane_root: ctx.plane_root.clone(),
        curated: Some(ctx.curated),
        derived: Some(ctx.derived),
        archive_path: None,
        allow_unsigned: ctx.options.allow_unsigned,
    };
    let preflight_results = cp_preflight::run_all(&preflight_ctx)?;
    let preflight_passed = preflight_results.iter().all(|r: &PreflightResult| r.passed);
    let preflight_summary = preflight_results.iter().map(|r| format!("{}:{}", r.gate, if r.passed { "pass" } else { "fail" })).collect::<Vec<_>>().join(", ");
    let g1_passed = push!(if preflight_passed {
        GateReport::ok(Gate::G1, preflight_summary)
    } else {
        GateReport::fail(Gate::G1, preflight_summary)
    });
    if !g1_passed {
        return Ok(finish_early(reports));
    }

    let manifest_content = fs::read_to_string(&ctx.manifest_path).map_err(|e| io_err(&ctx.manifest_path, e))?;
    let manifest: Manifest = serde_json::from_str(&manifest_content).map_err(|_| io_err(&ctx.manifest_path, io::Error::new(io::ErrorKind::InvalidData, "manifest failed to parse after G1 passed")))?;

    if !push!(gate_tier_dependency(&manifest, &ctx.dependency_tiers, ctx.options.is_genesis)) {
        return Ok(finish_early(reports));
    }

    if !push!(gate_plane_rules(&manifest, ctx.current_plane)) {
        return Ok(finish_early(reports));
    }

    let (g3, archive_digest) = verify_pack_determinism(&ctx.source_dir, &manifest)?;
    if !push!(g3) {
        return Ok(finish_early(reports));
    }
    let archive_bytes = pack_deterministic(&ctx.source_dir, &manifest)?;

    let (g4, signature) = sign_digest(&archive_digest, ctx.signing_key.as_deref(), ctx.options.allow_unsigned)?;
    if !push!(g4) {
        return Ok(finish_early(reports));
    }

    let (g5, attestation) = build_attestation(&ctx.builder, ctx.options.allow_unattested, now)?;
    if !push!(g5) {
        return Ok(finish_early(reports));
    }

    let g6 = register_package(ctx.derived, &ctx.governed_roots, &manifest, &archive_digest, now)?;
    if !push!(g6) {
        return Ok(finish_early(reports));
    }

    let g7 = install_package(&ctx.plane_root, &ctx.governed_roots, &manifest, &archive_bytes, &archive_digest, now)?;
    if !push!(g7) {
        return Ok(finish_early(reports));
    }

    let g8 = verify_integrity(&ctx.plane_root, &manifest.package_id)?;
    if !g8.passed {
        warn!(package_id = %manifest.package_id, message = %g8.message, "G8 integrity check found drift");
    }
    push!(g8);

    let (chain_ok, chain_issues) = ctx.ledger.verify_chain();
    let g9 = if chain_ok {
        GateReport::ok(Gate::G9, "ledger chain verified after install")
    } else {
        warn!(package_id = %manifest.package_id, issues = ?chain_issues, "G9 ledger verify found chain issues");
        GateReport::fail(Gate::G9, chain_issues.join("; "))
    };
    push!(g9);

    info!(package_id = %manifest.package_id, digest = %archive_digest, "package factory pipeline completed");

    Ok(PipelineOutcome {
        reports,
        manifest: Some(manifest),
        archive_digest: Some(archive_digest),
        signature,
        attestation,
    })
}

fn finish_early(reports: Vec<GateReport>) -> PipelineOutcome {
    PipelineOutcome {
        reports,
        manifest: None,
        archive_digest: None,
        signature: None,
        attestation: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cp_types::Asset;
    use std::fs;

    fn write_asset(dir: &Path, rel: &str, content: &[u8]) -> Asset {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        Asset {
            path: rel.to_string(),
            sha256: hash_bytes(content).to_string(),
            classification: "PRISTINE".to_string(),
        }
    }

    fn sample_manifest(dir: &Path) -> Manifest {
        let asset = write_asset(dir, "HOT/kernel/a.py", b"print(1)\n");
        Manifest {
            package_id: "PKG-A".into(),
            schema_version: "1".into(),
            version: "0.1.0".into(),
            spec_id: "SPEC-1".into(),
            plane_id: "ho2".into(),
            package_type: "library".into(),
            assets: vec![asset],
            dependencies: vec![],
            framework_id: None,
            target_plane: None,
            external_interfaces: vec![],
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn pack_deterministic_produces_identical_bytes_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = sample_manifest(dir.path());
        let a = pack_deterministic(dir.path(), &manifest).unwrap();
        let b = pack_deterministic(dir.path(), &manifest).unwrap();
        assert_eq!(a, b);
        assert_eq!(hash_bytes(&a), hash_bytes(&b));
    }

    #[test]
    fn verify_pack_determinism_reports_pass() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = sample_manifest(dir.path());
        let (report, _digest) = verify_pack_determinism(dir.path(), &manifest).unwrap();
        assert!(report.passed);
    }

    #[test]
    fn sign_digest_fails_closed_without_key_or_waiver() {
        let digest = hash_bytes(b"archive");
        let (report, sig) = sign_digest(&digest, None, false).unwrap();
        assert!(!report.passed);
        assert!(sig.is_none());
    }

    #[test]
    fn sign_digest_waived_without_key() {
        let digest = hash_bytes(b"archive");
        let (report, sig) = sign_digest(&digest, None, true).unwrap();
        assert!(report.passed);
        assert!(sig.is_none());
    }

    #[test]
    fn sign_digest_produces_deterministic_hmac_for_same_key() {
        let digest = hash_bytes(b"archive");
        let (_, sig_a) = sign_digest(&digest, Some("k"), false).unwrap();
        let (_, sig_b) = sign_digest(&digest, Some("k"), false).unwrap();
        assert_eq!(sig_a, sig_b);
    }

    #[test]
    fn gate_tier_dependency_rejects_genesis_with_deps() {
        let mut manifest = sample_manifest(&tempfile::tempdir().unwrap().into_path());
        manifest.dependencies = vec!["PKG-B".to_string()];
        let report = gate_tier_dependency(&manifest, &HashMap::new(), true);
        assert!(!report.passed);
    }

    #[test]
    fn gate_tier_dependency_rejects_lower_privilege_dependency() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = sample_manifest(dir.path());
        manifest.dependencies = vec!["PKG-B".to_string()];
        let mut tiers = HashMap::new();
        tiers.insert("PKG-B".to_string(), Tier::HO1);
        let report = gate_tier_dependency(&manifest, &tiers, false);
        assert!(!report.passed);
    }

    #[test]
    fn gate_tier_dependency_accepts_equal_or_higher_privilege() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = sample_manifest(dir.path());
        manifest.dependencies = vec!["PKG-B".to_string()];
        let mut tiers = HashMap::new();
        tiers.insert("PKG-B".to_string(), Tier::HO3);
        let report = gate_tier_dependency(&manifest, &tiers, false);
        assert!(report.passed);
    }

    #[test]
    fn install_package_extracts_and_writes_receipt() {
        let dir = tempfile::tempdir().unwrap();
        let plane_root = dir.path().join("plane");
        fs::create_dir_all(&plane_root).unwrap();
        let manifest = sample_manifest(dir.path());
        let archive = pack_deterministic(dir.path(), &manifest).unwrap();
        let digest = hash_bytes(&archive);
        let governed = vec!["HOT/kernel".to_string()];
        let report = install_package(&plane_root, &governed, &manifest, &archive, &digest, Utc::now()).unwrap();
        assert!(report.passed);
        assert!(plane_root.join("HOT/kernel/a.py").is_file());
        assert!(plane_root.join("installed/PKG-A/receipt.json").is_file());
    }
}
