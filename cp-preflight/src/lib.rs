//! Fail-closed gate suite: SCHEMA, MANIFEST, G0A (declaration), G1 (chain),
//! OWN (ownership), G5 (signature). `run_all` stops early only on a
//! structural MANIFEST failure; otherwise every gate runs and the full
//! result list is returned so a caller sees every problem at once.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use walkdir::WalkDir;

use cp_hasher::{hash_file, is_valid_hash};
use cp_registry_store::{CuratedRegistry, DerivedRegistry};
use cp_types::{Manifest, Tier};

pub const KNOWN_SCHEMA_VERSIONS: &[&str] = &["1", "1.0", "1.0.0"];

#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Registry(#[from] cp_registry_store::RegistryError),
}

fn io_err(path: &Path, source: io::Error) -> PreflightError {
    PreflightError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gate {
    Schema,
    Manifest,
    G0a,
    G1,
    Own,
    G5,
}

impl std::fmt::Display for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Gate::Schema => "SCHEMA",
            Gate::Manifest => "MANIFEST",
            Gate::G0a => "G0A",
            Gate::G1 => "G1",
            Gate::Own => "OWN",
            Gate::G5 => "G5",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct PreflightResult {
    pub gate: Gate,
    pub passed: bool,
    pub message: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl PreflightResult {
    fn ok(gate: Gate, message: impl Into<String>) -> Self {
        Self {
            gate,
            passed: true,
            message: message.into(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn with_errors(gate: Gate, message: impl Into<String>, errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            gate,
            passed: errors.is_empty(),
            message: message.into(),
            errors,
            warnings,
        }
    }
}

/// Everything a gate run needs. Registries and the archive/signature path
/// are optional since some gates (SCHEMA, MANIFEST, G0A) don't need them.
pub struct PreflightContext<'a> {
    pub manifest_path: PathBuf,
    pub source_dir: PathBuf,
    pub installing_package_id: String,
    /// Plane root G1 reads `specs/<spec_id>/manifest.yaml` from.
    pub plane_root: PathBuf,
    pub curated: Option<&'a CuratedRegistry>,
    pub derived: Option<&'a DerivedRegistry>,
    pub archive_path: Option<PathBuf>,
    pub allow_unsigned: bool,
}

/// Run every gate in spec order, stopping after MANIFEST if it fails
/// structurally (there's nothing a later gate could meaningfully check
/// against an unparseable manifest).
pub fn run_all(ctx: &PreflightContext) -> Result<Vec<PreflightResult>, PreflightError> {
    let mut results = Vec::new();

    let raw = read_manifest_value(&ctx.manifest_path)?;
    let schema_result = gate_schema(&raw);
    let schema_passed = schema_result.passed;
    results.push(schema_result);

    let manifest_result = gate_manifest(&raw);
    let manifest: Option<Manifest> = if manifest_result.passed {
        serde_json::from_value(raw.clone()).ok()
    } else {
        None
    };
    let manifest_passed = manifest_result.passed;
    results.push(manifest_result);

    if !manifest_passed || !schema_passed {
        return Ok(results);
    }
    let manifest = manifest.expect("MANIFEST gate passed implies typed parse succeeds");

    results.push(gate_g0a(&ctx.source_dir, &manifest));
    results.push(gate_g1(ctx.curated, &ctx.plane_root, &manifest));
    if let Some(derived) = ctx.derived {
        results.push(gate_own(derived, &ctx.installing_package_id, &manifest)?);
    }
    results.push(gate_g5(ctx.archive_path.as_deref(), ctx.allow_unsigned));

    Ok(results)
}

fn read_manifest_value(path: &Path) -> Result<Value, PreflightError> {
    let content = fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    Ok(serde_json::from_str(&content).unwrap_or(Value::Null))
}

const SCHEMA_REQUIRED_STRING_FIELDS: &[&str] = &["package_id", "schema_version", "version", "spec_id", "plane_id", "package_type"];

/// Lightweight JSON-schema-style check, independent of any registry.
fn gate_schema(raw: &Value) -> PreflightResult {
    let mut errors = Vec::new();
    let Some(obj) = raw.as_object() else {
        return PreflightResult::with_errors(Gate::Schema, "manifest is not a JSON object", vec!["NOT_AN_OBJECT".to_string()], vec![]);
    };
    for field in SCHEMA_REQUIRED_STRING_FIELDS {
        match obj.get(*field) {
            Some(Value::String(s)) if !s.is_empty() => {}
            Some(_) => errors.push(format!("TYPE_MISMATCH: {field} must be a non-empty string")),
            None => errors.push(format!("MISSING_FIELD: {field}")),
        }
    }
    match obj.get("assets") {
        Some(Value::Array(_)) => {}
        Some(_) => errors.push("TYPE_MISMATCH: assets must be an array".to_string()),
        None => errors.push("MISSING_FIELD: assets".to_string()),
    }
    if let Some(Value::String(plane_id)) = obj.get("plane_id") {
        if !plane_id.is_empty() && Tier::parse_plane_id(plane_id).is_err() {
            errors.push(format!("INVALID_PLANE_ID: {plane_id:?} is not one of ho1/ho2/ho3"));
        }
    }
    PreflightResult::with_errors(Gate::Schema, "structural schema check", errors, vec![])
}

/// `package_id` format, `assets` shape, `schema_version` membership.
fn gate_manifest(raw: &Value) -> PreflightResult {
    let mut errors = Vec::new();
    let package_id = raw.get("package_id").and_then(Value::as_str).unwrap_or_default();
    if !cp_types::is_valid_package_id(package_id) {
        errors.push(format!("INVALID_PACKAGE_ID: {package_id:?}"));
    }
    match raw.get("assets") {
        Some(Value::Array(_)) => {}
        _ => errors.push("ASSETS_NOT_A_LIST".to_string()),
    }
    let schema_version = raw.get("schema_version").and_then(Value::as_str).unwrap_or_default();
    if !KNOWN_SCHEMA_VERSIONS.contains(&schema_version) {
        errors.push(format!("UNKNOWN_SCHEMA_VERSION: {schema_version:?}"));
    }
    PreflightResult::with_errors(Gate::Manifest, "manifest structural validity", errors, vec![])
}

/// Every file in the source workspace has a declared asset; every asset's
/// declared hash matches the file's computed hash; every asset path is
/// relative and escape-free; every hash is well-formed.
fn gate_g0a(source_dir: &Path, manifest: &Manifest) -> PreflightResult {
    let mut errors = Vec::new();
    let warnings = Vec::new();

    let mut declared_paths = std::collections::HashSet::new();
    for asset in &manifest.assets {
        declared_paths.insert(asset.path.clone());

        if asset.path.starts_with('/') || asset.path.split('/').any(|seg| seg == "..") {
            errors.push(format!("PATH_ESCAPE: {}", asset.path));
            continue;
        }
        if !is_valid_hash(&asset.sha256) {
            errors.push(format!("HASH_FORMAT: {} has malformed hash {:?}", asset.path, asset.sha256));
            continue;
        }
        let full_path = source_dir.join(&asset.path);
        match hash_file(&full_path) {
            Ok(actual) if actual.as_str() == asset.sha256 => {}
            Ok(actual) => errors.push(format!("HASH_MISMATCH: {} expected {} got {}", asset.path, asset.sha256, actual)),
            Err(_) => errors.push(format!("HASH_MISMATCH: {} is declared but missing on disk", asset.path)),
        }
    }

    for entry in WalkDir::new(source_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = match entry.path().strip_prefix(source_dir) {
            Ok(r) => r.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        if !declared_paths.contains(&rel) {
            errors.push(format!("UNDECLARED: {rel}"));
        }
    }
    PreflightResult::with_errors(Gate::G0a, "package declaration vs. source workspace", errors, warnings)
}

/// `spec_id` and `framework_id` resolve in the curated registries; the spec
/// pack's own asset list is checked for completeness (warning only);
/// dependencies all look like package ids.
fn gate_g1(curated: Option<&CuratedRegistry>, plane_root: &Path, manifest: &Manifest) -> PreflightResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let Some(curated) = curated else {
        errors.push("NO_REGISTRY: curated registry unavailable to resolve spec_id".to_string());
        return PreflightResult::with_errors(Gate::G1, "chain resolution", errors, warnings);
    };

    match curated.find_spec(&manifest.spec_id) {
        Ok(Some(spec)) => {
            match curated.find_framework(&spec.framework_id) {
                Ok(Some(_)) => {}
                Ok(None) => errors.push(format!("FRAMEWORK_NOT_REGISTERED: {}", spec.framework_id)),
                Err(e) => errors.push(format!("REGISTRY_ERROR: {e}")),
            }
            if let Some(declared_fw) = &manifest.framework_id {
                if declared_fw != &spec.framework_id {
                    errors.push(format!("FRAMEWORK_MISMATCH: manifest declares {declared_fw}, spec resolves to {}", spec.framework_id));
                }
            }
        }
        Ok(None) => errors.push(format!("SPEC_NOT_REGISTERED: {}", manifest.spec_id)),
        Err(e) => errors.push(format!("REGISTRY_ERROR: {e}")),
    }

    for dep in &manifest.dependencies {
        if !dep.starts_with("PKG-") {
            errors.push(format!("INVALID_DEPENDENCY: {dep}"));
        }
    }

    warnings.extend(check_spec_pack_assets(plane_root, manifest));
    PreflightResult::with_errors(Gate::G1, "chain resolution", errors, warnings)
}

/// Checks the spec pack `specs/<spec_id>/manifest.yaml` asset list contains
/// every package asset; warns (does not fail) on gaps.
pub fn check_spec_pack_assets(plane_root: &Path, manifest: &Manifest) -> Vec<String> {
    let spec_pack_path = plane_root.join("specs").join(&manifest.spec_id).join("manifest.yaml");
    let Ok(content) = fs::read_to_string(&spec_pack_path) else {
        return vec![format!("ASSET_NOT_IN_SPEC: spec pack not found at {}", spec_pack_path.display())];
    };
    let parsed: serde_yaml::Value = match serde_yaml::from_str(&content) {
        Ok(v) => v,
        Err(_) => return vec!["ASSET_NOT_IN_SPEC: spec pack manifest.yaml is malformed".to_string()],
    };
    let spec_assets: std::collections::HashSet<String> = parsed
        .get("assets")
        .and_then(|v| v.as_sequence())
        .map(|seq| seq.iter().filter_map(|e| e.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    manifest
        .assets
        .iter()
        .filter(|a| !spec_assets.contains(&a.path))
        .map(|a| format!("ASSET_NOT_IN_SPEC: {}", a.path))
        .collect()
}

/// For each declared asset path present in `file_ownership.csv`: idempotent
/// if owned by the installer; a warning if transferring from a direct
/// dependency; a hard error ("no last-write-wins") otherwise.
fn gate_own(derived: &DerivedRegistry, installing_package_id: &str, manifest: &Manifest) -> Result<PreflightResult, PreflightError> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for asset in &manifest.assets {
        let Some(owner) = derived.active_owner(&asset.path)? else {
            continue;
        };
        if owner == installing_package_id {
            continue;
        }
        if manifest.dependencies.iter().any(|d| d == &owner) {
            warnings.push(format!("OWNERSHIP_TRANSFER: {} currently owned by {owner}, declared as a dependency", asset.path));
        } else {
            errors.push(format!("OWNERSHIP_CONFLICT: {} is owned by {owner}", asset.path));
        }
    }

    Ok(PreflightResult::with_errors(Gate::Own, "file ownership", errors, warnings))
}

/// If a `.sig` sidecar exists next to the archive, pass (verification
/// semantics are a signing backend's concern). If absent: warn when
/// `allow_unsigned`, otherwise fail.
fn gate_g5(archive_path: Option<&Path>, allow_unsigned: bool) -> PreflightResult {
    match archive_path {
        Some(path) => {
            let sig_path = PathBuf::from(format!("{}.sig", path.display()));
            if sig_path.exists() {
                PreflightResult::ok(Gate::G5, "signature sidecar present")
            } else if allow_unsigned {
                PreflightResult::with_errors(Gate::G5, "no signature, unsigned allowed", vec![], vec!["UNSIGNED: no .sig sidecar found, allowed by policy".to_string()])
            } else {
                PreflightResult::with_errors(Gate::G5, "no signature", vec!["UNSIGNED: no .sig sidecar and unsigned packages are not allowed".to_string()], vec![])
            }
        }
        None if allow_unsigned => PreflightResult::with_errors(Gate::G5, "no archive to sign yet, unsigned allowed", vec![], vec!["UNSIGNED: no archive path provided".to_string()]),
        None => PreflightResult::with_errors(Gate::G5, "no archive to check", vec!["UNSIGNED: no archive path provided and unsigned packages are not allowed".to_string()], vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cp_types::Asset;
    use std::fs;

    fn write_manifest(dir: &Path, manifest: &Manifest) -> PathBuf {
        let path = dir.join("manifest.json");
        fs::write(&path, serde_json::to_string_pretty(manifest).unwrap()).unwrap();
        path
    }

    fn base_manifest() -> Manifest {
        Manifest {
            package_id: "PKG-A".into(),
            schema_version: "1.0.0".into(),
            version: "0.1.0".into(),
            spec_id: "SPEC-1".into(),
            plane_id: "ho2".into(),
            package_type: "library".into(),
            assets: vec![],
            dependencies: vec![],
            framework_id: None,
            target_plane: None,
            external_interfaces: vec![],
            metadata: Default::default(),
        }
    }

    #[test]
    fn schema_gate_flags_missing_fields() {
        let raw = serde_json::json!({"package_id": "PKG-A"});
        let result = gate_schema(&raw);
        assert!(!result.passed);
        assert!(result.errors.iter().any(|e| e.contains("schema_version")));
    }

    #[test]
    fn schema_gate_rejects_invalid_plane_id() {
        let raw = serde_json::json!({
            "package_id": "PKG-A",
            "schema_version": "1",
            "version": "0.1.0",
            "spec_id": "SPEC-1",
            "plane_id": "ho9",
            "package_type": "library",
            "assets": []
        });
        let result = gate_schema(&raw);
        assert!(!result.passed);
        assert!(result.errors.iter().any(|e| e.starts_with("INVALID_PLANE_ID")));
    }

    #[test]
    fn manifest_gate_rejects_bad_package_id_and_unknown_schema_version() {
        let raw = serde_json::json!({
            "package_id": "bad-id",
            "schema_version": "99",
            "assets": []
        });
        let result = gate_manifest(&raw);
        assert!(!result.passed);
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn g0a_detects_hash_mismatch_and_undeclared_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("lib_a.py"), "x").unwrap();
        fs::write(dir.path().join("extra.py"), "stray").unwrap();
        let mut manifest = base_manifest();
        manifest.assets = vec![Asset {
            path: "lib_a.py".into(),
            sha256: "sha256:".to_string() + &"0".repeat(64),
            classification: "PRISTINE".into(),
        }];
        let result = gate_g0a(dir.path(), &manifest);
        assert!(!result.passed);
        assert!(result.errors.iter().any(|e| e.starts_with("HASH_MISMATCH")));
        assert!(result.errors.iter().any(|e| e.starts_with("UNDECLARED")));
    }

    #[test]
    fn g0a_rejects_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = base_manifest();
        manifest.assets = vec![Asset {
            path: "../escape.py".into(),
            sha256: "sha256:".to_string() + &"0".repeat(64),
            classification: "PRISTINE".into(),
        }];
        let result = gate_g0a(dir.path(), &manifest);
        assert!(result.errors.iter().any(|e| e.starts_with("PATH_ESCAPE")));
    }

    #[test]
    fn run_all_stops_after_manifest_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        fs::write(&path, r#"{"package_id": "not-valid"}"#).unwrap();
        let ctx = PreflightContext {
            manifest_path: path,
            source_dir: dir.path().to_path_buf(),
            installing_package_id: "PKG-A".into(),
            plane_root: dir.path().to_path_buf(),
            curated: None,
            derived: None,
            archive_path: None,
            allow_unsigned: true,
        };
        let results = run_all(&ctx).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].gate, Gate::Manifest);
        assert!(!results[1].passed);
    }

    #[test]
    fn own_gate_conflict_vs_transfer() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("registries")).unwrap();
        let derived = DerivedRegistry::new(dir.path());
        derived
            .write_file_ownership(
                &[],
                vec![cp_types::FileOwnershipRow {
                    file_path: "lib/x.py".into(),
                    owner_package_id: "PKG-A".into(),
                    sha256: "sha256:".to_string() + &"0".repeat(64),
                    classification: "PRISTINE".into(),
                    installed_date: "2026-01-01".into(),
                    replaced_date: "".into(),
                    superseded_by: "".into(),
                }],
            )
            .unwrap();

        let mut conflict_manifest = base_manifest();
        conflict_manifest.package_id = "PKG-B".into();
        conflict_manifest.assets = vec![Asset {
            path: "lib/x.py".into(),
            sha256: "sha256:".to_string() + &"1".repeat(64),
            classification: "PRISTINE".into(),
        }];
        let result = gate_own(&derived, "PKG-B", &conflict_manifest).unwrap();
        assert!(!result.passed);
        assert!(result.errors[0].contains("PKG-A"));

        let mut transfer_manifest = conflict_manifest.clone();
        transfer_manifest.dependencies = vec!["PKG-A".into()];
        let result = gate_own(&derived, "PKG-B", &transfer_manifest).unwrap();
        assert!(result.passed);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn g1_warns_when_asset_missing_from_spec_pack_manifest() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("specs/SPEC-1")).unwrap();
        fs::write(dir.path().join("specs/SPEC-1/manifest.yaml"), "assets:\n  - lib_a.py\n").unwrap();
        let curated = CuratedRegistry::new(dir.path());

        let mut manifest = base_manifest();
        manifest.assets = vec![Asset {
            path: "extra.py".into(),
            sha256: "sha256:".to_string() + &"0".repeat(64),
            classification: "PRISTINE".into(),
        }];
        let result = gate_g1(Some(&curated), dir.path(), &manifest);
        assert!(result.warnings.iter().any(|w| w.contains("ASSET_NOT_IN_SPEC") && w.contains("extra.py")));
    }

    #[test]
    fn g5_fails_closed_without_sig_or_allow_unsigned() {
        let result = gate_g5(None, false);
        assert!(!result.passed);
        let result = gate_g5(None, true);
        assert!(result.passed);
        assert_eq!(result.warnings.len(), 1);
    }
}
