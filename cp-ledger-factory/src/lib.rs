//! Creates tier ledgers and per-instance sub-ledgers (work-order / session),
//! stamping GENESIS entries against their parent where one exists.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use cp_ledger_engine::{LedgerClient, LedgerError, LedgerOptions, TierContext};
use cp_tier_manifest::{InstanceStatus, TierManifest, TierManifestError, MANIFEST_FILE_NAME};
use cp_types::Tier;

pub const DEFAULT_TIER_LEDGER_NAME: &str = "governance.jsonl";
pub const WORK_ORDER_LEDGER_NAME: &str = "workorder.jsonl";
pub const SESSION_LEDGER_NAME: &str = "session.jsonl";

#[derive(Debug, thiserror::Error)]
pub enum LedgerFactoryError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("{0} already declares a tier.json; create_tier will not overwrite it")]
    AlreadyExists(String),
    #[error("instance base {0} must be a HO2 plane for work-order instances")]
    BaseMustBeHo2(String),
    #[error("instance base {0} must be a HO1 plane for session instances")]
    BaseMustBeHo1(String),
    #[error(transparent)]
    TierManifest(#[from] TierManifestError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

fn io_err(path: &Path, source: io::Error) -> LedgerFactoryError {
    LedgerFactoryError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Create a brand-new tier plane at `tier_root`: writes `tier.json`, creates
/// the ledger directory, and writes a GENESIS entry. If `parent_ledger` is
/// given, the GENESIS's `parent_hash` is the parent ledger's current last
/// `entry_hash`.
pub fn create_tier(
    tier: Tier,
    tier_root: &Path,
    parent_ledger: Option<&Path>,
    ledger_name: Option<&str>,
) -> Result<LedgerClient, LedgerFactoryError> {
    let manifest_path = tier_root.join(MANIFEST_FILE_NAME);
    if manifest_path.exists() {
        return Err(LedgerFactoryError::AlreadyExists(tier_root.display().to_string()));
    }
    fs::create_dir_all(tier_root).map_err(|e| io_err(tier_root, e))?;

    let ledger_name = ledger_name.unwrap_or(DEFAULT_TIER_LEDGER_NAME);
    let ledger_rel_path = format!("ledger/{ledger_name}");

    let parent_hash = match parent_ledger {
        Some(p) => Some(read_last_entry_hash(p)?),
        None => None,
    };
    let parent_ledger_str = parent_ledger.map(|p| p.display().to_string());

    let manifest = TierManifest {
        tier: tier.as_str().to_string(),
        ledger_path: ledger_rel_path.clone(),
        parent_ledger: parent_ledger_str.clone(),
        work_order_id: None,
        session_id: None,
        status: InstanceStatus::Active,
        created_at: chrono::Utc::now(),
    };
    manifest.save(tier_root)?;

    let ctx = TierContext {
        tier,
        plane_root: tier_root.to_path_buf(),
        work_order_id: None,
        session_id: None,
    };
    let mut client = LedgerClient::open(&tier_root.join(&ledger_rel_path), Some(ctx), LedgerOptions::default())?;
    client.write_genesis(tier, tier_root, parent_ledger_str, parent_hash, None, None)?;
    Ok(client)
}

fn read_last_entry_hash(ledger_path: &Path) -> Result<String, LedgerFactoryError> {
    let client = LedgerClient::open(ledger_path, None, LedgerOptions::default())?;
    let entries = client.read_all()?;
    entries
        .last()
        .map(|e| e.entry_hash.clone())
        .ok_or_else(|| LedgerFactoryError::Ledger(LedgerError::Empty))
}

fn require_tier(base_root: &Path, expected: Tier, on_mismatch: impl Fn(String) -> LedgerFactoryError) -> Result<TierManifest, LedgerFactoryError> {
    let manifest = TierManifest::load(base_root)?;
    if manifest.tier()? != expected {
        return Err(on_mismatch(base_root.display().to_string()));
    }
    Ok(manifest)
}

/// Create a work-order instance under `<base_root>/work_orders/<wo_id>/`.
/// `base_root` must be a HO2 plane. The instance's GENESIS parent_ledger is
/// the relative path `../../ledger/<name>` back to the base tier's ledger.
pub fn create_work_order_instance(base_root: &Path, wo_id: &str) -> Result<LedgerClient, LedgerFactoryError> {
    let base_manifest = require_tier(base_root, Tier::HO2, LedgerFactoryError::BaseMustBeHo2)?;
    let instance_root = base_root.join("work_orders").join(wo_id);
    let manifest_path = instance_root.join(MANIFEST_FILE_NAME);
    if manifest_path.exists() {
        return Err(LedgerFactoryError::AlreadyExists(instance_root.display().to_string()));
    }
    fs::create_dir_all(&instance_root).map_err(|e| io_err(&instance_root, e))?;

    let base_ledger_name = Path::new(&base_manifest.ledger_path).file_name().unwrap().to_string_lossy().to_string();
    let parent_rel = format!("../../ledger/{base_ledger_name}");
    let parent_hash = read_last_entry_hash(&base_root.join(&base_manifest.ledger_path))?;

    let ledger_rel_path = format!("ledger/{WORK_ORDER_LEDGER_NAME}");
    let manifest = TierManifest {
        tier: Tier::HO2.as_str().to_string(),
        ledger_path: ledger_rel_path.clone(),
        parent_ledger: Some(parent_rel.clone()),
        work_order_id: Some(wo_id.to_string()),
        session_id: None,
        status: InstanceStatus::Active,
        created_at: chrono::Utc::now(),
    };
    manifest.save(&instance_root)?;

    let ctx = TierContext {
        tier: Tier::HO2,
        plane_root: instance_root.clone(),
        work_order_id: Some(wo_id.to_string()),
        session_id: None,
    };
    let mut client = LedgerClient::open(&instance_root.join(&ledger_rel_path), Some(ctx), LedgerOptions::default())?;
    client.write_genesis(Tier::HO2, &instance_root, Some(parent_rel), Some(parent_hash), Some(wo_id.to_string()), None)?;
    Ok(client)
}

/// HO1 variant of [`create_work_order_instance`]: instances live under
/// `<base_root>/sessions/<sess_id>/`.
pub fn create_session_instance(base_root: &Path, sess_id: &str) -> Result<LedgerClient, LedgerFactoryError> {
    let base_manifest = require_tier(base_root, Tier::HO1, LedgerFactoryError::BaseMustBeHo1)?;
    let instance_root = base_root.join("sessions").join(sess_id);
    let manifest_path = instance_root.join(MANIFEST_FILE_NAME);
    if manifest_path.exists() {
        return Err(LedgerFactoryError::AlreadyExists(instance_root.display().to_string()));
    }
    fs::create_dir_all(&instance_root).map_err(|e| io_err(&instance_root, e))?;

    let base_ledger_name = Path::new(&base_manifest.ledger_path).file_name().unwrap().to_string_lossy().to_string();
    let parent_rel = format!("../../ledger/{base_ledger_name}");
    let parent_hash = read_last_entry_hash(&base_root.join(&base_manifest.ledger_path))?;

    let ledger_rel_path = format!("ledger/{SESSION_LEDGER_NAME}");
    let manifest = TierManifest {
        tier: Tier::HO1.as_str().to_string(),
        ledger_path: ledger_rel_path.clone(),
        parent_ledger: Some(parent_rel.clone()),
        work_order_id: None,
        session_id: Some(sess_id.to_string()),
        status: InstanceStatus::Active,
        created_at: chrono::Utc::now(),
    };
    manifest.save(&instance_root)?;

    let ctx = TierContext {
        tier: Tier::HO1,
        plane_root: instance_root.clone(),
        work_order_id: None,
        session_id: Some(sess_id.to_string()),
    };
    let mut client = LedgerClient::open(&instance_root.join(&ledger_rel_path), Some(ctx), LedgerOptions::default())?;
    client.write_genesis(Tier::HO1, &instance_root, Some(parent_rel), Some(parent_hash), None, Some(sess_id.to_string()))?;
    Ok(client)
}

/// Enumerate `work_orders/` or `sessions/` subtrees (whichever applies to
/// `base_root`'s tier) and return each instance's root path and manifest.
pub fn list_instances(base_root: &Path) -> Result<Vec<(PathBuf, TierManifest)>, LedgerFactoryError> {
    let base_manifest = TierManifest::load(base_root)?;
    let subdir = match base_manifest.tier()? {
        Tier::HO2 => "work_orders",
        Tier::HO1 => "sessions",
        Tier::HO3 => return Ok(Vec::new()),
    };
    let parent = base_root.join(subdir);
    if !parent.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(&parent).map_err(|e| io_err(&parent, e))? {
        let entry = entry.map_err(|e| io_err(&parent, e))?;
        let path = entry.path();
        if path.is_dir() && path.join(MANIFEST_FILE_NAME).is_file() {
            let manifest = TierManifest::load(&path)?;
            out.push((path, manifest));
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_tier_writes_genesis_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ho3");
        let client = create_tier(Tier::HO3, &root, None, None).unwrap();
        assert_eq!(client.read_all().unwrap().len(), 1);
        assert!(root.join(MANIFEST_FILE_NAME).is_file());
    }

    #[test]
    fn create_tier_rejects_existing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ho3");
        create_tier(Tier::HO3, &root, None, None).unwrap();
        let err = create_tier(Tier::HO3, &root, None, None).unwrap_err();
        assert!(matches!(err, LedgerFactoryError::AlreadyExists(_)));
    }

    #[test]
    fn work_order_instance_links_parent_hash() {
        let dir = tempfile::tempdir().unwrap();
        let ho2_root = dir.path().join("ho2");
        let mut ho2 = create_tier(Tier::HO2, &ho2_root, None, None).unwrap();
        let ho2_genesis_hash = ho2.read_all().unwrap()[0].entry_hash.clone();
        drop(ho2);

        let wo_client = create_work_order_instance(&ho2_root, "WO-1").unwrap();
        let entries = wo_client.read_all().unwrap();
        assert_eq!(entries[0].metadata.get("parent_hash").unwrap().as_str().unwrap(), ho2_genesis_hash);
        assert_eq!(entries[0].metadata.get("work_order_id").unwrap().as_str().unwrap(), "WO-1");
    }

    #[test]
    fn work_order_instance_rejects_non_ho2_base() {
        let dir = tempfile::tempdir().unwrap();
        let ho1_root = dir.path().join("ho1");
        create_tier(Tier::HO1, &ho1_root, None, None).unwrap();
        let err = create_work_order_instance(&ho1_root, "WO-1").unwrap_err();
        assert!(matches!(err, LedgerFactoryError::BaseMustBeHo2(_)));
    }

    #[test]
    fn list_instances_enumerates_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let ho2_root = dir.path().join("ho2");
        create_tier(Tier::HO2, &ho2_root, None, None).unwrap();
        create_work_order_instance(&ho2_root, "WO-2").unwrap();
        create_work_order_instance(&ho2_root, "WO-1").unwrap();

        let instances = list_instances(&ho2_root).unwrap();
        assert_eq!(instances.len(), 2);
        assert!(instances[0].0.ends_with("WO-1"));
        assert!(instances[1].0.ends_with("WO-2"));
    }
}
