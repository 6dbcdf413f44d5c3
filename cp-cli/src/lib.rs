//! Shared plumbing for the `cp-cli` binaries: tracing setup, exit codes, and
//! the handful of small conversions (`tier.json` -> `PlaneContext`, ledger
//! lookup) every binary needs but that don't belong in any one library
//! crate. No gate or pipeline logic lives here — that stays in the library
//! crates this just dispatches into.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use cp_ledger_engine::{LedgerClient, LedgerOptions, TierContext};
use cp_plane_resolver::PlaneContext;
use cp_tier_manifest::TierManifest;
use cp_types::{Manifest, Tier};

/// Exit code convention shared by every binary: 0 success, 1 gate/validation
/// failure, 2 usage/script error.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const USAGE: i32 = 2;
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).try_init();
}

/// Print `value` as pretty JSON when `json` is set, otherwise via `Debug`.
pub fn print_output<T: serde::Serialize + std::fmt::Debug>(value: &T, json: bool) {
    if json {
        println!("{}", serde_json::to_string_pretty(value).expect("value serializes"));
    } else {
        println!("{value:#?}");
    }
}

/// Build a [`PlaneContext`] for a standalone plane root directly from its
/// `tier.json`, without requiring a full chain config at some HO3 ancestor.
/// `cp_plane` and friends operate against one plane root at a time; the
/// directional rules a chain config enforces are re-validated by the gates
/// themselves at factory/seal-guard time, not at CLI dispatch time.
pub fn plane_context_for_root(root: &Path) -> anyhow::Result<PlaneContext> {
    let manifest = TierManifest::load(root)?;
    let tier = manifest.tier()?;
    Ok(PlaneContext {
        name: root.display().to_string(),
        plane_type: tier,
        root: root.to_path_buf(),
        pristine_roots: vec!["HOT/kernel".to_string(), "HOT/scripts".to_string()],
        derived_roots: vec![
            "registries".to_string(),
            "packages_store".to_string(),
            "tmp".to_string(),
            "_staging".to_string(),
            "installed".to_string(),
        ],
        ledger_path: root.join("ledger"),
        installed_dir: root.join("installed"),
        receipts_dir: root.join("installed"),
    })
}

/// Open the declared ledger of a plane root (per its `tier.json`), with a
/// [`TierContext`] attached so every write this process makes is stamped.
pub fn open_plane_ledger(root: &Path) -> anyhow::Result<(LedgerClient, TierManifest)> {
    let manifest = TierManifest::load(root)?;
    let tier = manifest.tier()?;
    let ledger_path = manifest.absolute_ledger_path(root);
    let ctx = TierContext {
        tier,
        plane_root: root.to_path_buf(),
        work_order_id: manifest.work_order_id.clone(),
        session_id: manifest.session_id.clone(),
    };
    let client = LedgerClient::open(&ledger_path, Some(ctx), LedgerOptions::default())?;
    Ok((client, manifest))
}

/// `ledger/cursors` sibling directory for a plane root, per the external
/// interfaces layout (`ledger/cursors/<sourcehash>.json`).
pub fn cursor_dir_for_root(root: &Path) -> PathBuf {
    root.join("ledger").join("cursors")
}

pub fn parse_tier(s: &str) -> Result<Tier, String> {
    Tier::parse(s).map_err(|e| e.to_string())
}

/// Resolve every already-installed package's tier, keyed by package id, by
/// reading `installed/<id>/manifest.json` under the plane root. G2/G2b need
/// this to judge a declared dependency's privilege — a dependency must
/// already be installed on the plane (or a peer it can see) to resolve at
/// all, so the installed set is the whole of what's resolvable.
pub fn resolve_installed_dependency_tiers(root: &Path) -> anyhow::Result<HashMap<String, Tier>> {
    let mut tiers = HashMap::new();
    let installed_dir = root.join("installed");
    let Ok(entries) = std::fs::read_dir(&installed_dir) else {
        return Ok(tiers);
    };
    for entry in entries.flatten() {
        let manifest_path = entry.path().join("manifest.json");
        let Ok(content) = std::fs::read_to_string(&manifest_path) else {
            continue;
        };
        let Ok(manifest) = serde_json::from_str::<Manifest>(&content) else {
            continue;
        };
        if let Ok(tier) = Tier::parse_plane_id(&manifest.plane_id) {
            tiers.insert(manifest.package_id, tier);
        }
    }
    Ok(tiers)
}
