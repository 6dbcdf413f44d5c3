//! Parent/child ledger operations: rolling child-ledger activity up into a
//! parent's ledger, and pushing/applying policy down the chain. Every
//! operation is idempotent at the granularity of one logical event via a
//! `_dedupe_key` stamped into the written entry's metadata.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::warn;

use cp_cursor_manager::{CursorError, CursorManager};
use cp_hasher::hash_string;
use cp_ledger_engine::{LedgerClient, LedgerError, NewEntry};
use cp_types::Tier;

#[derive(Debug, thiserror::Error)]
pub enum ChainOpsError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Cursor(#[from] CursorError),
}

fn dedupe_key(parts: &[&str]) -> String {
    hash_string(&parts.join("|")).to_string()
}

/// Outcome of a `summarize_up` call that actually wrote a new entry.
#[derive(Debug, Clone)]
pub struct SummaryWritten {
    pub dedupe_key: String,
    pub cursor_from: u64,
    pub cursor_to: u64,
    pub entry_count: u64,
}

/// Roll up `[from, to)` of the child ledger into one `SUMMARY_UP` entry in
/// the parent ledger, advancing the child cursor atomically. Returns
/// `Ok(None)` when there's nothing new to summarize, or when this range was
/// already summarized (the cursor still advances so it isn't re-examined).
pub fn summarize_up(
    cursor_mgr: &CursorManager,
    parent_ledger: &mut LedgerClient,
    child_ledger: &LedgerClient,
    child_ledger_uri: &str,
    child_tier: Tier,
    child_instance_id: &str,
) -> Result<Option<SummaryWritten>, ChainOpsError> {
    let all_entries = child_ledger.read_all()?;
    let current_count = all_entries.len() as u64;

    let stored_cursor = cursor_mgr.load(child_ledger_uri)?;
    let current_last_hash = match &stored_cursor {
        Some(c) if c.offset > 0 && c.offset as usize <= all_entries.len() => all_entries[(c.offset - 1) as usize].entry_hash.clone(),
        _ => String::new(),
    };

    let (from, to, was_reset) = cursor_mgr.get_unprocessed_range(child_ledger_uri, current_count, &current_last_hash)?;
    if was_reset {
        warn!(child_ledger_uri, "child ledger cursor reset: source rewound or was replaced");
    }
    if from == to {
        return Ok(None);
    }

    let key = dedupe_key(&[child_ledger_uri, &from.to_string(), &to.to_string(), child_tier.as_str()]);
    let last_hash_in_range = all_entries[(to - 1) as usize].entry_hash.clone();

    if parent_ledger.has_dedupe_key(&key) {
        cursor_mgr.advance(child_ledger_uri, to, &last_hash_in_range)?;
        return Ok(None);
    }

    let range = &all_entries[from as usize..to as usize];
    let mut event_type_counts: HashMap<String, u64> = HashMap::new();
    let mut decision_counts: HashMap<String, u64> = HashMap::new();
    for entry in range {
        *event_type_counts.entry(entry.event_type.clone()).or_insert(0) += 1;
        *decision_counts.entry(entry.decision.clone()).or_insert(0) += 1;
    }

    let mut metadata = Map::new();
    metadata.insert("_dedupe_key".to_string(), Value::String(key.clone()));
    metadata.insert("source_ledger".to_string(), Value::String(child_ledger_uri.to_string()));
    metadata.insert("child_tier".to_string(), Value::String(child_tier.as_str().to_string()));
    metadata.insert("child_instance_id".to_string(), Value::String(child_instance_id.to_string()));
    metadata.insert("cursor_from".to_string(), Value::from(from));
    metadata.insert("cursor_to".to_string(), Value::from(to));
    metadata.insert("entry_count".to_string(), Value::from(to - from));
    metadata.insert(
        "event_type_counts".to_string(),
        serde_json::to_value(&event_type_counts).expect("count map serializes"),
    );
    metadata.insert(
        "decision_counts".to_string(),
        serde_json::to_value(&decision_counts).expect("count map serializes"),
    );
    metadata.insert("summarized_at".to_string(), Value::String(Utc::now().to_rfc3339()));

    parent_ledger.write(
        NewEntry::new("SUMMARY_UP", child_instance_id, "SUMMARIZED", format!("summarized {} entries from {child_ledger_uri}", to - from))
            .with_metadata(metadata),
    )?;

    cursor_mgr.advance(child_ledger_uri, to, &last_hash_in_range)?;

    Ok(Some(SummaryWritten {
        dedupe_key: key,
        cursor_from: from,
        cursor_to: to,
        entry_count: to - from,
    }))
}

/// Append a `POLICY_DOWN` entry to `child_ledger` unless this exact push was
/// already recorded. Returns `true` iff a new entry was written.
pub fn push_policy(child_ledger: &mut LedgerClient, policy_id: &str, version: &str, child_instance_id: &str) -> Result<bool, ChainOpsError> {
    let key = dedupe_key(&[policy_id, version, child_instance_id, "push"]);
    if child_ledger.has_dedupe_key(&key) {
        return Ok(false);
    }
    let mut metadata = Map::new();
    metadata.insert("_dedupe_key".to_string(), Value::String(key));
    metadata.insert("policy_id".to_string(), Value::String(policy_id.to_string()));
    metadata.insert("version".to_string(), Value::String(version.to_string()));
    child_ledger.write(NewEntry::new("POLICY_DOWN", child_instance_id, "PUSHED", format!("policy {policy_id}@{version} pushed")).with_metadata(metadata))?;
    Ok(true)
}

/// For every `POLICY_DOWN` entry in `instance_ledger` not yet matched by a
/// `POLICY_APPLIED` entry with the same `(policy_id, version)`, append one.
/// Returns how many new `POLICY_APPLIED` entries were written.
pub fn apply_policy(instance_ledger: &mut LedgerClient, instance_id: &str) -> Result<u64, ChainOpsError> {
    let pushed = instance_ledger.read_by_event_type("POLICY_DOWN")?;
    let mut applied_count = 0u64;

    for entry in pushed {
        let policy_id = entry.metadata.get("policy_id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let version = entry.metadata.get("version").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        if policy_id.is_empty() || version.is_empty() {
            continue;
        }
        let key = dedupe_key(&[&policy_id, &version, instance_id, "apply"]);
        if instance_ledger.has_dedupe_key(&key) {
            continue;
        }
        let mut metadata = Map::new();
        metadata.insert("_dedupe_key".to_string(), Value::String(key));
        metadata.insert("policy_id".to_string(), Value::String(policy_id.clone()));
        metadata.insert("version".to_string(), Value::String(version.clone()));
        instance_ledger.write(NewEntry::new("POLICY_APPLIED", instance_id, "APPLIED", format!("policy {policy_id}@{version} applied")).with_metadata(metadata))?;
        applied_count += 1;
    }
    Ok(applied_count)
}
