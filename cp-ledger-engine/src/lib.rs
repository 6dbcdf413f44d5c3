// cp-ledger-engine/src/lib.rs
// Append-only, hash-chained JSONL ledger for the control plane.
//
// Each entry participates in a SHA-256 hash chain for tamper detection:
// previous_hash of entry N equals entry_hash of entry N-1, across segment
// boundaries within one ledger. Segments rotate on a byte threshold or a
// UTC day boundary; a sibling index.jsonl records finalized segment
// metadata and idx/<segment>.json records submission offsets.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use cp_hasher::hash_string;
use cp_merkle::merkle_root;
use cp_path_classifier::assert_append_only;
use cp_types::Tier;

pub const DEFAULT_ROTATE_BYTES: u64 = 256 * 1024 * 1024;
pub const DEFAULT_ROTATE_DAILY: bool = true;
pub const DEFAULT_BATCH_SIZE: usize = 1;
pub const DEFAULT_BATCH_INTERVAL_SEC: f64 = 0.0;
pub const DEFAULT_VERIFY_WORKERS: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed ledger entry in {path} at line {line}: {source}")]
    Parse {
        path: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("write violation: {0}")]
    WriteViolation(#[from] cp_path_classifier::WriteViolation),
    #[error("GENESIS can only be written to an empty ledger ({0} existing entries)")]
    NotEmpty(usize),
    #[error("ledger has no entries")]
    Empty,
}

/// Tier-aware stamping context. When attached to a `LedgerClient`, every
/// written entry's metadata is stamped (without overwriting caller keys)
/// with `_tier`, `_plane_root`, and any `_work_order_id` / `_session_id`.
#[derive(Debug, Clone)]
pub struct TierContext {
    pub tier: Tier,
    pub plane_root: PathBuf,
    pub work_order_id: Option<String>,
    pub session_id: Option<String>,
}

impl TierContext {
    fn stamp(&self, metadata: &mut Map<String, Value>) {
        metadata.entry("_tier").or_insert_with(|| Value::String(self.tier.as_str().to_string()));
        metadata
            .entry("_plane_root")
            .or_insert_with(|| Value::String(self.plane_root.display().to_string()));
        if let Some(wo) = &self.work_order_id {
            metadata.entry("_work_order_id").or_insert_with(|| Value::String(wo.clone()));
        }
        if let Some(sess) = &self.session_id {
            metadata.entry("_session_id").or_insert_with(|| Value::String(sess.clone()));
        }
    }
}

/// A draft entry supplied by a caller; `id`, `timestamp`, `previous_hash`,
/// and `entry_hash` are filled in at write time.
#[derive(Debug, Clone, Default)]
pub struct NewEntry {
    pub event_type: String,
    pub submission_id: String,
    pub decision: String,
    pub reason: String,
    pub prompts_used: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl NewEntry {
    pub fn new(event_type: impl Into<String>, submission_id: impl Into<String>, decision: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            submission_id: submission_id.into(),
            decision: decision.into(),
            reason: reason.into(),
            prompts_used: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// An immutable, written ledger record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub timestamp: String,
    pub event_type: String,
    pub submission_id: String,
    pub decision: String,
    pub reason: String,
    #[serde(default)]
    pub prompts_used: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub previous_hash: String,
    pub entry_hash: String,
}

impl LedgerEntry {
    /// Canonical JSON of this entry excluding `entry_hash`, sorted keys,
    /// no extraneous whitespace. `serde_json::Map` is BTreeMap-backed (the
    /// `preserve_order` feature is never enabled in this workspace), so
    /// `serde_json::to_value` followed by `to_string` naturally sorts keys.
    pub fn canonical_json_without_hash(&self) -> String {
        let mut value = serde_json::to_value(self).expect("LedgerEntry always serializes");
        if let Value::Object(ref mut map) = value {
            map.remove("entry_hash");
        }
        serde_json::to_string(&value).expect("Value always serializes")
    }

    fn is_legacy(&self) -> bool {
        self.entry_hash.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub segment: String,
    pub count: u64,
    pub bytes: u64,
    pub first_ts: String,
    pub last_ts: String,
    pub first_hash: String,
    pub last_hash: String,
    pub merkle_root: String,
}

struct ActiveSegment {
    path: PathBuf,
    count: u64,
    bytes: u64,
    first_ts: Option<String>,
    last_ts: Option<String>,
    first_hash: Option<String>,
    last_hash: Option<String>,
    entry_hashes: Vec<String>,
    opened_date: NaiveDate,
    submission_index: HashMap<String, Vec<(u64, u64)>>,
}

pub struct LedgerOptions {
    pub batch_size: usize,
    pub batch_interval_sec: f64,
    pub rotate_bytes: u64,
    pub rotate_daily: bool,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_interval_sec: DEFAULT_BATCH_INTERVAL_SEC,
            rotate_bytes: DEFAULT_ROTATE_BYTES,
            rotate_daily: DEFAULT_ROTATE_DAILY,
        }
    }
}

/// Append-only hash-chained ledger over a family of JSONL segments.
pub struct LedgerClient {
    ledger_dir: PathBuf,
    stem: String,
    tier_context: Option<TierContext>,
    options: LedgerOptions,
    buffer: Vec<LedgerEntry>,
    last_flush_at: Instant,
    chain_last_hash: String,
    active: ActiveSegment,
    finalized_segments: Vec<PathBuf>,
}

fn index_path(ledger_dir: &Path) -> PathBuf {
    ledger_dir.join("index.jsonl")
}

fn idx_dir(ledger_dir: &Path) -> PathBuf {
    ledger_dir.join("idx")
}

impl LedgerClient {
    /// Open (or resume) the ledger family rooted at `base_path`, e.g.
    /// `<plane>/ledger/governance.jsonl`. Rebuilds in-memory chain state
    /// from whatever segments already exist on disk.
    pub fn open(base_path: &Path, tier_context: Option<TierContext>, options: LedgerOptions) -> Result<Self, LedgerError> {
        let ledger_dir = base_path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        let stem = base_path.file_stem().unwrap().to_string_lossy().to_string();
        fs::create_dir_all(&ledger_dir).map_err(|e| io_err(&ledger_dir, e))?;
        fs::create_dir_all(idx_dir(&ledger_dir)).map_err(|e| io_err(&ledger_dir, e))?;

        let finalized_segments = read_finalized_segment_paths(&ledger_dir)?;
        let chain_last_hash = finalized_segments
            .last()
            .and_then(|p| last_entry_hash_of_file(p).ok())
            .unwrap_or_default();

        let active_path = if base_path.exists() && !finalized_segments.contains(&base_path.to_path_buf()) {
            base_path.to_path_buf()
        } else {
            // No segment created yet; the first write will create base_path.
            base_path.to_path_buf()
        };

        let active = rebuild_active_segment(&active_path, chain_last_hash.clone())?;
        let chain_last_hash = active.last_hash.clone().unwrap_or(chain_last_hash);

        Ok(Self {
            ledger_dir,
            stem,
            tier_context,
            options,
            buffer: Vec::new(),
            last_flush_at: Instant::now(),
            chain_last_hash,
            active,
            finalized_segments,
        })
    }

    pub fn with_default_options(base_path: &Path, tier_context: Option<TierContext>) -> Result<Self, LedgerError> {
        Self::open(base_path, tier_context, LedgerOptions::default())
    }

    fn governed_roots(&self) -> Vec<String> {
        Vec::new()
    }

    fn plane_root(&self) -> PathBuf {
        self.tier_context
            .as_ref()
            .map(|c| c.plane_root.clone())
            .unwrap_or_else(|| self.ledger_dir.parent().unwrap_or(&self.ledger_dir).to_path_buf())
    }

    /// Buffer `entry`; flush happens when the buffer reaches `batch_size`
    /// or `batch_interval_sec` has elapsed since the last flush.
    pub fn write(&mut self, entry: NewEntry) -> Result<String, LedgerError> {
        let mut metadata = entry.metadata;
        if let Some(ctx) = &self.tier_context {
            ctx.stamp(&mut metadata);
        }
        let id = format!("LED-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let drafted = LedgerEntry {
            id: id.clone(),
            timestamp: Utc::now().to_rfc3339(),
            event_type: entry.event_type,
            submission_id: entry.submission_id,
            decision: entry.decision,
            reason: entry.reason,
            prompts_used: entry.prompts_used,
            metadata,
            previous_hash: String::new(),
            entry_hash: String::new(),
        };
        self.buffer.push(drafted);

        let interval_elapsed = self.options.batch_interval_sec > 0.0
            && self.last_flush_at.elapsed() >= Duration::from_secs_f64(self.options.batch_interval_sec);
        if self.buffer.len() >= self.options.batch_size || interval_elapsed {
            self.flush()?;
        }
        Ok(id)
    }

    /// Force a flush of buffered entries, rotating the active segment first
    /// if the byte threshold or UTC day boundary has been crossed.
    pub fn flush(&mut self) -> Result<(), LedgerError> {
        if self.buffer.is_empty() {
            self.last_flush_at = Instant::now();
            return Ok(());
        }
        let pending = std::mem::take(&mut self.buffer);
        for mut entry in pending {
            let entry_date = DateTime::parse_from_rfc3339(&entry.timestamp)
                .map(|d| d.with_timezone(&Utc).date_naive())
                .unwrap_or_else(|_| Utc::now().date_naive());

            let needs_rotation =
                self.active.bytes >= self.options.rotate_bytes || (self.options.rotate_daily && entry_date > self.active.opened_date);
            if needs_rotation {
                self.rotate_active_segment()?;
            }

            entry.previous_hash = self.chain_last_hash.clone();
            let canonical = entry.canonical_json_without_hash();
            entry.entry_hash = hash_string(&canonical).to_string();

            let plane_root = self.plane_root();
            let governed = self.governed_roots();
            let current_len = fs::metadata(&self.active.path).map(|m| m.len()).unwrap_or(0);
            assert_append_only(&plane_root, &governed, &self.active.path, current_len, current_len)?;

            let line = serde_json::to_string(&entry).expect("LedgerEntry serializes");
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.active.path)
                .map_err(|e| io_err(&self.active.path, e))?;
            let offset = current_len;
            file.write_all(line.as_bytes()).map_err(|e| io_err(&self.active.path, e))?;
            file.write_all(b"\n").map_err(|e| io_err(&self.active.path, e))?;
            file.flush().map_err(|e| io_err(&self.active.path, e))?;
            let length = line.len() as u64 + 1;

            self.active.count += 1;
            self.active.bytes += length;
            if self.active.first_ts.is_none() {
                self.active.first_ts = Some(entry.timestamp.clone());
                self.active.first_hash = Some(entry.entry_hash.clone());
            }
            self.active.last_ts = Some(entry.timestamp.clone());
            self.active.last_hash = Some(entry.entry_hash.clone());
            self.active.entry_hashes.push(entry.entry_hash.clone());
            self.active
                .submission_index
                .entry(entry.submission_id.clone())
                .or_default()
                .push((offset, length));

            self.chain_last_hash = entry.entry_hash.clone();
        }
        self.last_flush_at = Instant::now();
        Ok(())
    }

    fn rotate_active_segment(&mut self) -> Result<(), LedgerError> {
        if self.active.count == 0 {
            // Nothing written to the active segment yet; no need to rotate an empty one.
            return Ok(());
        }
        self.finalize_active_segment()?;
        let new_name = format!("{}-{}.jsonl", self.stem, Utc::now().format("%Y%m%d-%H%M%S"));
        let new_path = self.ledger_dir.join(new_name);
        self.active = ActiveSegment {
            path: new_path,
            count: 0,
            bytes: 0,
            first_ts: None,
            last_ts: None,
            first_hash: None,
            last_hash: Some(self.chain_last_hash.clone()),
            entry_hashes: Vec::new(),
            opened_date: Utc::now().date_naive(),
            submission_index: HashMap::new(),
        };
        Ok(())
    }

    fn finalize_active_segment(&mut self) -> Result<(), LedgerError> {
        let meta = SegmentMeta {
            segment: self.active.path.file_name().unwrap().to_string_lossy().to_string(),
            count: self.active.count,
            bytes: self.active.bytes,
            first_ts: self.active.first_ts.clone().unwrap_or_default(),
            last_ts: self.active.last_ts.clone().unwrap_or_default(),
            first_hash: self.active.first_hash.clone().unwrap_or_default(),
            last_hash: self.active.last_hash.clone().unwrap_or_default(),
            merkle_root: merkle_root(&self.active.entry_hashes),
        };
        let index_file_path = index_path(&self.ledger_dir);
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index_file_path)
            .map_err(|e| io_err(&index_file_path, e))?;
        writeln!(f, "{}", serde_json::to_string(&meta).unwrap()).map_err(|e| io_err(&index_file_path, e))?;

        let stem = self.active.path.file_stem().unwrap().to_string_lossy().to_string();
        let idx_file_path = idx_dir(&self.ledger_dir).join(format!("{stem}.json"));
        let content = serde_json::to_string(&self.active.submission_index).unwrap();
        fs::write(&idx_file_path, content).map_err(|e| io_err(&idx_file_path, e))?;

        self.finalized_segments.push(self.active.path.clone());
        Ok(())
    }

    /// All segment paths in creation order (finalized, then the active one).
    fn segment_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.finalized_segments.clone();
        if !paths.contains(&self.active.path) {
            paths.push(self.active.path.clone());
        }
        paths
    }

    pub fn count(&self) -> u64 {
        self.finalized_segments.iter().filter_map(|p| count_lines(p).ok()).sum::<u64>() + self.active.count
    }

    pub fn read_all(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut out = Vec::new();
        for path in self.segment_paths() {
            out.extend(read_segment(&path)?);
        }
        Ok(out)
    }

    pub fn read_recent(&self, k: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
        let all = self.read_all()?;
        let start = all.len().saturating_sub(k);
        Ok(all[start..].to_vec())
    }

    pub fn read_by_event_type(&self, event_type: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self.read_all()?.into_iter().filter(|e| e.event_type == event_type).collect())
    }

    pub fn read_entries_range(&self, from: usize, to: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
        let all = self.read_all()?;
        let to = to.min(all.len());
        let from = from.min(to);
        Ok(all[from..to].to_vec())
    }

    /// Consult the per-segment submission index; fall back to a full scan
    /// of a segment only when its index is unavailable.
    pub fn read_by_submission(&self, submission_id: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut out = Vec::new();
        for path in self.segment_paths() {
            if path == self.active.path {
                if let Some(offsets) = self.active.submission_index.get(submission_id) {
                    out.extend(read_offsets(&path, offsets)?);
                    continue;
                }
            } else {
                let stem = path.file_stem().unwrap().to_string_lossy().to_string();
                let idx_file = idx_dir(&self.ledger_dir).join(format!("{stem}.json"));
                if let Ok(content) = fs::read_to_string(&idx_file) {
                    if let Ok(index) = serde_json::from_str::<HashMap<String, Vec<(u64, u64)>>>(&content) {
                        if let Some(offsets) = index.get(submission_id) {
                            out.extend(read_offsets(&path, offsets)?);
                            continue;
                        } else {
                            continue;
                        }
                    }
                }
            }
            // Fallback: full scan of this segment.
            out.extend(read_segment(&path)?.into_iter().filter(|e| e.submission_id == submission_id));
        }
        Ok(out)
    }

    /// Recompute every entry's hash and check chain linkage, including
    /// across segment boundaries. Legacy entries (no `entry_hash`) emit a
    /// WARN and reset the chain rather than FAIL.
    pub fn verify_chain(&self) -> (bool, Vec<String>) {
        verify_entries(&self.read_all().unwrap_or_default())
    }

    /// Same verification, computed with one worker per segment, then a
    /// serial cross-segment link pass.
    pub fn verify_chain_parallel(&self, workers: usize) -> (bool, Vec<String>) {
        use rayon::prelude::*;

        let segments: Vec<PathBuf> = self.segment_paths();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(workers.max(1)).build();
        let per_segment: Vec<(Vec<LedgerEntry>, Vec<String>)> = match pool {
            Ok(pool) => pool.install(|| {
                segments
                    .par_iter()
                    .map(|p| {
                        let entries = read_segment(p).unwrap_or_default();
                        let (_, issues) = verify_internal_chain(&entries);
                        (entries, issues)
                    })
                    .collect()
            }),
            Err(_) => segments
                .iter()
                .map(|p| {
                    let entries = read_segment(p).unwrap_or_default();
                    let (_, issues) = verify_internal_chain(&entries);
                    (entries, issues)
                })
                .collect(),
        };

        let mut issues: Vec<String> = Vec::new();
        let mut prev_last_hash: Option<String> = None;
        let mut prev_last_legacy = false;
        for (entries, seg_issues) in &per_segment {
            issues.extend(seg_issues.clone());
            if let (Some(first), Some(prev_hash)) = (entries.first(), prev_last_hash.clone()) {
                if !prev_last_legacy && first.previous_hash != prev_hash {
                    issues.push(format!(
                        "FAIL: segment boundary mismatch: {} previous_hash {} != prior segment last hash {}",
                        first.id, first.previous_hash, prev_hash
                    ));
                }
            }
            if let Some(last) = entries.last() {
                prev_last_hash = Some(last.entry_hash.clone());
                prev_last_legacy = last.is_legacy();
            }
        }
        let ok = !issues.iter().any(|i| i.starts_with("FAIL"));
        (ok, issues)
    }

    pub fn get_session_root(&self, since: Option<DateTime<Utc>>) -> String {
        let entries = self.read_all().unwrap_or_default();
        let hashes: Vec<String> = entries
            .into_iter()
            .filter(|e| match (&since, DateTime::parse_from_rfc3339(&e.timestamp)) {
                (Some(since), Ok(ts)) => ts.with_timezone(&Utc) >= *since,
                (None, _) => true,
                _ => false,
            })
            .map(|e| e.entry_hash)
            .collect();
        merkle_root(&hashes)
    }

    pub fn get_segments_root(&self) -> String {
        let mut roots = Vec::new();
        if let Ok(content) = fs::read_to_string(index_path(&self.ledger_dir)) {
            for line in content.lines() {
                if let Ok(meta) = serde_json::from_str::<SegmentMeta>(line) {
                    roots.push(meta.merkle_root);
                }
            }
        }
        roots.push(merkle_root(&self.active.entry_hashes));
        merkle_root(&roots)
    }

    /// Write a GENESIS entry. Fails unless the ledger is currently empty.
    pub fn write_genesis(
        &mut self,
        tier: Tier,
        plane_root: &Path,
        parent_ledger: Option<String>,
        parent_hash: Option<String>,
        work_order_id: Option<String>,
        session_id: Option<String>,
    ) -> Result<String, LedgerError> {
        if self.count() > 0 {
            return Err(LedgerError::NotEmpty(self.count() as usize));
        }
        let mut metadata = Map::new();
        metadata.insert("tier".into(), Value::String(tier.as_str().to_string()));
        metadata.insert("plane_root".into(), Value::String(plane_root.display().to_string()));
        metadata.insert("created_at".into(), Value::String(Utc::now().to_rfc3339()));
        if let Some(p) = &parent_ledger {
            metadata.insert("parent_ledger".into(), Value::String(p.clone()));
        }
        if let Some(h) = &parent_hash {
            metadata.insert("parent_hash".into(), Value::String(h.clone()));
        }
        if let Some(wo) = &work_order_id {
            metadata.insert("work_order_id".into(), Value::String(wo.clone()));
        }
        if let Some(sess) = &session_id {
            metadata.insert("session_id".into(), Value::String(sess.clone()));
        }
        let entry = NewEntry::new("GENESIS", "GENESIS", "CHAIN_INITIALIZED", format!("Ledger chain initialized for {tier} plane")).with_metadata(metadata);
        let id = self.write(entry)?;
        self.flush()?;
        Ok(id)
    }

    pub fn verify_genesis(&self) -> (bool, Vec<String>) {
        let mut issues = Vec::new();
        let entries = self.read_all().unwrap_or_default();
        let Some(first) = entries.first() else {
            issues.push("FAIL: Ledger is empty (no GENESIS)".to_string());
            return (false, issues);
        };
        if first.event_type != "GENESIS" {
            issues.push(format!("WARN: First entry is {}, not GENESIS", first.event_type));
        } else {
            for key in ["tier", "plane_root", "created_at"] {
                if !first.metadata.get(key).map(|v| !v.is_null()).unwrap_or(false) {
                    issues.push(format!("WARN: GENESIS missing {key} metadata"));
                }
            }
        }
        let ok = !issues.iter().any(|i| i.starts_with("FAIL"));
        (ok, issues)
    }

    pub fn verify_chain_link(&self, parent_ledger_path: &Path) -> (bool, Vec<String>) {
        let mut issues = Vec::new();
        let entries = self.read_all().unwrap_or_default();
        let Some(genesis) = entries.first().filter(|e| e.event_type == "GENESIS") else {
            issues.push("FAIL: No GENESIS entry to verify".to_string());
            return (false, issues);
        };
        let expected = genesis.metadata.get("parent_hash").and_then(|v| v.as_str());
        let Some(expected) = expected else {
            issues.push("INFO: No parent_hash in GENESIS (root ledger)".to_string());
            return (true, issues);
        };
        if !parent_ledger_path.exists() {
            issues.push(format!("FAIL: Parent ledger not found: {}", parent_ledger_path.display()));
            return (false, issues);
        }
        match last_entry_hash_of_file(parent_ledger_path) {
            Ok(actual) if actual == expected => (true, issues),
            Ok(actual) => {
                issues.push(format!("FAIL: parent_hash mismatch: expected {expected}, found {actual}"));
                (false, issues)
            }
            Err(e) => {
                issues.push(format!("FAIL: could not read parent ledger: {e}"));
                (false, issues)
            }
        }
    }

    pub fn has_dedupe_key(&self, key: &str) -> bool {
        self.read_all()
            .unwrap_or_default()
            .iter()
            .any(|e| e.metadata.get("_dedupe_key").and_then(|v| v.as_str()) == Some(key))
    }
}

impl Drop for LedgerClient {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn io_err(path: &Path, source: io::Error) -> LedgerError {
    LedgerError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn read_finalized_segment_paths(ledger_dir: &Path) -> Result<Vec<PathBuf>, LedgerError> {
    let path = index_path(ledger_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    let mut out = Vec::new();
    for line in content.lines() {
        if let Ok(meta) = serde_json::from_str::<SegmentMeta>(line) {
            out.push(ledger_dir.join(meta.segment));
        }
    }
    Ok(out)
}

fn rebuild_active_segment(path: &Path, inherited_last_hash: String) -> Result<ActiveSegment, LedgerError> {
    let entries = if path.exists() { read_segment(path)? } else { Vec::new() };
    let bytes = if path.exists() { fs::metadata(path).map(|m| m.len()).unwrap_or(0) } else { 0 };
    let mut submission_index: HashMap<String, Vec<(u64, u64)>> = HashMap::new();
    let mut offset = 0u64;
    if path.exists() {
        let content = fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        for line in content.lines() {
            let len = line.len() as u64 + 1;
            if let Ok(entry) = serde_json::from_str::<LedgerEntry>(line) {
                submission_index.entry(entry.submission_id).or_default().push((offset, len));
            }
            offset += len;
        }
    }
    let entry_hashes: Vec<String> = entries.iter().map(|e| e.entry_hash.clone()).collect();
    let opened_date = entries
        .first()
        .and_then(|e| DateTime::parse_from_rfc3339(&e.timestamp).ok())
        .map(|d| d.with_timezone(&Utc).date_naive())
        .unwrap_or_else(|| Utc::now().date_naive());
    Ok(ActiveSegment {
        path: path.to_path_buf(),
        count: entries.len() as u64,
        bytes,
        first_ts: entries.first().map(|e| e.timestamp.clone()),
        last_ts: entries.last().map(|e| e.timestamp.clone()),
        first_hash: entries.first().map(|e| e.entry_hash.clone()),
        last_hash: entries.last().map(|e| e.entry_hash.clone()).or(if inherited_last_hash.is_empty() {
            None
        } else {
            Some(inherited_last_hash)
        }),
        entry_hashes,
        opened_date,
        submission_index,
    })
}

fn read_segment(path: &Path) -> Result<Vec<LedgerEntry>, LedgerError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    let reader = io::BufReader::new(file);
    let mut out = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| io_err(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: LedgerEntry = serde_json::from_str(&line).map_err(|e| LedgerError::Parse {
            path: path.display().to_string(),
            line: i + 1,
            source: e,
        })?;
        out.push(entry);
    }
    Ok(out)
}

fn read_offsets(path: &Path, offsets: &[(u64, u64)]) -> Result<Vec<LedgerEntry>, LedgerError> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut out = Vec::new();
    for &(offset, length) in offsets {
        file.seek(SeekFrom::Start(offset)).map_err(|e| io_err(path, e))?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf).map_err(|e| io_err(path, e))?;
        let text = String::from_utf8_lossy(&buf);
        let entry: LedgerEntry = serde_json::from_str(text.trim_end()).map_err(|e| LedgerError::Parse {
            path: path.display().to_string(),
            line: 0,
            source: e,
        })?;
        out.push(entry);
    }
    Ok(out)
}

fn count_lines(path: &Path) -> Result<u64, LedgerError> {
    Ok(read_segment(path)?.len() as u64)
}

fn last_entry_hash_of_file(path: &Path) -> Result<String, LedgerError> {
    let entries = read_segment(path)?;
    entries.last().map(|e| e.entry_hash.clone()).ok_or(LedgerError::Empty)
}

fn verify_internal_chain(entries: &[LedgerEntry]) -> (bool, Vec<String>) {
    let mut issues = Vec::new();
    let mut prev_hash: Option<String> = None;
    let mut chain_reset = false;
    for entry in entries {
        let recomputed = hash_string(&entry.canonical_json_without_hash()).to_string();
        if entry.is_legacy() {
            issues.push(format!("WARN: legacy entry {} has no entry_hash; chain reset after this point", entry.id));
            chain_reset = true;
            prev_hash = None;
            continue;
        }
        if recomputed != entry.entry_hash {
            issues.push(format!("FAIL: entry {} hash mismatch: recomputed {} != stored {}", entry.id, recomputed, entry.entry_hash));
        }
        if let Some(prev) = &prev_hash {
            if !chain_reset && entry.previous_hash != *prev {
                issues.push(format!("FAIL: entry {} previous_hash {} != prior entry_hash {}", entry.id, entry.previous_hash, prev));
            }
        }
        chain_reset = false;
        prev_hash = Some(entry.entry_hash.clone());
    }
    let ok = !issues.iter().any(|i| i.starts_with("FAIL"));
    (ok, issues)
}

fn verify_entries(entries: &[LedgerEntry]) -> (bool, Vec<String>) {
    verify_internal_chain(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts_no_batching() -> LedgerOptions {
        LedgerOptions {
            batch_size: 1,
            ..LedgerOptions::default()
        }
    }

    #[test]
    fn empty_ledger_invariants() {
        let dir = tempfile::tempdir().unwrap();
        let client = LedgerClient::open(&dir.path().join("governance.jsonl"), None, opts_no_batching()).unwrap();
        assert!(client.read_all().unwrap().is_empty());
        let (valid, issues) = client.verify_chain();
        assert!(valid);
        assert!(issues.is_empty());
        let (valid, issues) = client.verify_genesis();
        assert!(!valid);
        assert!(issues[0].starts_with("FAIL"));
    }

    #[test]
    fn genesis_then_chain_extends_correctly() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = LedgerClient::open(&dir.path().join("governance.jsonl"), None, opts_no_batching()).unwrap();
        client.write_genesis(Tier::HO3, dir.path(), None, None, None, None).unwrap();
        client
            .write(NewEntry::new("governance_decision", "SUB-1", "APPROVED", "ok"))
            .unwrap();
        client.flush().unwrap();

        let entries = client.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].previous_hash, "");
        assert_eq!(entries[1].previous_hash, entries[0].entry_hash);

        let (valid, issues) = client.verify_chain();
        assert!(valid, "{issues:?}");
    }

    #[test]
    fn genesis_rejects_non_empty_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = LedgerClient::open(&dir.path().join("governance.jsonl"), None, opts_no_batching()).unwrap();
        client.write_genesis(Tier::HO3, dir.path(), None, None, None, None).unwrap();
        let err = client.write_genesis(Tier::HO3, dir.path(), None, None, None, None).unwrap_err();
        assert!(matches!(err, LedgerError::NotEmpty(_)));
    }

    #[test]
    fn tier_stamping_does_not_overwrite_caller_keys() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = TierContext {
            tier: Tier::HO2,
            plane_root: dir.path().to_path_buf(),
            work_order_id: Some("WO-1".into()),
            session_id: None,
        };
        let mut client = LedgerClient::open(&dir.path().join("workorder.jsonl"), Some(ctx), opts_no_batching()).unwrap();
        let mut metadata = Map::new();
        metadata.insert("_tier".into(), Value::String("CALLER_OVERRIDE".into()));
        client
            .write(NewEntry::new("x", "SUB-1", "D", "r").with_metadata(metadata))
            .unwrap();
        client.flush().unwrap();
        let entries = client.read_all().unwrap();
        assert_eq!(entries[0].metadata.get("_tier").unwrap().as_str().unwrap(), "CALLER_OVERRIDE");
        assert_eq!(entries[0].metadata.get("_work_order_id").unwrap().as_str().unwrap(), "WO-1");
    }

    #[test]
    fn read_by_submission_uses_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = LedgerClient::open(&dir.path().join("governance.jsonl"), None, opts_no_batching()).unwrap();
        client.write(NewEntry::new("t", "SUB-A", "D", "r")).unwrap();
        client.write(NewEntry::new("t", "SUB-B", "D", "r")).unwrap();
        client.write(NewEntry::new("t", "SUB-A", "D", "r")).unwrap();
        client.flush().unwrap();
        let found = client.read_by_submission("SUB-A").unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn legacy_entry_warns_and_resets_chain_without_failing() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("governance.jsonl");
        {
            let mut client = LedgerClient::open(&base, None, opts_no_batching()).unwrap();
            client.write_genesis(Tier::HO3, dir.path(), None, None, None, None).unwrap();
        }
        // Manually append a legacy (bypassing the engine), then a fresh-chain entry.
        {
            let mut f = OpenOptions::new().append(true).open(&base).unwrap();
            writeln!(
                f,
                r#"{{"id":"LED-legacy","timestamp":"2026-01-01T00:00:00+00:00","event_type":"legacy_event","submission_id":"SUB-X","decision":"D","reason":"r","prompts_used":[],"metadata":{{}},"previous_hash":"","entry_hash":""}}"#
            )
            .unwrap();
        }
        let client = LedgerClient::open(&base, None, opts_no_batching()).unwrap();
        let (valid, issues) = client.verify_chain();
        assert!(valid, "{issues:?}");
        assert!(issues.iter().any(|i| i.starts_with("WARN") && i.contains("legacy")));
    }

    #[test]
    fn batching_defers_flush_until_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let options = LedgerOptions {
            batch_size: 3,
            ..LedgerOptions::default()
        };
        let mut client = LedgerClient::open(&dir.path().join("governance.jsonl"), None, options).unwrap();
        client.write(NewEntry::new("t", "SUB-1", "D", "r")).unwrap();
        client.write(NewEntry::new("t", "SUB-2", "D", "r")).unwrap();
        assert_eq!(client.read_all().unwrap().len(), 0, "should not flush before batch_size reached");
        client.write(NewEntry::new("t", "SUB-3", "D", "r")).unwrap();
        assert_eq!(client.read_all().unwrap().len(), 3);
    }
}
