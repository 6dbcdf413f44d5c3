//! Per-source consumer cursors: `{offset, last_seen_hash, last_seen_count}`
//! stored outside any ledger, under `ledger/cursors/<sourcehash>.json`, so a
//! ledger's own source and its consumers stay independent.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use cp_hasher::hash_string;

#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed cursor file at {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cursor {
    pub source_ledger_path: String,
    pub offset: u64,
    pub last_seen_hash: String,
    pub last_seen_count: u64,
}

/// Manages cursor files for one consumer plane's `ledger/cursors/` directory.
pub struct CursorManager {
    cursor_dir: PathBuf,
}

impl CursorManager {
    pub fn new(cursor_dir: &Path) -> Result<Self, CursorError> {
        fs::create_dir_all(cursor_dir).map_err(|e| io_err(cursor_dir, e))?;
        Ok(Self {
            cursor_dir: cursor_dir.to_path_buf(),
        })
    }

    fn file_for(&self, source_ledger_path: &str) -> PathBuf {
        let stem = hash_string(source_ledger_path).as_str().trim_start_matches("sha256:").to_string();
        self.cursor_dir.join(format!("{stem}.json"))
    }

    pub fn load(&self, source_ledger_path: &str) -> Result<Option<Cursor>, CursorError> {
        let path = self.file_for(source_ledger_path);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        let cursor: Cursor = serde_json::from_str(&content).map_err(|e| CursorError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(Some(cursor))
    }

    /// Write via tempfile + rename so a crash never leaves a partial cursor.
    pub fn save(&self, cursor: &Cursor) -> Result<(), CursorError> {
        let path = self.file_for(&cursor.source_ledger_path);
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(cursor).expect("Cursor always serializes");
        fs::write(&tmp_path, &content).map_err(|e| io_err(&tmp_path, e))?;
        fs::rename(&tmp_path, &path).map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    /// Returns `(from, to, was_reset)`. `current_last_hash` is the
    /// `entry_hash` of the source ledger's entry at the cursor's stored
    /// offset, as read by the caller from the source ledger; a mismatch
    /// against the stored `last_seen_hash` means the source rewound
    /// (e.g. truncated/replaced) and forces a full reprocess from zero.
    pub fn get_unprocessed_range(&self, source_ledger_path: &str, current_count: u64, current_last_hash: &str) -> Result<(u64, u64, bool), CursorError> {
        match self.load(source_ledger_path)? {
            None => Ok((0, current_count, false)),
            Some(cursor) => {
                if cursor.offset > 0 && cursor.last_seen_hash != current_last_hash {
                    Ok((0, current_count, true))
                } else {
                    Ok((cursor.offset, current_count, false))
                }
            }
        }
    }

    /// Advance the cursor for `source_ledger_path` to `to`, recording
    /// `last_seen_hash` as the entry_hash at position `to - 1`.
    pub fn advance(&self, source_ledger_path: &str, to: u64, last_seen_hash: &str) -> Result<(), CursorError> {
        let cursor = Cursor {
            source_ledger_path: source_ledger_path.to_string(),
            offset: to,
            last_seen_hash: last_seen_hash.to_string(),
            last_seen_count: to,
        };
        self.save(&cursor)
    }
}

fn io_err(path: &Path, source: io::Error) -> CursorError {
    CursorError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_cursor_yields_full_range_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CursorManager::new(dir.path()).unwrap();
        let (from, to, reset) = mgr.get_unprocessed_range("ledger/governance.jsonl", 5, "sha256:abc").unwrap();
        assert_eq!((from, to, reset), (0, 5, false));
    }

    #[test]
    fn advance_then_reload_resumes_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CursorManager::new(dir.path()).unwrap();
        mgr.advance("ledger/governance.jsonl", 3, "sha256:aaa").unwrap();
        let (from, to, reset) = mgr.get_unprocessed_range("ledger/governance.jsonl", 5, "sha256:aaa").unwrap();
        assert_eq!((from, to, reset), (3, 5, false));
    }

    #[test]
    fn hash_mismatch_at_cursor_position_forces_reset() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CursorManager::new(dir.path()).unwrap();
        mgr.advance("ledger/governance.jsonl", 3, "sha256:aaa").unwrap();
        let (from, to, reset) = mgr.get_unprocessed_range("ledger/governance.jsonl", 5, "sha256:different").unwrap();
        assert_eq!((from, to), (0, 5));
        assert!(reset);
    }

    #[test]
    fn different_sources_get_independent_cursor_files() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CursorManager::new(dir.path()).unwrap();
        mgr.advance("ledger/a.jsonl", 2, "sha256:one").unwrap();
        mgr.advance("ledger/b.jsonl", 7, "sha256:two").unwrap();
        assert_eq!(mgr.load("ledger/a.jsonl").unwrap().unwrap().offset, 2);
        assert_eq!(mgr.load("ledger/b.jsonl").unwrap().unwrap().offset, 7);
    }
}
