//! Pure classification of a candidate path against a plane's directory
//! taxonomy, plus the two write guards built on top of it.

use std::cell::Cell;
use std::path::{Path, PathBuf};

use cp_types::PathClass;

thread_local! {
    /// Established for the duration of the package-install code path.
    /// `assert_write_allowed` consults this to permit PRISTINE writes.
    static INSTALL_MODE: Cell<bool> = Cell::new(false);
}

/// Run `f` with the per-invocation install-mode policy enabled, so that
/// `assert_write_allowed` treats PRISTINE writes as permitted for its
/// duration. Outside of this scope, PRISTINE writes fail closed.
pub fn with_install_mode<T>(f: impl FnOnce() -> T) -> T {
    INSTALL_MODE.with(|flag| flag.set(true));
    let result = f();
    INSTALL_MODE.with(|flag| flag.set(false));
    result
}

fn in_install_mode() -> bool {
    INSTALL_MODE.with(|flag| flag.get())
}

#[derive(Debug, thiserror::Error)]
pub enum WriteViolation {
    #[error("append-only violation: {path} is not an append-only path ({reason})")]
    NotAppendOnly { path: String, reason: String },
    #[error("append-only violation: write to {path} is not an append (offset {offset} != current length)")]
    NotAnAppend { path: String, offset: u64 },
    #[error("write-allowed violation: {path} classifies as {class} and is not writable outside install ({reason})")]
    NotWriteAllowed {
        path: String,
        class: PathClass,
        reason: String,
    },
}

/// A classification result together with a human-readable explanation,
/// mirroring the "(class, explanation)" contract the spec requires.
#[derive(Debug, Clone)]
pub struct Classification {
    pub class: PathClass,
    pub explanation: String,
}

/// Classify `candidate` against `plane_root`'s fixed directory taxonomy.
/// `governed_roots` are plane-relative directories (e.g. `HOT/kernel`,
/// `HOT/scripts`) that hold package-installed source/config and are thus
/// PRISTINE; anything else recognized by the fixed taxonomy below takes
/// priority over a governed-root match.
pub fn classify(plane_root: &Path, governed_roots: &[String], candidate: &Path) -> Classification {
    let relative = match relative_to(plane_root, candidate) {
        Some(r) => r,
        None => {
            return Classification {
                class: PathClass::External,
                explanation: format!("{} is outside plane root {}", candidate.display(), plane_root.display()),
            }
        }
    };

    let rel_str = relative.to_string_lossy().replace('\\', "/");

    if starts_with_any(&rel_str, &["ledger/"]) {
        return Classification {
            class: PathClass::AppendOnly,
            explanation: format!("{rel_str} is under the ledger directory"),
        };
    }

    const DERIVED_ROOTS: &[&str] = &["registries/", "packages_store/", "tmp/", "_staging/", "installed/"];
    if starts_with_any(&rel_str, DERIVED_ROOTS) {
        return Classification {
            class: PathClass::Derived,
            explanation: format!("{rel_str} is under a derived/generated directory"),
        };
    }

    for root in governed_roots {
        let root_norm = root.trim_end_matches('/');
        if rel_str == root_norm || rel_str.starts_with(&format!("{root_norm}/")) {
            return Classification {
                class: PathClass::Pristine,
                explanation: format!("{rel_str} is under governed root {root_norm}"),
            };
        }
    }

    Classification {
        class: PathClass::Derived,
        explanation: format!("{rel_str} is inside the plane but not a recognized governed root; defaulting to DERIVED"),
    }
}

fn starts_with_any(rel: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|p| rel == p.trim_end_matches('/') || rel.starts_with(p))
}

fn relative_to(root: &Path, candidate: &Path) -> Option<PathBuf> {
    candidate.strip_prefix(root).ok().map(PathBuf::from)
}

/// Fail unless `candidate` classifies as APPEND_ONLY and the write is an
/// append (the new content starts at the end of the file, i.e.
/// `write_offset == current_len`). Called by the ledger engine immediately
/// before each segment append.
pub fn assert_append_only(
    plane_root: &Path,
    governed_roots: &[String],
    candidate: &Path,
    current_len: u64,
    write_offset: u64,
) -> Result<(), WriteViolation> {
    let c = classify(plane_root, governed_roots, candidate);
    if c.class != PathClass::AppendOnly {
        return Err(WriteViolation::NotAppendOnly {
            path: candidate.display().to_string(),
            reason: c.explanation,
        });
    }
    if write_offset != current_len {
        return Err(WriteViolation::NotAnAppend {
            path: candidate.display().to_string(),
            offset: write_offset,
        });
    }
    Ok(())
}

/// Fail unless `candidate` classifies as DERIVED, or PRISTINE while the
/// per-invocation install-mode policy is active.
pub fn assert_write_allowed(plane_root: &Path, governed_roots: &[String], candidate: &Path) -> Result<(), WriteViolation> {
    let c = classify(plane_root, governed_roots, candidate);
    match c.class {
        PathClass::Derived => Ok(()),
        PathClass::Pristine if in_install_mode() => Ok(()),
        _ => Err(WriteViolation::NotWriteAllowed {
            path: candidate.display().to_string(),
            class: c.class,
            reason: c.explanation,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> PathBuf {
        PathBuf::from("/t/ho2")
    }

    #[test]
    fn ledger_paths_are_append_only() {
        let c = classify(&root(), &[], &root().join("ledger/workorder.jsonl"));
        assert_eq!(c.class, PathClass::AppendOnly);
    }

    #[test]
    fn registries_and_installed_are_derived() {
        for p in ["registries/file_ownership.csv", "installed/PKG-A/receipt.json", "packages_store/x.tar.gz", "tmp/a", "_staging/b"] {
            let c = classify(&root(), &[], &root().join(p));
            assert_eq!(c.class, PathClass::Derived, "{p}");
        }
    }

    #[test]
    fn governed_root_is_pristine() {
        let governed = vec!["HOT/kernel".to_string()];
        let c = classify(&root(), &governed, &root().join("HOT/kernel/preflight.py"));
        assert_eq!(c.class, PathClass::Pristine);
    }

    #[test]
    fn outside_plane_is_external() {
        let c = classify(&root(), &[], Path::new("/elsewhere/file.txt"));
        assert_eq!(c.class, PathClass::External);
    }

    #[test]
    fn append_only_guard_rejects_non_append_offset() {
        let p = root().join("ledger/x.jsonl");
        assert!(assert_append_only(&root(), &[], &p, 100, 100).is_ok());
        assert!(assert_append_only(&root(), &[], &p, 100, 50).is_err());
    }

    #[test]
    fn append_only_guard_rejects_non_append_only_path() {
        let p = root().join("registries/file_ownership.csv");
        assert!(assert_append_only(&root(), &[], &p, 0, 0).is_err());
    }

    #[test]
    fn write_allowed_guard_blocks_pristine_outside_install() {
        let governed = vec!["HOT/kernel".to_string()];
        let p = root().join("HOT/kernel/preflight.py");
        assert!(assert_write_allowed(&root(), &governed, &p).is_err());
        with_install_mode(|| {
            assert!(assert_write_allowed(&root(), &governed, &p).is_ok());
        });
        assert!(assert_write_allowed(&root(), &governed, &p).is_err());
    }

    #[test]
    fn write_allowed_guard_always_permits_derived() {
        let p = root().join("registries/file_ownership.csv");
        assert!(assert_write_allowed(&root(), &[], &p).is_ok());
    }
}
