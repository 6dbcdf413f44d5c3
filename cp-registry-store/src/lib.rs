//! CSV-backed registries for the control plane: two curated (hand-maintained,
//! never touched by rebuild flows) and two derived (regenerated by the
//! Derived-State Rebuilder, `cp-derived-state`).
//!
//! Reads tolerate a missing file (returns empty); writes always go through
//! [`cp_path_classifier::assert_write_allowed`].

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use cp_path_classifier::{assert_write_allowed, WriteViolation};
use cp_types::{FileOwnershipRow, FrameworkRow, PackageRegistryRow, PackagesStateRow, SpecRow};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("csv error on {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error(transparent)]
    WriteViolation(#[from] WriteViolation),
}

fn io_err(path: &Path, source: io::Error) -> RegistryError {
    RegistryError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn csv_err(path: &Path, source: csv::Error) -> RegistryError {
    RegistryError::Csv {
        path: path.display().to_string(),
        source,
    }
}

/// Read rows from `path`; a missing file yields an empty `Vec`, matching the
/// "reads tolerate missing files" contract.
fn read_csv<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, RegistryError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);
    let mut rows = Vec::new();
    for result in reader.deserialize() {
        let row: T = result.map_err(|e| csv_err(path, e))?;
        rows.push(row);
    }
    Ok(rows)
}

fn write_csv<T: serde::Serialize>(plane_root: &Path, governed_roots: &[String], path: &Path, rows: &[T]) -> Result<(), RegistryError> {
    assert_write_allowed(plane_root, governed_roots, path)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let mut writer = csv::WriterBuilder::new().has_headers(true).from_path(path).map_err(|e| csv_err(path, e))?;
    for row in rows {
        writer.serialize(row).map_err(|e| csv_err(path, e))?;
    }
    writer.flush().map_err(|e| io_err(path, e))?;
    Ok(())
}

/// Curated registries: `frameworks_registry.csv` and `specs_registry.csv`.
/// These are hand-maintained ground truth and this type exposes read-only
/// access — no rebuild flow ever writes through it.
pub struct CuratedRegistry {
    plane_root: PathBuf,
}

impl CuratedRegistry {
    pub fn new(plane_root: &Path) -> Self {
        Self {
            plane_root: plane_root.to_path_buf(),
        }
    }

    fn frameworks_path(&self) -> PathBuf {
        self.plane_root.join("registries/frameworks_registry.csv")
    }

    fn specs_path(&self) -> PathBuf {
        self.plane_root.join("registries/specs_registry.csv")
    }

    pub fn frameworks(&self) -> Result<Vec<FrameworkRow>, RegistryError> {
        read_csv(&self.frameworks_path())
    }

    pub fn specs(&self) -> Result<Vec<SpecRow>, RegistryError> {
        read_csv(&self.specs_path())
    }

    pub fn find_framework(&self, framework_id: &str) -> Result<Option<FrameworkRow>, RegistryError> {
        Ok(self.frameworks()?.into_iter().find(|f| f.framework_id == framework_id))
    }

    pub fn find_spec(&self, spec_id: &str) -> Result<Option<SpecRow>, RegistryError> {
        Ok(self.specs()?.into_iter().find(|s| s.spec_id == spec_id))
    }
}

/// Derived registries: `file_ownership.csv`, `packages_state.csv`, and
/// `compiled/*.json` duplicates. Regenerated wholesale by
/// `cp-derived-state`; rows are sorted lexicographically by primary key for
/// determinism before being written.
pub struct DerivedRegistry {
    plane_root: PathBuf,
}

impl DerivedRegistry {
    pub fn new(plane_root: &Path) -> Self {
        Self {
            plane_root: plane_root.to_path_buf(),
        }
    }

    fn file_ownership_path(&self) -> PathBuf {
        self.plane_root.join("registries/file_ownership.csv")
    }

    fn packages_state_path(&self) -> PathBuf {
        self.plane_root.join("registries/packages_state.csv")
    }

    fn compiled_dir(&self) -> PathBuf {
        self.plane_root.join("registries/compiled")
    }

    fn packages_registry_path(&self) -> PathBuf {
        self.plane_root.join("registries/packages_registry.csv")
    }

    pub fn file_ownership(&self) -> Result<Vec<FileOwnershipRow>, RegistryError> {
        read_csv(&self.file_ownership_path())
    }

    pub fn packages_state(&self) -> Result<Vec<PackagesStateRow>, RegistryError> {
        read_csv(&self.packages_state_path())
    }

    pub fn packages_registry(&self) -> Result<Vec<PackageRegistryRow>, RegistryError> {
        read_csv(&self.packages_registry_path())
    }

    /// Insert or update this package's row (by `package_id`) and rewrite
    /// `packages_registry.csv` sorted by `package_id`.
    pub fn register_package(&self, governed_roots: &[String], row: PackageRegistryRow) -> Result<(), RegistryError> {
        let mut rows = self.packages_registry()?;
        rows.retain(|r| r.package_id != row.package_id);
        rows.push(row);
        rows.sort_by(|a, b| a.package_id.cmp(&b.package_id));
        write_csv(&self.plane_root, governed_roots, &self.packages_registry_path(), &rows)
    }

    /// Overwrite `file_ownership.csv`, sorted by `file_path`, plus its
    /// compiled JSON duplicate.
    pub fn write_file_ownership(&self, governed_roots: &[String], mut rows: Vec<FileOwnershipRow>) -> Result<(), RegistryError> {
        rows.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        write_csv(&self.plane_root, governed_roots, &self.file_ownership_path(), &rows)?;
        self.write_compiled(governed_roots, "file_ownership.json", &rows)
    }

    /// Overwrite `packages_state.csv`, sorted by `package_id`, plus its
    /// compiled JSON duplicate.
    pub fn write_packages_state(&self, governed_roots: &[String], mut rows: Vec<PackagesStateRow>) -> Result<(), RegistryError> {
        rows.sort_by(|a, b| a.package_id.cmp(&b.package_id));
        write_csv(&self.plane_root, governed_roots, &self.packages_state_path(), &rows)?;
        self.write_compiled(governed_roots, "packages_state.json", &rows)
    }

    fn write_compiled<T: serde::Serialize>(&self, governed_roots: &[String], file_name: &str, rows: &[T]) -> Result<(), RegistryError> {
        let path = self.compiled_dir().join(file_name);
        assert_write_allowed(&self.plane_root, governed_roots, &path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let content = serde_json::to_string_pretty(rows).expect("registry rows always serialize");
        fs::write(&path, content).map_err(|e| io_err(&path, e))?;
        debug!(path = %path.display(), rows = rows.len(), "wrote compiled registry duplicate");
        Ok(())
    }

    /// Current owner of `file_path` among non-superseded rows, if any.
    pub fn active_owner(&self, file_path: &str) -> Result<Option<String>, RegistryError> {
        Ok(self
            .file_ownership()?
            .into_iter()
            .find(|r| r.file_path == file_path && r.superseded_by.is_empty())
            .map(|r| r.owner_package_id))
    }
}
