//! On-disk layout of one storage root
//!
//! ```text
//! <root>/filedir/   active archive files
//! <root>/tempdir/   uploads in progress
//! <root>/atticdir/  removed files, never deleted
//! ```
//!
//! Temp and attic live on the same volume as `filedir` so moves are renames.

use crate::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

const FILE_DIR: &str = "filedir";
const TEMP_DIR: &str = "tempdir";
const ATTIC_DIR: &str = "atticdir";

/// One storage root and its three subdirectories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDir {
    root: PathBuf,
    file_dir: PathBuf,
    temp_dir: PathBuf,
    attic_dir: PathBuf,
}

impl StorageDir {
    /// Create (if needed) and verify the layout under `root`.
    ///
    /// # Errors
    ///
    /// Returns `Io` if a directory cannot be created, `PermissionDenied` if
    /// the temp directory is read-only.
    pub fn create<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let dir = Self {
            file_dir: root.join(FILE_DIR),
            temp_dir: root.join(TEMP_DIR),
            attic_dir: root.join(ATTIC_DIR),
            root,
        };
        for path in [&dir.file_dir, &dir.temp_dir, &dir.attic_dir] {
            fs::create_dir_all(path)?;
        }
        if fs::metadata(&dir.temp_dir)?.permissions().readonly() {
            return Err(Error::PermissionDenied(format!(
                "Not allowed to write to temp directory '{}'",
                dir.temp_dir.display()
            )));
        }
        tracing::info!(root = %dir.root.display(), "Storing temporary files at '{}'", dir.temp_dir.display());
        Ok(dir)
    }

    /// Storage root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of active files
    #[must_use]
    pub fn file_dir(&self) -> &Path {
        &self.file_dir
    }

    /// Directory of removed files
    #[must_use]
    pub fn attic_dir(&self) -> &Path {
        &self.attic_dir
    }

    /// Active location of `name`
    #[must_use]
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.file_dir.join(name)
    }

    /// Upload staging location of `name`
    #[must_use]
    pub fn temp_path(&self, name: &str) -> PathBuf {
        self.temp_dir.join(name)
    }

    /// Free attic location for `name`.
    ///
    /// A name removed before keeps its earlier attic copy; later copies get
    /// `.1`, `.2`, ... suffixes.
    #[must_use]
    pub fn attic_path(&self, name: &str) -> PathBuf {
        let first = self.attic_dir.join(name);
        if !first.exists() {
            return first;
        }
        (1u32..)
            .map(|n| self.attic_dir.join(format!("{name}.{n}")))
            .find(|candidate| !candidate.exists())
            .unwrap_or(first)
    }

    /// Names of all active files, sorted
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file directory cannot be listed.
    pub fn file_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.file_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Reject names that are empty or would escape the storage directory.
///
/// # Errors
///
/// Returns `InvalidInput` describing the problem.
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput("file name must not be empty".to_string()));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(Error::InvalidInput(format!(
            "'{name}' is not a plain file name"
        )));
    }
    Ok(())
}
