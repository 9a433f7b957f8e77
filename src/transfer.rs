//! File transfer between nodes
//!
//! Messages never carry file bytes inline. They carry a [`RemoteFile`]
//! describing where the bytes can be fetched from; a [`FileTransfer`]
//! implementation moves them. [`LocalFileTransfer`] serves nodes sharing a
//! filesystem by staging copies in a common directory.

use crate::checksum::md5_file;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle to file content that can be fetched by another party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    name: String,
    location: PathBuf,
    size: u64,
    checksum: Option<String>,
}

impl RemoteFile {
    /// Describe a file the caller owns in place, without staging a copy.
    ///
    /// # Errors
    ///
    /// Returns error if the file does not exist or has no file name.
    pub fn local<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let name = file_name_of(path)?;
        let size = fs::metadata(path)?.len();
        Ok(Self {
            name,
            location: path.to_path_buf(),
            size,
            checksum: None,
        })
    }

    /// Attach an MD5 checksum the receiver will verify
    #[must_use]
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Original file name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where the content can be read from
    #[must_use]
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Content length in bytes
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// MD5 checksum, if known
    #[must_use]
    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }
}

/// Moves file content between nodes.
pub trait FileTransfer: Send + Sync {
    /// Make the file at `path` available to another node.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or staged.
    fn publish(&self, path: &Path) -> Result<RemoteFile>;

    /// Copy the content behind `remote` to `dest`, returning bytes written.
    ///
    /// # Errors
    ///
    /// Returns error if the source cannot be read, the destination cannot be
    /// written, or the copied content does not match the advertised size or
    /// checksum.
    fn fetch(&self, remote: &RemoteFile, dest: &Path) -> Result<u64>;

    /// Drop whatever [`publish`](Self::publish) staged for `remote`, once the
    /// receiver has fetched it. Content not staged by this transfer is left
    /// alone.
    ///
    /// # Errors
    ///
    /// Returns error if a staged copy exists but cannot be removed.
    fn release(&self, remote: &RemoteFile) -> Result<()>;
}

/// Transfer over a filesystem shared by all parties.
#[derive(Debug)]
pub struct LocalFileTransfer {
    staging_dir: PathBuf,
    sequence: AtomicU64,
}

impl LocalFileTransfer {
    /// Create a transfer staging published copies under `staging_dir`
    ///
    /// # Errors
    ///
    /// Returns error if the staging directory cannot be created.
    pub fn new<P: AsRef<Path>>(staging_dir: P) -> Result<Self> {
        fs::create_dir_all(staging_dir.as_ref())?;
        Ok(Self {
            staging_dir: staging_dir.as_ref().to_path_buf(),
            sequence: AtomicU64::new(0),
        })
    }

    /// Directory holding staged copies
    #[must_use]
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }
}

impl FileTransfer for LocalFileTransfer {
    fn publish(&self, path: &Path) -> Result<RemoteFile> {
        let name = file_name_of(path)?;
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let staged = self
            .staging_dir
            .join(format!("{}-{seq}-{name}", std::process::id()));

        let size = fs::copy(path, &staged).map_err(|e| {
            Error::StorageError(format!("Failed to stage '{}': {e}", path.display()))
        })?;
        let checksum = md5_file(&staged)?;
        tracing::debug!(file = %name, staged = %staged.display(), size, "Staged file for transfer");

        Ok(RemoteFile {
            name,
            location: staged,
            size,
            checksum: Some(checksum),
        })
    }

    fn fetch(&self, remote: &RemoteFile, dest: &Path) -> Result<u64> {
        if !remote.location.is_file() {
            return Err(Error::NotFound(format!(
                "'{}' is no longer at '{}'",
                remote.name,
                remote.location.display()
            )));
        }
        let written = fs::copy(&remote.location, dest).map_err(|e| {
            Error::StorageError(format!(
                "Failed to copy '{}' to '{}': {e}",
                remote.location.display(),
                dest.display()
            ))
        })?;
        if written != remote.size {
            return Err(Error::StorageError(format!(
                "Short transfer of '{}': expected {} bytes, got {written}",
                remote.name, remote.size
            )));
        }
        if let Some(expected) = &remote.checksum {
            let actual = md5_file(dest)?;
            if &actual != expected {
                return Err(Error::ChecksumMismatch {
                    file_name: remote.name.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(written)
    }

    fn release(&self, remote: &RemoteFile) -> Result<()> {
        if remote.location.parent() != Some(self.staging_dir.as_path()) {
            return Ok(());
        }
        match fs::remove_file(&remote.location) {
            Ok(()) => {
                tracing::debug!(file = %remote.name, staged = %remote.location.display(), "Released staged copy");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::StorageError(format!(
                "Failed to release '{}': {e}",
                remote.location.display()
            ))),
        }
    }
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidInput(format!("'{}' has no file name", path.display())))
}
