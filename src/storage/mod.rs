//! Local store (filedir/tempdir/atticdir per storage root)
//!
//! **Write pattern**: whole-file, write-once.
//! - Upload: fetch into `tempdir`, rename into `filedir`
//! - Remove: rename from `filedir` into `atticdir`, never deleted
//! - Reads take no lock; uploads are serialized by one per-node lock
//!
//! A file name is unique across all storage roots of a node.

pub mod layout;
pub mod record;

pub use layout::{validate_file_name, StorageDir};
pub use record::{ArchivedFile, StorageRecord};

use crate::admission::AdmissionController;
use crate::config::DEFAULT_MAX_RECORD_BYTES;
use crate::checksum::md5_file;
use crate::transfer::{FileTransfer, RemoteFile};
use crate::{Error, Result};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// The archive files held by one node.
pub struct ArchiveStore {
    dirs: Vec<StorageDir>,
    admission: Arc<AdmissionController>,
    transfer: Arc<dyn FileTransfer>,
    credentials: String,
    max_record_bytes: u64,
    upload_lock: Mutex<()>,
}

impl ArchiveStore {
    /// Open the store over `roots`, creating missing directories.
    ///
    /// # Errors
    ///
    /// Returns error if no roots are given, a directory cannot be created, or
    /// a temp directory is not writable.
    pub fn open(
        roots: &[PathBuf],
        admission: Arc<AdmissionController>,
        transfer: Arc<dyn FileTransfer>,
        credentials: impl Into<String>,
    ) -> Result<Self> {
        if roots.is_empty() {
            return Err(Error::InvalidInput(
                "at least one storage directory is required".to_string(),
            ));
        }
        let dirs = roots
            .iter()
            .map(StorageDir::create)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            dirs,
            admission,
            transfer,
            credentials: credentials.into(),
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            upload_lock: Mutex::new(()),
        })
    }

    /// Cap the bytes a single get returns
    #[must_use]
    pub const fn with_max_record_bytes(mut self, max_record_bytes: u64) -> Self {
        self.max_record_bytes = max_record_bytes;
        self
    }

    /// Storage roots in upload preference order
    #[must_use]
    pub fn dirs(&self) -> &[StorageDir] {
        &self.dirs
    }

    /// Shared file transfer
    #[must_use]
    pub fn transfer(&self) -> &Arc<dyn FileTransfer> {
        &self.transfer
    }

    /// Active path of `file_name`, if held here.
    ///
    /// Names that could escape the storage directory are never held.
    #[must_use]
    pub fn get_file(&self, file_name: &str) -> Option<PathBuf> {
        if validate_file_name(file_name).is_err() {
            return None;
        }
        self.dirs
            .iter()
            .map(|dir| dir.file_path(file_name))
            .find(|path| path.is_file())
    }

    /// Read the record at byte offset `index` of `file_name`.
    ///
    /// Returns `Ok(None)` if the file is not held here. At most the record cap
    /// is read; the record is flagged `truncated` if the file goes on.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `index` lies past the end of the file and
    /// `Io` if the file cannot be read.
    pub fn get(&self, file_name: &str, index: u64) -> Result<Option<StorageRecord>> {
        let Some(path) = self.get_file(file_name) else {
            tracing::debug!(file = %file_name, "Get for file not held here");
            return Ok(None);
        };

        let mut file = File::open(&path)?;
        let len = file.metadata()?.len();
        // An empty file has exactly one record: the empty one at offset 0.
        if index > len || (index == len && len > 0) {
            return Err(Error::InvalidInput(format!(
                "index {index} is past the end of '{file_name}' ({len} bytes)"
            )));
        }

        let wanted = (len - index).min(self.max_record_bytes);
        file.seek(SeekFrom::Start(index))?;
        let mut data = Vec::with_capacity(usize::try_from(wanted).unwrap_or(0));
        file.take(wanted).read_to_end(&mut data)?;
        let truncated = index + (data.len() as u64) < len;
        if truncated {
            tracing::debug!(file = %file_name, index, len, cap = self.max_record_bytes, "Record cut at cap");
        }
        tracing::trace!(file = %file_name, index, bytes = data.len(), "Read record");

        Ok(Some(StorageRecord {
            file_name: file_name.to_string(),
            index,
            data,
            truncated,
        }))
    }

    /// Store the content behind `source` under `file_name`.
    ///
    /// Uploads on one store run one at a time. The bytes land in the temp
    /// directory of the chosen root and are renamed into place, so a stored
    /// file is never observed half-written. A staged source is released once
    /// stored.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists` if `file_name` is already held (stored copy untouched)
    /// - `CapacityExhausted` if read-only or no root can take the file
    /// - `StorageError`/`Io`/`ChecksumMismatch` if the transfer fails
    pub fn upload(&self, source: &RemoteFile, file_name: &str) -> Result<ArchivedFile> {
        validate_file_name(file_name)?;
        let _guard = self
            .upload_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if self.get_file(file_name).is_some() {
            return Err(Error::AlreadyExists(file_name.to_string()));
        }
        if self.admission.is_read_only_mode() {
            return Err(Error::CapacityExhausted(format!(
                "node is read-only, refusing '{file_name}'"
            )));
        }
        let dir = self
            .dirs
            .iter()
            .find(|dir| self.admission.root_can_hold(dir.root(), source.size()))
            .ok_or_else(|| {
                Error::CapacityExhausted(format!(
                    "no storage directory can hold '{file_name}' ({} bytes)",
                    source.size()
                ))
            })?;

        let temp = dir.temp_path(file_name);
        let dest = dir.file_path(file_name);
        if let Err(e) = self.transfer.fetch(source, &temp).and_then(|_| {
            fs::rename(&temp, &dest).map_err(|e| {
                Error::StorageError(format!(
                    "Failed to move '{}' into '{}': {e}",
                    temp.display(),
                    dest.display()
                ))
            })
        }) {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }

        if let Err(e) = self.transfer.release(source) {
            tracing::warn!(file = %file_name, error = %e, "Could not release upload source");
        }

        let stored = describe(file_name, &dest)?;
        tracing::info!(
            file = %file_name,
            size = stored.size,
            checksum = %stored.checksum,
            root = %dir.root().display(),
            "Stored file"
        );
        Ok(stored)
    }

    /// Move `file_name` into the attic after checking credentials and checksum.
    ///
    /// Returns `Ok(None)` if the file is not held here and the attic path on
    /// success. Checksums compare case-insensitively.
    ///
    /// # Errors
    ///
    /// - `PermissionDenied` if `credentials` do not match (file untouched)
    /// - `ChecksumMismatch` if the content differs from `expected_checksum`
    ///   (file untouched)
    /// - `StorageError`/`Io` if the file cannot be read or moved
    pub fn remove_and_quarantine(
        &self,
        file_name: &str,
        expected_checksum: &str,
        credentials: &str,
    ) -> Result<Option<PathBuf>> {
        let Some((dir, path)) = self.locate(file_name) else {
            tracing::info!(file = %file_name, "Remove for file not held here");
            return Ok(None);
        };

        if credentials.is_empty() || credentials != self.credentials {
            tracing::warn!(file = %file_name, "Attempt to remove file with wrong credentials");
            return Err(Error::PermissionDenied(format!(
                "wrong credentials for removing '{file_name}'"
            )));
        }

        let actual = md5_file(&path)?;
        if !actual.eq_ignore_ascii_case(expected_checksum) {
            tracing::warn!(
                file = %file_name,
                expected = %expected_checksum,
                actual = %actual,
                "Refusing to remove file with unexpected checksum"
            );
            return Err(Error::ChecksumMismatch {
                file_name: file_name.to_string(),
                expected: expected_checksum.to_string(),
                actual,
            });
        }

        let attic = dir.attic_path(file_name);
        fs::rename(&path, &attic).map_err(|e| {
            Error::StorageError(format!(
                "Failed to move '{}' to attic '{}': {e}",
                path.display(),
                attic.display()
            ))
        })?;
        tracing::warn!(file = %file_name, attic = %attic.display(), checksum = %actual, "Removed file");
        Ok(Some(attic))
    }

    /// Names of all active files across roots, sorted
    ///
    /// # Errors
    ///
    /// Returns `Io` if a file directory cannot be listed.
    pub fn list_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for dir in &self.dirs {
            names.extend(dir.file_names()?);
        }
        names.sort();
        Ok(names)
    }

    /// Size and checksum of a held file, `None` if not held
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read.
    pub fn archived_file(&self, file_name: &str) -> Result<Option<ArchivedFile>> {
        self.get_file(file_name)
            .map(|path| describe(file_name, &path))
            .transpose()
    }

    /// Paths of all active files, for batch jobs
    ///
    /// # Errors
    ///
    /// Returns `Io` if a file directory cannot be listed.
    pub fn file_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for dir in &self.dirs {
            paths.extend(dir.file_names()?.iter().map(|n| dir.file_path(n)));
        }
        paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(paths)
    }

    fn locate(&self, file_name: &str) -> Option<(&StorageDir, PathBuf)> {
        if validate_file_name(file_name).is_err() {
            return None;
        }
        self.dirs.iter().find_map(|dir| {
            let path = dir.file_path(file_name);
            path.is_file().then_some((dir, path))
        })
    }
}

fn describe(file_name: &str, path: &Path) -> Result<ArchivedFile> {
    Ok(ArchivedFile {
        name: file_name.to_string(),
        size: fs::metadata(path)?.len(),
        checksum: md5_file(path)?,
    })
}

impl std::fmt::Debug for ArchiveStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveStore")
            .field("dirs", &self.dirs)
            .field("admission", &self.admission)
            .field("max_record_bytes", &self.max_record_bytes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::FixedSpaceProbe;
    use crate::checksum::md5_hex;
    use crate::transfer::LocalFileTransfer;
    use tempfile::TempDir;

    const CREDENTIALS: &str = "secret";

    struct Fixture {
        tmp: TempDir,
        probe: Arc<FixedSpaceProbe>,
        admission: Arc<AdmissionController>,
        store: ArchiveStore,
    }

    fn fixture(roots: usize) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let roots: Vec<PathBuf> = (0..roots).map(|i| tmp.path().join(format!("ba{i}"))).collect();
        let probe = Arc::new(FixedSpaceProbe::new(1_000_000));
        let admission = Arc::new(AdmissionController::new(probe.clone(), roots.clone(), 1000, false));
        let transfer = Arc::new(LocalFileTransfer::new(tmp.path().join("staging")).unwrap());
        let store = ArchiveStore::open(&roots, admission.clone(), transfer, CREDENTIALS).unwrap();
        Fixture {
            tmp,
            probe,
            admission,
            store,
        }
    }

    fn source(fx: &Fixture, name: &str, data: &[u8]) -> RemoteFile {
        let path = fx.tmp.path().join(format!("src-{name}"));
        fs::write(&path, data).unwrap();
        RemoteFile::local(&path).unwrap()
    }

    #[test]
    fn test_upload_then_get() {
        let fx = fixture(1);
        let stored = fx
            .store
            .upload(&source(&fx, "a", b"0123456789"), "a.arc")
            .unwrap();
        assert_eq!(stored.size, 10);
        assert_eq!(stored.checksum, md5_hex(b"0123456789"));

        let record = fx.store.get("a.arc", 4).unwrap().unwrap();
        assert_eq!(record.index, 4);
        assert_eq!(record.data, b"456789");
    }

    #[test]
    fn test_get_is_cut_at_record_cap() {
        let fx = fixture(1);
        let store = fx.store.with_max_record_bytes(4);
        let src = fx.tmp.path().join("src-cap");
        fs::write(&src, b"0123456789").unwrap();
        store.upload(&RemoteFile::local(&src).unwrap(), "a.arc").unwrap();

        let head = store.get("a.arc", 0).unwrap().unwrap();
        assert_eq!(head.data, b"0123");
        assert!(head.truncated);

        let tail = store.get("a.arc", 6).unwrap().unwrap();
        assert_eq!(tail.data, b"6789");
        assert!(!tail.truncated);
    }

    #[test]
    fn test_get_absent_is_none() {
        let fx = fixture(1);
        assert!(fx.store.get("missing.arc", 0).unwrap().is_none());
        assert!(fx.store.get_file("missing.arc").is_none());
    }

    #[test]
    fn test_get_index_past_end_is_error() {
        let fx = fixture(1);
        fx.store.upload(&source(&fx, "a", b"abc"), "a.arc").unwrap();

        assert!(fx.store.get("a.arc", 2).unwrap().is_some());
        let err = fx.store.get("a.arc", 3).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_get_empty_file_at_zero() {
        let fx = fixture(1);
        fx.store.upload(&source(&fx, "e", b""), "empty.arc").unwrap();
        let record = fx.store.get("empty.arc", 0).unwrap().unwrap();
        assert!(record.is_empty());
        assert!(fx.store.get("empty.arc", 1).is_err());
    }

    #[test]
    fn test_duplicate_upload_keeps_original() {
        let fx = fixture(1);
        fx.store.upload(&source(&fx, "v1", b"first"), "a.arc").unwrap();
        let err = fx
            .store
            .upload(&source(&fx, "v2", b"second"), "a.arc")
            .unwrap_err();

        assert!(matches!(err, Error::AlreadyExists(_)));
        let path = fx.store.get_file("a.arc").unwrap();
        assert_eq!(fs::read(path).unwrap(), b"first");
    }

    #[test]
    fn test_upload_refused_without_space() {
        let fx = fixture(1);
        fx.probe.set_free_bytes(500);
        let err = fx.store.upload(&source(&fx, "a", b"x"), "a.arc").unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted(_)));
        assert!(fx.store.get_file("a.arc").is_none());
    }

    #[test]
    fn test_upload_refused_when_read_only() {
        let fx = fixture(1);
        fx.admission.set_read_only_mode(true);
        let err = fx.store.upload(&source(&fx, "a", b"x"), "a.arc").unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted(_)));
    }

    #[test]
    fn test_failed_transfer_leaves_no_temp_file() {
        let fx = fixture(1);
        let src = source(&fx, "a", b"content").with_checksum("not-the-md5");
        let err = fx.store.upload(&src, "a.arc").unwrap_err();

        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert!(fx.store.get_file("a.arc").is_none());
        assert!(!fx.store.dirs()[0].temp_path("a.arc").exists());
    }

    #[test]
    fn test_upload_rejects_path_names() {
        let fx = fixture(1);
        let err = fx
            .store
            .upload(&source(&fx, "a", b"x"), "../escape.arc")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_remove_moves_to_attic() {
        let fx = fixture(1);
        fx.store.upload(&source(&fx, "a", b"payload"), "a.arc").unwrap();

        let attic = fx
            .store
            .remove_and_quarantine("a.arc", &md5_hex(b"payload").to_uppercase(), CREDENTIALS)
            .unwrap()
            .unwrap();

        assert!(fx.store.get_file("a.arc").is_none());
        assert_eq!(fs::read(attic).unwrap(), b"payload");
    }

    #[test]
    fn test_remove_absent_is_none() {
        let fx = fixture(1);
        let removed = fx
            .store
            .remove_and_quarantine("missing.arc", "00", CREDENTIALS)
            .unwrap();
        assert!(removed.is_none());
    }

    #[test]
    fn test_remove_wrong_credentials_leaves_file() {
        let fx = fixture(1);
        fx.store.upload(&source(&fx, "a", b"payload"), "a.arc").unwrap();

        for bad in ["", "guess"] {
            let err = fx
                .store
                .remove_and_quarantine("a.arc", &md5_hex(b"payload"), bad)
                .unwrap_err();
            assert!(matches!(err, Error::PermissionDenied(_)));
        }
        assert!(fx.store.get_file("a.arc").is_some());
    }

    #[test]
    fn test_remove_wrong_checksum_leaves_file() {
        let fx = fixture(1);
        fx.store.upload(&source(&fx, "a", b"payload"), "a.arc").unwrap();

        let err = fx
            .store
            .remove_and_quarantine("a.arc", &md5_hex(b"other"), CREDENTIALS)
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert!(fx.store.get_file("a.arc").is_some());
    }

    #[test]
    fn test_lookup_spans_all_roots() {
        let fx = fixture(2);
        let second = &fx.store.dirs()[1];
        fs::write(second.file_path("b.arc"), b"bbb").unwrap();
        fx.store.upload(&source(&fx, "a", b"aaa"), "a.arc").unwrap();

        assert_eq!(fx.store.list_files().unwrap(), vec!["a.arc", "b.arc"]);
        assert!(fx.store.get_file("b.arc").unwrap().starts_with(second.root()));
        assert_eq!(fx.store.file_paths().unwrap().len(), 2);
        assert_eq!(
            fx.store.archived_file("b.arc").unwrap().unwrap().checksum,
            md5_hex(b"bbb")
        );
    }

    #[test]
    fn test_open_requires_a_root() {
        let tmp = tempfile::tempdir().unwrap();
        let admission = Arc::new(AdmissionController::new(
            Arc::new(FixedSpaceProbe::new(0)),
            Vec::new(),
            0,
            false,
        ));
        let transfer = Arc::new(LocalFileTransfer::new(tmp.path()).unwrap());
        assert!(ArchiveStore::open(&[], admission, transfer, CREDENTIALS).is_err());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn prop_get_returns_suffix_from_offset(
                data in proptest::collection::vec(any::<u8>(), 1..2048),
                offset_seed in any::<usize>(),
            ) {
                let fx = fixture(1);
                fx.store.upload(&source(&fx, "p", &data), "p.arc").unwrap();
                let index = offset_seed % data.len();

                let record = fx.store.get("p.arc", index as u64).unwrap().unwrap();
                prop_assert_eq!(&record.data[..], &data[index..]);
            }
        }
    }
}
