//! Admission control for uploads
//!
//! A node takes new files only while at least one storage root has more free
//! space than the configured floor and the node is not in read-only mode.
//! The dispatcher consults this at startup, after every upload attempt and on
//! a periodic timer, and subscribes/unsubscribes the shared store channel.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Source of free-space figures for a filesystem path.
pub trait SpaceProbe: Send + Sync {
    /// Free bytes available to this process on the volume holding `path`.
    ///
    /// # Errors
    ///
    /// Returns error if the volume cannot be determined.
    fn free_bytes(&self, path: &Path) -> Result<u64>;
}

/// Probe backed by the operating system's mounted-disk table.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskSpaceProbe;

impl SpaceProbe for DiskSpaceProbe {
    fn free_bytes(&self, path: &Path) -> Result<u64> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let disks = sysinfo::Disks::new_with_refreshed_list();

        // The volume holding `path` is the one with the longest matching mount point.
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(sysinfo::Disk::available_space)
            .ok_or_else(|| {
                Error::StorageError(format!("No mounted volume holds '{}'", path.display()))
            })
    }
}

/// Probe reporting a settable figure for every path.
///
/// Useful for single-host setups and for exercising the space-exhausted path.
#[derive(Debug)]
pub struct FixedSpaceProbe {
    free: AtomicU64,
}

impl FixedSpaceProbe {
    /// Create a probe reporting `free` bytes everywhere
    #[must_use]
    pub const fn new(free: u64) -> Self {
        Self {
            free: AtomicU64::new(free),
        }
    }

    /// Change the reported figure
    pub fn set_free_bytes(&self, free: u64) {
        self.free.store(free, Ordering::SeqCst);
    }
}

impl SpaceProbe for FixedSpaceProbe {
    fn free_bytes(&self, _path: &Path) -> Result<u64> {
        Ok(self.free.load(Ordering::SeqCst))
    }
}

/// Snapshot of the admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionState {
    /// Some storage root has more free space than the floor
    pub enough_space: bool,
    /// Node is configured to refuse uploads
    pub read_only: bool,
}

impl AdmissionState {
    /// Whether the node should listen for uploads
    #[must_use]
    pub const fn accepts_uploads(&self) -> bool {
        self.enough_space && !self.read_only
    }
}

/// Tracks free space and read-only mode for a set of storage roots.
pub struct AdmissionController {
    probe: Arc<dyn SpaceProbe>,
    roots: Vec<PathBuf>,
    min_free_bytes: u64,
    read_only: AtomicBool,
}

impl AdmissionController {
    /// Create a controller over `roots`
    #[must_use]
    pub fn new(
        probe: Arc<dyn SpaceProbe>,
        roots: Vec<PathBuf>,
        min_free_bytes: u64,
        read_only: bool,
    ) -> Self {
        Self {
            probe,
            roots,
            min_free_bytes,
            read_only: AtomicBool::new(read_only),
        }
    }

    /// True iff some storage root has more free space than the floor.
    #[must_use]
    pub fn has_enough_space(&self) -> bool {
        self.roots.iter().any(|root| self.root_has_enough_space(root))
    }

    /// True iff the volume holding `root` has more free space than the floor.
    ///
    /// A probe failure counts as not enough space.
    #[must_use]
    pub fn root_has_enough_space(&self, root: &Path) -> bool {
        self.root_can_hold(root, 0)
    }

    /// True iff `incoming` more bytes fit on the volume holding `root` while
    /// staying above the floor.
    #[must_use]
    pub fn root_can_hold(&self, root: &Path, incoming: u64) -> bool {
        match self.probe.free_bytes(root) {
            Ok(free) => free > self.min_free_bytes.saturating_add(incoming),
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "Cannot determine free space");
                false
            }
        }
    }

    /// True iff the node refuses uploads regardless of space
    #[must_use]
    pub fn is_read_only_mode(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Switch read-only mode on or off
    pub fn set_read_only_mode(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Configured free-space floor in bytes
    #[must_use]
    pub const fn min_free_bytes(&self) -> u64 {
        self.min_free_bytes
    }

    /// Recompute the admission decision
    #[must_use]
    pub fn state(&self) -> AdmissionState {
        AdmissionState {
            enough_space: self.has_enough_space(),
            read_only: self.is_read_only_mode(),
        }
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("roots", &self.roots)
            .field("min_free_bytes", &self.min_free_bytes)
            .field("read_only", &self.is_read_only_mode())
            .finish_non_exhaustive()
    }
}
