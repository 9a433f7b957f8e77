//! Node configuration
//!
//! Resolved once at startup (from a JSON file or defaults) and handed to
//! [`BitarchiveNode`](crate::node::BitarchiveNode) explicitly.
//!
//! ```rust
//! use bitarchive::config::NodeConfig;
//!
//! let config: NodeConfig = serde_json::from_str(
//!     r#"{ "storage_dirs": ["/data/ba1"], "credentials": "secret" }"#,
//! )?;
//! assert_eq!(config.heartbeat_interval().as_secs(), 60);
//! config.validate()?;
//! # Ok::<(), bitarchive::Error>(())
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One gigabyte, the default free-space floor below which uploads stop.
pub const DEFAULT_MIN_FREE_SPACE_BYTES: u64 = 1_000_000_000;

/// Largest record a get reply carries inline, 64 MiB.
pub const DEFAULT_MAX_RECORD_BYTES: u64 = 64 * 1024 * 1024;

/// Names of the bus channels a node talks on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Channel every bitarchive listens on for get/batch/remove/get-file
    pub all_bitarchives: String,
    /// Shared channel where one bitarchive with free space picks up uploads
    pub any_bitarchive: String,
    /// Monitor channel receiving heartbeats and batch results
    pub monitor: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            all_bitarchives: "ALL_BA".to_string(),
            any_bitarchive: "ANY_BA".to_string(),
            monitor: "THE_BAMON".to_string(),
        }
    }
}

/// Configuration for a single bitarchive node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Storage roots; each gets `filedir/`, `tempdir/` and `atticdir/`
    pub storage_dirs: Vec<PathBuf>,
    /// Directory used to stage files handed out to other nodes
    pub staging_dir: PathBuf,
    /// Uploads are refused when no storage root has more free bytes than this
    pub min_free_space_bytes: u64,
    /// Refuse uploads regardless of free space
    pub read_only: bool,
    /// Interval between heartbeats to the monitor
    pub heartbeat_interval_ms: u64,
    /// Interval between periodic admission re-checks
    pub admission_check_interval_ms: u64,
    /// How long `terminate` waits for an interrupted batch job
    pub batch_termination_grace_ms: u64,
    /// Get replies carry at most this many bytes; longer records are cut
    pub max_record_bytes: u64,
    /// Credentials a remove request must present
    pub credentials: String,
    /// Suffix appended to the node identity, if any
    pub application_instance_id: Option<String>,
    /// Bus channel names
    pub channels: ChannelConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            storage_dirs: vec![PathBuf::from("bitarchive")],
            staging_dir: PathBuf::from("bitarchive-staging"),
            min_free_space_bytes: DEFAULT_MIN_FREE_SPACE_BYTES,
            read_only: false,
            heartbeat_interval_ms: 60_000,
            admission_check_interval_ms: 60_000,
            batch_termination_grace_ms: 1_000,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            credentials: String::new(),
            application_instance_id: None,
            channels: ChannelConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, is not valid JSON, or fails
    /// [`validate`](Self::validate).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Self::from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON file without validating it, so callers can apply
    /// overrides first.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is not valid JSON.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::InvalidInput(format!(
                "Cannot read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Check that the configuration can run a node.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.storage_dirs.is_empty() {
            return Err(Error::InvalidInput(
                "storage_dirs must name at least one directory".to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::InvalidInput(
                "heartbeat_interval_ms must be > 0".to_string(),
            ));
        }
        if self.admission_check_interval_ms == 0 {
            return Err(Error::InvalidInput(
                "admission_check_interval_ms must be > 0".to_string(),
            ));
        }
        if self.max_record_bytes == 0 {
            return Err(Error::InvalidInput(
                "max_record_bytes must be > 0".to_string(),
            ));
        }
        if self.credentials.is_empty() {
            return Err(Error::InvalidInput(
                "credentials must not be empty".to_string(),
            ));
        }
        let channels = &self.channels;
        if channels.all_bitarchives.is_empty()
            || channels.any_bitarchive.is_empty()
            || channels.monitor.is_empty()
        {
            return Err(Error::InvalidInput(
                "channel names must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Heartbeat interval as a `Duration`
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Admission re-check interval as a `Duration`
    #[must_use]
    pub const fn admission_check_interval(&self) -> Duration {
        Duration::from_millis(self.admission_check_interval_ms)
    }

    /// Batch termination grace period as a `Duration`
    #[must_use]
    pub const fn batch_termination_grace(&self) -> Duration {
        Duration::from_millis(self.batch_termination_grace_ms)
    }
}
