//! Batch jobs over locally held files
//!
//! A [`BatchJob`] is applied to every active file of a node on a background
//! task. The [`runner::BatchRunner`] tracks running jobs by batch id, supports
//! cooperative termination and publishes one `BatchEnded` per job.

pub mod jobs;
pub mod runner;

pub use jobs::{ChecksumJob, FileListJob};
pub use runner::{BatchRunner, TerminationOutcome};

use crate::identity::NodeIdentity;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::Path;

/// Restricts a job to a subset of file names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileFilter {
    /// Every file
    #[default]
    All,
    /// Exactly this name
    Exact(String),
    /// Names starting with this prefix
    Prefix(String),
    /// Names ending with this suffix
    Suffix(String),
}

impl FileFilter {
    /// Whether `file_name` passes the filter
    #[must_use]
    pub fn matches(&self, file_name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Exact(name) => file_name == name,
            Self::Prefix(prefix) => file_name.starts_with(prefix.as_str()),
            Self::Suffix(suffix) => file_name.ends_with(suffix.as_str()),
        }
    }
}

/// A processing job run over the files of one node.
///
/// The runner calls `initialize` once, `process_file` for each accepted file
/// and `finish` once, all with the same output sink. A `process_file` error
/// marks only that file as failed; an `initialize` or `finish` error fails the
/// whole job.
pub trait BatchJob: Send + Sync + fmt::Debug {
    /// Short human-readable job name
    fn name(&self) -> &str;

    /// Prepare before the first file
    ///
    /// # Errors
    ///
    /// Returns error if the job cannot start.
    fn initialize(&mut self, _output: &mut dyn Write) -> Result<()> {
        Ok(())
    }

    /// Process one file
    ///
    /// # Errors
    ///
    /// Returns error if this file could not be processed.
    fn process_file(&mut self, file: &Path, output: &mut dyn Write) -> Result<()>;

    /// Flush after the last file
    ///
    /// # Errors
    ///
    /// Returns error if the job cannot complete.
    fn finish(&mut self, _output: &mut dyn Write) -> Result<()> {
        Ok(())
    }

    /// Whether the job wants `file_name` at all
    fn accepts(&self, _file_name: &str) -> bool {
        true
    }

    /// Clone into a fresh box; broadcast delivery hands each node its own copy.
    fn box_clone(&self) -> Box<dyn BatchJob>;
}

impl Clone for Box<dyn BatchJob> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Lifecycle of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchState {
    /// Accepted, task not yet started
    Submitted,
    /// Processing files
    Running,
    /// Finished all files (some may have failed)
    Completed,
    /// The job itself failed
    Failed,
    /// Stopped by a termination request
    Interrupted,
}

impl BatchState {
    /// Whether no further transitions happen
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Interrupted)
    }
}

/// A file the job could not process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedFile {
    /// Archive file name
    pub file_name: String,
    /// Error text from the job
    pub error: String,
}

/// Result of running a job on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStatus {
    /// Node the job ran on
    pub node: NodeIdentity,
    /// Files the job was applied to, failed ones included
    pub files_processed: usize,
    /// Files that failed, with their errors
    pub files_failed: Vec<FailedFile>,
    /// Everything the job wrote
    pub output: Vec<u8>,
    /// When processing started
    pub started_at: DateTime<Utc>,
    /// When processing stopped
    pub ended_at: DateTime<Utc>,
}

impl BatchStatus {
    /// Whether every processed file succeeded
    #[must_use]
    pub fn has_no_failures(&self) -> bool {
        self.files_failed.is_empty()
    }

    /// Job output as text, lossily decoded
    #[must_use]
    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}
