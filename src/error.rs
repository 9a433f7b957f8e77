//! Error types for the bitarchive node
//!
//! Every failure a request handler can hit maps to one variant here. The
//! dispatcher turns these into `NotOk` replies; nothing escapes a handler.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Bitarchive error types
#[derive(Error, Debug)]
pub enum Error {
    /// File is not held by this node
    #[error("File not found: {0}")]
    NotFound(String),

    /// Removal credentials did not match the node's configured credentials
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Stored content does not match the checksum supplied by the caller
    #[error("Checksum mismatch for '{file_name}': expected {expected}, found {actual}")]
    ChecksumMismatch {
        /// Archive file name
        file_name: String,
        /// Checksum supplied by the requester
        expected: String,
        /// Checksum computed from the stored file
        actual: String,
    },

    /// A file with this name is already stored on this node
    #[error("File already stored: {0}")]
    AlreadyExists(String),

    /// No storage directory has enough free space (or node is read-only)
    #[error("No space left for upload: {0}")]
    CapacityExhausted(String),

    /// Read/write/rename failure in local storage
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Batch job failed as a whole (initialize/finish failure or panic)
    #[error("Batch job failed: {0}")]
    BatchFailed(String),

    /// Invalid input (bad index, empty name, invalid configuration)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Message bus channel is closed or has no subscriber
    #[error("Message bus error: {0}")]
    Bus(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}
