//! Stored-file and record descriptors

use serde::{Deserialize, Serialize};

/// A file held in active storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedFile {
    /// Archive file name, unique within the node's active storage
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Lowercase hex MD5 of the content
    pub checksum: String,
}

/// Payload answering a get request.
///
/// `index` is a byte offset into the container file; `data` runs from that
/// offset to the end of the file, cut at the node's record cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRecord {
    /// Archive file the record was read from
    pub file_name: String,
    /// Byte offset of the record within the file
    pub index: u64,
    /// Record bytes
    pub data: Vec<u8>,
    /// The file continues past `data`
    #[serde(default)]
    pub truncated: bool,
}

impl StorageRecord {
    /// Record length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the record carries no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
