//! Message contract between archive nodes, clients and the monitor
//!
//! Requests arrive wrapped in a [`RequestEnvelope`] carrying a correlation id
//! and the channel to answer on. Replies, batch results and heartbeats are
//! plain serde types.

use crate::batch::{BatchJob, BatchState, BatchStatus};
use crate::identity::NodeIdentity;
use crate::storage::{ArchivedFile, StorageRecord};
use crate::transfer::RemoteFile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Correlation id of a message, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(u64);

impl MessageId {
    /// Allocate a fresh id
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// Delivery semantics of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Each message goes to exactly one subscriber; held while none listen
    Queue,
    /// Each message goes to every current subscriber
    Topic,
}

/// A named bus channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId {
    name: String,
    kind: ChannelKind,
}

impl ChannelId {
    /// Point-to-point channel
    #[must_use]
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ChannelKind::Queue,
        }
    }

    /// Broadcast channel
    #[must_use]
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ChannelKind::Topic,
        }
    }

    /// Channel name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Delivery semantics
    #[must_use]
    pub const fn kind(&self) -> ChannelKind {
        self.kind
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Requests a node answers.
#[derive(Debug, Clone)]
pub enum Request {
    /// Read the record at `index` of `file_name`
    Get {
        /// Archive file name
        file_name: String,
        /// Byte offset
        index: u64,
    },
    /// Store the content behind `file` as `file_name`
    Upload {
        /// Where to fetch the bytes
        file: RemoteFile,
        /// Name to store under
        file_name: String,
    },
    /// Move `file_name` to the attic and hand back a copy
    RemoveAndGetFile {
        /// Archive file name
        file_name: String,
        /// Expected MD5 of the stored content
        checksum: String,
        /// Removal credentials
        credentials: String,
    },
    /// Run `job` over local files
    Batch {
        /// Caller-chosen batch id
        batch_id: String,
        /// Job to run
        job: Box<dyn BatchJob>,
    },
    /// Stop the running batch `batch_id`
    BatchTermination {
        /// Batch to stop
        batch_id: String,
    },
    /// Hand back a copy of `file_name`
    GetFile {
        /// Archive file name
        file_name: String,
    },
}

impl Request {
    /// Short kind name for logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Get { .. } => "Get",
            Self::Upload { .. } => "Upload",
            Self::RemoveAndGetFile { .. } => "RemoveAndGetFile",
            Self::Batch { .. } => "Batch",
            Self::BatchTermination { .. } => "BatchTermination",
            Self::GetFile { .. } => "GetFile",
        }
    }
}

/// A request plus its routing metadata.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    /// Correlation id replies refer to
    pub id: MessageId,
    /// Channel replies go to
    pub reply_to: ChannelId,
    /// The request itself
    pub body: Request,
}

impl RequestEnvelope {
    /// Wrap `body` with a fresh id
    #[must_use]
    pub fn new(reply_to: ChannelId, body: Request) -> Self {
        Self {
            id: MessageId::next(),
            reply_to,
            body,
        }
    }
}

/// Whether a request succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    /// Success
    Ok,
    /// Failure with a reason
    NotOk {
        /// Error text
        reason: String,
    },
}

impl ReplyStatus {
    /// Failure carrying `reason`
    #[must_use]
    pub fn not_ok(reason: impl Into<String>) -> Self {
        Self::NotOk {
            reason: reason.into(),
        }
    }

    /// Whether the request succeeded
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Payload of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyBody {
    /// Answer to a get
    Record(StorageRecord),
    /// Answer to an upload
    Stored(ArchivedFile),
    /// Answer to a get-file or remove
    File(RemoteFile),
    /// No payload
    Empty,
}

/// Answer to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    /// Id of the request answered
    pub in_reply_to: MessageId,
    /// Answering node
    pub from: NodeIdentity,
    /// Outcome
    pub status: ReplyStatus,
    /// Payload
    pub body: ReplyBody,
}

/// Final report of a batch job on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEnded {
    /// Id of the originating batch request
    pub request_id: MessageId,
    /// Batch id from the request
    pub batch_id: String,
    /// Node the job ran on
    pub node: NodeIdentity,
    /// Terminal state
    pub state: BatchState,
    /// Per-file results; absent if the job itself failed
    pub status: Option<BatchStatus>,
    /// Overall outcome
    pub outcome: ReplyStatus,
}

/// Liveness announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Announcing node
    pub node: NodeIdentity,
    /// Send time
    pub sent_at: DateTime<Utc>,
}

/// Anything travelling on the bus.
#[derive(Debug, Clone)]
pub enum Message {
    /// Inbound request
    Request(RequestEnvelope),
    /// Answer to a request
    Reply(Reply),
    /// Batch job result
    BatchEnded(BatchEnded),
    /// Liveness announcement
    Heartbeat(Heartbeat),
}
