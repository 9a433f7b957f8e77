//! # Bitarchive: storage node of a replicated web archive
//!
//! A bitarchive node holds a shard of archived web content on local disk and
//! answers requests arriving over a message bus:
//!
//! - **Get** a record (byte offset into an archive file)
//! - **Upload** a new archive file, while free space allows
//! - **Remove** a file into the attic, guarded by credentials and checksum
//! - **Batch** jobs over every local file, cancellable by batch id
//! - **GetFile** to hand a copy of a file to another node
//!
//! It announces its liveness to a monitor channel with periodic heartbeats.
//!
//! ## Design Principles
//!
//! - Files are write-once: uploads land in a temp directory and are renamed
//!   into place; removals are renames into the attic, never deletes
//! - Uploads on one node are serialized; reads take no lock
//! - One task per request; a failing handler never takes the listener down
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use bitarchive::admission::DiskSpaceProbe;
//! use bitarchive::bus::InMemoryBus;
//! use bitarchive::config::NodeConfig;
//! use bitarchive::node::BitarchiveNode;
//! use bitarchive::notify::LogNotifier;
//! use bitarchive::transfer::LocalFileTransfer;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> bitarchive::Result<()> {
//! let config = NodeConfig::load("bitarchive.json")?;
//! let transfer = Arc::new(LocalFileTransfer::new(&config.staging_dir)?);
//! let node = BitarchiveNode::new(
//!     config,
//!     Arc::new(InMemoryBus::new()),
//!     Arc::new(DiskSpaceProbe),
//!     Arc::new(LogNotifier),
//!     transfer,
//! )?;
//! node.start()?;
//! // ... serve until asked to stop
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod admission;
pub mod batch;
pub mod bus;
pub mod checksum;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod identity;
pub mod message;
pub mod monitor;
pub mod node;
pub mod notify;
pub mod storage;
pub mod transfer;

pub use error::{Error, Result};
