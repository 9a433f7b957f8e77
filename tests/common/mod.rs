//! Shared harness for node-level tests: one in-process bus, a client reply
//! queue, and helpers to build nodes under a scratch directory.

#![allow(dead_code)]

use bitarchive::admission::FixedSpaceProbe;
use bitarchive::bus::{InMemoryBus, MessageBus, Subscription};
use bitarchive::config::{ChannelConfig, NodeConfig};
use bitarchive::message::{
    BatchEnded, ChannelId, Message, MessageId, Reply, Request, RequestEnvelope,
};
use bitarchive::node::BitarchiveNode;
use bitarchive::notify::{NotificationType, Notifier};
use bitarchive::transfer::{FileTransfer, LocalFileTransfer, RemoteFile};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const CREDENTIALS: &str = "s3cret";
pub const MIN_FREE: u64 = 1_000;
pub const PLENTY: u64 = 10_000_000;
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Notifier remembering every alert in order.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(String, NotificationType)>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<(String, NotificationType)> {
        self.messages.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str, kind: NotificationType) {
        self.messages.lock().unwrap().push((message.to_string(), kind));
    }
}

pub struct Harness {
    pub tmp: TempDir,
    pub bus: Arc<InMemoryBus>,
    pub probe: Arc<FixedSpaceProbe>,
    pub notifier: Arc<RecordingNotifier>,
    pub transfer: Arc<LocalFileTransfer>,
    pub channels: ChannelConfig,
    pub reply_channel: ChannelId,
    pub replies: Subscription,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let bus = Arc::new(InMemoryBus::new());
        let reply_channel = ChannelId::queue("CLIENT_REPLIES");
        let replies = bus.subscribe(&reply_channel).unwrap();
        let transfer = Arc::new(LocalFileTransfer::new(tmp.path().join("staging")).unwrap());
        Self {
            tmp,
            bus,
            probe: Arc::new(FixedSpaceProbe::new(PLENTY)),
            notifier: Arc::new(RecordingNotifier::default()),
            transfer,
            channels: ChannelConfig::default(),
            reply_channel,
            replies,
        }
    }

    pub fn config(&self, instance: &str) -> NodeConfig {
        NodeConfig {
            storage_dirs: vec![self.tmp.path().join(instance)],
            staging_dir: self.tmp.path().join("staging"),
            min_free_space_bytes: MIN_FREE,
            heartbeat_interval_ms: 3_600_000,
            admission_check_interval_ms: 3_600_000,
            batch_termination_grace_ms: 1_000,
            credentials: CREDENTIALS.to_string(),
            application_instance_id: Some(instance.to_string()),
            channels: self.channels.clone(),
            ..NodeConfig::default()
        }
    }

    pub fn node(&self, instance: &str) -> BitarchiveNode {
        self.node_with(self.config(instance), self.transfer.clone())
    }

    pub fn node_with(&self, config: NodeConfig, transfer: Arc<dyn FileTransfer>) -> BitarchiveNode {
        BitarchiveNode::new(
            config,
            self.bus.clone(),
            self.probe.clone(),
            self.notifier.clone(),
            transfer,
        )
        .unwrap()
    }

    /// Write `data` to a scratch file and describe it for upload.
    pub fn source(&self, name: &str, data: &[u8]) -> RemoteFile {
        let dir = self.tmp.path().join("sources");
        std::fs::create_dir_all(&dir).unwrap();
        let path: PathBuf = dir.join(name);
        std::fs::write(&path, data).unwrap();
        RemoteFile::local(&path).unwrap()
    }

    pub fn all_channel(&self) -> ChannelId {
        ChannelId::topic(&self.channels.all_bitarchives)
    }

    pub fn any_channel(&self) -> ChannelId {
        ChannelId::queue(&self.channels.any_bitarchive)
    }

    pub fn monitor_channel(&self) -> ChannelId {
        ChannelId::queue(&self.channels.monitor)
    }

    /// Send a request on the broadcast request channel.
    pub fn send_all(&self, body: Request) -> MessageId {
        self.send(&self.all_channel(), body)
    }

    /// Send a request on the shared store queue.
    pub fn send_any(&self, body: Request) -> MessageId {
        self.send(&self.any_channel(), body)
    }

    fn send(&self, channel: &ChannelId, body: Request) -> MessageId {
        let envelope = RequestEnvelope::new(self.reply_channel.clone(), body);
        let id = envelope.id;
        self.bus.send(channel, Message::Request(envelope)).unwrap();
        id
    }

    pub async fn reply(&mut self) -> Reply {
        let message = tokio::time::timeout(REPLY_TIMEOUT, self.replies.receiver.recv())
            .await
            .expect("timed out waiting for a reply")
            .expect("reply channel closed");
        match message {
            Message::Reply(reply) => reply,
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    /// True if no reply arrives within `wait`.
    pub async fn no_reply_within(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.replies.receiver.recv())
            .await
            .is_err()
    }
}

/// Next `BatchEnded` on a monitor subscription, skipping heartbeats.
pub async fn next_batch_ended(monitor: &mut Subscription) -> BatchEnded {
    loop {
        let message = tokio::time::timeout(REPLY_TIMEOUT, monitor.receiver.recv())
            .await
            .expect("timed out waiting for BatchEnded")
            .expect("monitor channel closed");
        match message {
            Message::BatchEnded(ended) => return ended,
            Message::Heartbeat(_) => {}
            other => panic!("unexpected message on monitor channel: {other:?}"),
        }
    }
}
