//! The bitarchive node: message dispatcher over store, admission and batches
//!
//! A node listens on two channels:
//! - the broadcast request channel (get, batch, batch termination, remove,
//!   get-file), always
//! - the shared store queue (upload), only while admission allows uploads
//!
//! Every inbound request is handled on its own task. Blocking file work runs
//! on the blocking pool; a handler that fails or panics is answered with a
//! failure reply where a reply is owed, and the listener keeps going.

use crate::admission::{AdmissionController, SpaceProbe};
use crate::batch::{BatchJob, BatchRunner, BatchState};
use crate::bus::{MessageBus, Subscription, SubscriptionId};
use crate::config::NodeConfig;
use crate::heartbeat::HeartbeatSender;
use crate::identity::NodeIdentity;
use crate::message::{
    BatchEnded, ChannelId, Message, MessageId, Reply, ReplyBody, ReplyStatus, Request,
    RequestEnvelope,
};
use crate::notify::{NotificationType, Notifier};
use crate::storage::ArchiveStore;
use crate::transfer::{FileTransfer, RemoteFile};
use crate::Result;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// What the sender of a request is owed if its handler dies.
enum Owed {
    Reply,
    BatchEnded(String),
    Nothing,
}

impl Owed {
    fn of(request: &Request) -> Self {
        match request {
            Request::Get { .. }
            | Request::Upload { .. }
            | Request::RemoveAndGetFile { .. }
            | Request::GetFile { .. } => Self::Reply,
            Request::Batch { batch_id, .. } => Self::BatchEnded(batch_id.clone()),
            Request::BatchTermination { .. } => Self::Nothing,
        }
    }
}

/// Channels a node talks on.
#[derive(Debug, Clone)]
struct NodeChannels {
    all_bitarchives: ChannelId,
    any_bitarchive: ChannelId,
    monitor: ChannelId,
}

#[derive(Default)]
struct Listeners {
    requests: Option<SubscriptionId>,
    uploads: Option<SubscriptionId>,
}

struct NodeInner {
    config: NodeConfig,
    identity: NodeIdentity,
    channels: NodeChannels,
    bus: Arc<dyn MessageBus>,
    store: Arc<ArchiveStore>,
    admission: Arc<AdmissionController>,
    batches: BatchRunner,
    notifier: Arc<dyn Notifier>,
    listeners: Mutex<Listeners>,
    shutdown: CancellationToken,
}

/// A storage node answering requests from the bus.
pub struct BitarchiveNode {
    inner: Arc<NodeInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BitarchiveNode {
    /// Build a node from configuration and its collaborators.
    ///
    /// Creates the storage layout; nothing is received until
    /// [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or a storage directory
    /// cannot be prepared.
    pub fn new(
        config: NodeConfig,
        bus: Arc<dyn MessageBus>,
        probe: Arc<dyn SpaceProbe>,
        notifier: Arc<dyn Notifier>,
        transfer: Arc<dyn FileTransfer>,
    ) -> Result<Self> {
        config.validate()?;
        let identity = NodeIdentity::detect(config.application_instance_id.as_deref());
        let channels = NodeChannels {
            all_bitarchives: ChannelId::topic(&config.channels.all_bitarchives),
            any_bitarchive: ChannelId::queue(&config.channels.any_bitarchive),
            monitor: ChannelId::queue(&config.channels.monitor),
        };

        let admission = Arc::new(AdmissionController::new(
            probe,
            config.storage_dirs.clone(),
            config.min_free_space_bytes,
            config.read_only,
        ));
        let store = Arc::new(
            ArchiveStore::open(
                &config.storage_dirs,
                Arc::clone(&admission),
                transfer,
                config.credentials.clone(),
            )?
            .with_max_record_bytes(config.max_record_bytes),
        );
        let batches = BatchRunner::new(
            identity.clone(),
            Arc::clone(&store),
            Arc::clone(&bus),
            channels.monitor.clone(),
            config.batch_termination_grace(),
        );

        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                identity,
                channels,
                bus,
                store,
                admission,
                batches,
                notifier,
                listeners: Mutex::new(Listeners::default()),
                shutdown: CancellationToken::new(),
            }),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start listening, heartbeating and periodic admission checks.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Bus` if the request channel cannot be subscribed.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let subscription = inner.bus.subscribe(&inner.channels.all_bitarchives)?;
        lock(&inner.listeners).requests = Some(subscription.id);
        let mut tasks = lock(&self.tasks);
        tasks.push(tokio::spawn(Arc::clone(inner).listen(
            subscription,
            inner.channels.all_bitarchives.clone(),
        )));

        if !inner.admission.has_enough_space() {
            tracing::warn!(node = %inner.identity, "Not enough space to guarantee store will succeed");
        }
        inner.refresh_store_listener();

        tasks.push(
            HeartbeatSender::new(
                inner.identity.clone(),
                Arc::clone(&inner.bus),
                inner.channels.monitor.clone(),
                inner.config.heartbeat_interval(),
            )
            .spawn(inner.shutdown.child_token()),
        );
        tasks.push(tokio::spawn(Arc::clone(inner).admission_checks()));

        tracing::info!(
            node = %inner.identity,
            dirs = inner.store.dirs().len(),
            read_only = inner.admission.is_read_only_mode(),
            "Bitarchive node started"
        );
        Ok(())
    }

    /// Stop listening, heartbeating and admission checks, and signal running
    /// batches to stop. Idempotent.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        tracing::info!(node = %inner.identity, "Shutting down bitarchive node");
        inner.shutdown.cancel();

        let (requests, uploads) = {
            let mut listeners = lock(&inner.listeners);
            (listeners.requests.take(), listeners.uploads.take())
        };
        if let Some(id) = requests {
            inner.unsubscribe(&inner.channels.all_bitarchives, id);
        }
        if let Some(id) = uploads {
            inner.unsubscribe(&inner.channels.any_bitarchive, id);
        }
        inner.batches.cancel_all();

        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(node = %inner.identity, error = %e, "Node task ended abnormally");
            }
        }
        tracing::info!(node = %inner.identity, "Bitarchive node stopped");
    }

    /// Handle one request to completion, as the listener does.
    pub async fn dispatch(&self, envelope: RequestEnvelope) {
        Arc::clone(&self.inner).dispatch(envelope).await;
    }

    /// This node's identity
    #[must_use]
    pub fn identity(&self) -> &NodeIdentity {
        &self.inner.identity
    }

    /// Local store
    #[must_use]
    pub fn store(&self) -> &Arc<ArchiveStore> {
        &self.inner.store
    }

    /// Admission controller
    #[must_use]
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.inner.admission
    }

    /// Batch runner
    #[must_use]
    pub fn batches(&self) -> &BatchRunner {
        &self.inner.batches
    }

    /// Whether the node currently listens on the store channel
    #[must_use]
    pub fn is_listening_for_uploads(&self) -> bool {
        lock(&self.inner.listeners).uploads.is_some()
    }

    /// Switch read-only mode and re-evaluate the store channel.
    pub fn set_read_only_mode(&self, read_only: bool) {
        self.inner.admission.set_read_only_mode(read_only);
        self.inner.refresh_store_listener();
    }

    /// Re-evaluate admission now; returns whether uploads are accepted.
    pub fn check_admission(&self) -> bool {
        self.inner.refresh_store_listener()
    }
}

impl std::fmt::Debug for BitarchiveNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitarchiveNode")
            .field("identity", &self.inner.identity)
            .field("store", &self.inner.store)
            .field("batches", &self.inner.batches)
            .finish_non_exhaustive()
    }
}

impl NodeInner {
    async fn listen(self: Arc<Self>, mut subscription: Subscription, channel: ChannelId) {
        tracing::debug!(node = %self.identity, channel = %channel, "Listener started");
        while let Some(message) = subscription.receiver.recv().await {
            match message {
                Message::Request(envelope) => {
                    tracing::debug!(
                        channel = %channel,
                        id = %envelope.id,
                        kind = envelope.body.kind(),
                        "Received request"
                    );
                    tokio::spawn(Arc::clone(&self).dispatch(envelope));
                }
                other => tracing::debug!(channel = %channel, ?other, "Ignoring non-request message"),
            }
        }
        tracing::debug!(node = %self.identity, channel = %channel, "Listener stopped");
    }

    async fn admission_checks(self: Arc<Self>) {
        let period = self.config.admission_check_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.refresh_store_listener();
                }
            }
        }
    }

    async fn dispatch(self: Arc<Self>, envelope: RequestEnvelope) {
        let RequestEnvelope { id, reply_to, body } = envelope;
        let kind = body.kind();
        let owed = Owed::of(&body);

        let handler = Arc::clone(&self);
        let outcome = match body {
            Request::Batch { batch_id, job } => {
                tokio::spawn(async move { handler.handle_batch(id, &batch_id, job) }).await
            }
            Request::BatchTermination { batch_id } => {
                tokio::spawn(async move {
                    handler.batches.terminate(&batch_id).await;
                })
                .await
            }
            blocking => {
                let reply_to = reply_to.clone();
                tokio::task::spawn_blocking(move || handler.handle_file_request(id, &reply_to, blocking))
                    .await
            }
        };

        if let Err(e) = outcome {
            tracing::error!(node = %self.identity, %id, kind, error = %e, "Request handler failed");
            let reason = format!("{kind} handler failed: {e}");
            match owed {
                Owed::Reply => self.reply(id, &reply_to, ReplyStatus::not_ok(reason), ReplyBody::Empty),
                Owed::BatchEnded(batch_id) => self.publish(
                    &self.channels.monitor,
                    Message::BatchEnded(BatchEnded {
                        request_id: id,
                        batch_id,
                        node: self.identity.clone(),
                        state: BatchState::Failed,
                        status: None,
                        outcome: ReplyStatus::not_ok(reason),
                    }),
                ),
                Owed::Nothing => {}
            }
        }
    }

    fn handle_batch(&self, id: MessageId, batch_id: &str, job: Box<dyn BatchJob>) {
        if let Err(e) = self.batches.submit(id, batch_id, job) {
            tracing::warn!(node = %self.identity, batch_id, error = %e, "Batch not started");
        }
    }

    /// Get, upload, remove and get-file: blocking file work.
    fn handle_file_request(self: &Arc<Self>, id: MessageId, reply_to: &ChannelId, request: Request) {
        match request {
            Request::Get { file_name, index } => self.handle_get(id, reply_to, &file_name, index),
            Request::Upload { file, file_name } => {
                self.handle_upload(id, reply_to, &file, &file_name);
            }
            Request::RemoveAndGetFile {
                file_name,
                checksum,
                credentials,
            } => self.handle_remove(id, reply_to, &file_name, &checksum, &credentials),
            Request::GetFile { file_name } => self.handle_get_file(id, reply_to, &file_name),
            Request::Batch { .. } | Request::BatchTermination { .. } => {
                tracing::error!(%id, kind = request.kind(), "Routed to the wrong handler");
            }
        }
    }

    fn handle_get(&self, id: MessageId, reply_to: &ChannelId, file_name: &str, index: u64) {
        match self.store.get(file_name, index) {
            Ok(Some(record)) => {
                self.reply(id, reply_to, ReplyStatus::Ok, ReplyBody::Record(record));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(file = %file_name, index, error = %e, "Get failed");
                self.reply(id, reply_to, ReplyStatus::not_ok(e.to_string()), ReplyBody::Empty);
            }
        }
    }

    fn handle_upload(self: &Arc<Self>, id: MessageId, reply_to: &ChannelId, file: &RemoteFile, file_name: &str) {
        let (status, body) = match self.store.upload(file, file_name) {
            Ok(stored) => (ReplyStatus::Ok, ReplyBody::Stored(stored)),
            Err(e) => {
                tracing::warn!(file = %file_name, error = %e, "Upload failed");
                (ReplyStatus::not_ok(e.to_string()), ReplyBody::Empty)
            }
        };
        // The reply reflects the upload alone, whatever the recheck does.
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.refresh_store_listener())) {
            tracing::error!(
                node = %self.identity,
                file = %file_name,
                panic = panic_message(&*payload),
                "Admission recheck after upload failed"
            );
        }
        self.reply(id, reply_to, status, body);
    }

    fn handle_remove(
        &self,
        id: MessageId,
        reply_to: &ChannelId,
        file_name: &str,
        checksum: &str,
        credentials: &str,
    ) {
        self.notifier.notify(
            &format!(
                "Request to move file '{file_name}' with checksum '{checksum}' to attic on {}",
                self.identity
            ),
            NotificationType::Info,
        );

        match self.store.remove_and_quarantine(file_name, checksum, credentials) {
            Ok(None) => {}
            Ok(Some(attic)) => match self.store.transfer().publish(&attic) {
                Ok(copy) => self.reply(id, reply_to, ReplyStatus::Ok, ReplyBody::File(copy)),
                Err(e) => {
                    tracing::error!(file = %file_name, error = %e, "Removed file could not be handed back");
                    self.reply(id, reply_to, ReplyStatus::not_ok(e.to_string()), ReplyBody::Empty);
                }
            },
            Err(e) => {
                tracing::warn!(file = %file_name, error = %e, "Remove refused");
                self.reply(id, reply_to, ReplyStatus::not_ok(e.to_string()), ReplyBody::Empty);
            }
        }
    }

    fn handle_get_file(&self, id: MessageId, reply_to: &ChannelId, file_name: &str) {
        let Some(path) = self.store.get_file(file_name) else {
            return;
        };
        match self.store.transfer().publish(&path) {
            Ok(copy) => self.reply(id, reply_to, ReplyStatus::Ok, ReplyBody::File(copy)),
            Err(e) => {
                tracing::warn!(file = %file_name, error = %e, "Get file failed");
                self.reply(id, reply_to, ReplyStatus::not_ok(e.to_string()), ReplyBody::Empty);
            }
        }
    }

    /// Subscribe to or leave the store channel per the current admission
    /// state; returns whether uploads are accepted.
    fn refresh_store_listener(self: &Arc<Self>) -> bool {
        if self.shutdown.is_cancelled() {
            return self.admission.state().accepts_uploads();
        }

        // Decided under the lock so a stale reading never undoes a newer one.
        let mut listeners = lock(&self.listeners);
        let accepts = self.admission.state().accepts_uploads();
        match (accepts, listeners.uploads) {
            (true, None) => match self.bus.subscribe(&self.channels.any_bitarchive) {
                Ok(subscription) => {
                    listeners.uploads = Some(subscription.id);
                    tokio::spawn(
                        Arc::clone(self).listen(subscription, self.channels.any_bitarchive.clone()),
                    );
                    tracing::info!(node = %self.identity, "Listening for uploads");
                }
                Err(e) => {
                    tracing::error!(node = %self.identity, error = %e, "Cannot listen for uploads");
                }
            },
            (false, Some(id)) => {
                listeners.uploads = None;
                drop(listeners);
                self.unsubscribe(&self.channels.any_bitarchive, id);
                let reason = if self.admission.is_read_only_mode() {
                    "read-only mode"
                } else {
                    "not enough free space"
                };
                tracing::warn!(node = %self.identity, reason, "No longer listening for uploads");
                self.notifier.notify(
                    &format!("Bitarchive {} stopped accepting uploads: {reason}", self.identity),
                    NotificationType::Warning,
                );
            }
            _ => {}
        }
        accepts
    }

    fn unsubscribe(&self, channel: &ChannelId, id: SubscriptionId) {
        if let Err(e) = self.bus.unsubscribe(channel, id) {
            tracing::warn!(node = %self.identity, channel = %channel, error = %e, "Unsubscribe failed");
        }
    }

    fn reply(&self, in_reply_to: MessageId, reply_to: &ChannelId, status: ReplyStatus, body: ReplyBody) {
        self.publish(
            reply_to,
            Message::Reply(Reply {
                in_reply_to,
                from: self.identity.clone(),
                status,
                body,
            }),
        );
    }

    fn publish(&self, channel: &ChannelId, message: Message) {
        if let Err(e) = self.bus.send(channel, message) {
            tracing::error!(node = %self.identity, channel = %channel, error = %e, "Could not publish");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
