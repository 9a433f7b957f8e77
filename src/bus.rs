//! Message bus abstraction and in-process implementation
//!
//! Queues deliver each message to one subscriber (round-robin) and hold
//! messages while nobody listens. Topics deliver to every current subscriber
//! and drop messages nobody listens for.

use crate::message::{ChannelId, ChannelKind, Message};
use crate::{Error, Result};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving end of a subscription.
///
/// The receiver yields `None` once the subscription is cancelled.
#[derive(Debug)]
pub struct Subscription {
    /// Handle for [`MessageBus::unsubscribe`]
    pub id: SubscriptionId,
    /// Delivered messages
    pub receiver: mpsc::UnboundedReceiver<Message>,
}

/// Transport between nodes, clients and the monitor.
pub trait MessageBus: Send + Sync {
    /// Deliver `message` on `channel`
    ///
    /// # Errors
    ///
    /// Returns `Bus` if the message cannot be delivered.
    fn send(&self, channel: &ChannelId, message: Message) -> Result<()>;

    /// Start receiving messages from `channel`
    ///
    /// # Errors
    ///
    /// Returns `Bus` if the subscription cannot be registered.
    fn subscribe(&self, channel: &ChannelId) -> Result<Subscription>;

    /// Stop a subscription; its receiver drains and then yields `None`.
    ///
    /// # Errors
    ///
    /// Returns `Bus` if the subscription is unknown.
    fn unsubscribe(&self, channel: &ChannelId, id: SubscriptionId) -> Result<()>;
}

#[derive(Debug)]
struct ChannelState {
    kind: ChannelKind,
    subscribers: Vec<(SubscriptionId, mpsc::UnboundedSender<Message>)>,
    next_subscriber: usize,
    pending: VecDeque<Message>,
}

impl ChannelState {
    const fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            subscribers: Vec::new(),
            next_subscriber: 0,
            pending: VecDeque::new(),
        }
    }

    fn prune_closed(&mut self) {
        self.subscribers.retain(|(_, tx)| !tx.is_closed());
    }

    /// Hand `message` to the next live subscriber; give it back if none.
    fn deliver_one(&mut self, mut message: Message) -> Option<Message> {
        while !self.subscribers.is_empty() {
            let slot = self.next_subscriber % self.subscribers.len();
            self.next_subscriber = slot + 1;
            match self.subscribers[slot].1.send(message) {
                Ok(()) => return None,
                Err(mpsc::error::SendError(returned)) => {
                    message = returned;
                    self.subscribers.remove(slot);
                }
            }
        }
        Some(message)
    }
}

/// Bus living inside one process, shared through `Arc`.
#[derive(Debug, Default)]
pub struct InMemoryBus {
    channels: DashMap<String, ChannelState>,
    next_id: AtomicU64,
}

impl InMemoryBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current live subscribers of `channel`
    #[must_use]
    pub fn subscriber_count(&self, channel: &ChannelId) -> usize {
        self.channels.get_mut(channel.name()).map_or(0, |mut state| {
            state.prune_closed();
            state.subscribers.len()
        })
    }

    /// Messages held on queue `channel` for lack of subscribers
    #[must_use]
    pub fn pending_count(&self, channel: &ChannelId) -> usize {
        self.channels
            .get(channel.name())
            .map_or(0, |state| state.pending.len())
    }

    fn channel_state(
        &self,
        channel: &ChannelId,
    ) -> Result<dashmap::mapref::one::RefMut<'_, String, ChannelState>> {
        let state = self
            .channels
            .entry(channel.name().to_string())
            .or_insert_with(|| ChannelState::new(channel.kind()));
        if state.kind != channel.kind() {
            return Err(Error::Bus(format!(
                "channel '{channel}' is a {:?}, not a {:?}",
                state.kind,
                channel.kind()
            )));
        }
        Ok(state)
    }
}

impl MessageBus for InMemoryBus {
    fn send(&self, channel: &ChannelId, message: Message) -> Result<()> {
        let mut state = self.channel_state(channel)?;
        match state.kind {
            ChannelKind::Queue => {
                if let Some(undelivered) = state.deliver_one(message) {
                    tracing::trace!(channel = %channel, "No listener, holding message");
                    state.pending.push_back(undelivered);
                }
            }
            ChannelKind::Topic => {
                state.prune_closed();
                if state.subscribers.is_empty() {
                    tracing::debug!(channel = %channel, "No listener on topic, message dropped");
                }
                for (_, tx) in &state.subscribers {
                    let _ = tx.send(message.clone());
                }
            }
        }
        Ok(())
    }

    fn subscribe(&self, channel: &ChannelId) -> Result<Subscription> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, receiver) = mpsc::unbounded_channel();

        let mut state = self.channel_state(channel)?;
        while let Some(held) = state.pending.pop_front() {
            if tx.send(held).is_err() {
                break;
            }
        }
        state.subscribers.push((id, tx));
        tracing::debug!(channel = %channel, subscribers = state.subscribers.len(), "Subscribed");

        Ok(Subscription { id, receiver })
    }

    fn unsubscribe(&self, channel: &ChannelId, id: SubscriptionId) -> Result<()> {
        let mut state = self.channel_state(channel)?;
        let before = state.subscribers.len();
        state.subscribers.retain(|(sub, _)| *sub != id);
        if state.subscribers.len() == before {
            return Err(Error::Bus(format!(
                "no subscription {id:?} on channel '{channel}'"
            )));
        }
        tracing::debug!(channel = %channel, subscribers = state.subscribers.len(), "Unsubscribed");
        Ok(())
    }
}
