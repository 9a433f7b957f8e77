//! Monitor-side view of node liveness and batch results
//!
//! Consumes the monitor channel: heartbeats refresh a node's last-seen time,
//! `BatchEnded` messages are kept, newest last, up to a fixed number.

use crate::identity::NodeIdentity;
use crate::message::{BatchEnded, Heartbeat, Message};
use crate::bus::Subscription;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Batch results kept by [`LivenessMonitor::new`].
pub const DEFAULT_RESULT_LIMIT: usize = 10_000;

/// Last heartbeat per node plus the most recent batch results.
#[derive(Debug)]
pub struct LivenessMonitor {
    last_seen: DashMap<NodeIdentity, DateTime<Utc>>,
    batch_results: Mutex<VecDeque<BatchEnded>>,
    result_limit: usize,
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        Self::with_result_limit(DEFAULT_RESULT_LIMIT)
    }
}

impl LivenessMonitor {
    /// Create an empty monitor
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty monitor keeping at most `limit` batch results; the
    /// oldest is dropped first.
    #[must_use]
    pub fn with_result_limit(limit: usize) -> Self {
        Self {
            last_seen: DashMap::new(),
            batch_results: Mutex::new(VecDeque::new()),
            result_limit: limit.max(1),
        }
    }

    /// Note a heartbeat; an older beat never moves last-seen backwards.
    pub fn record_heartbeat(&self, heartbeat: &Heartbeat) {
        let mut entry = self
            .last_seen
            .entry(heartbeat.node.clone())
            .or_insert(heartbeat.sent_at);
        if heartbeat.sent_at > *entry {
            *entry = heartbeat.sent_at;
        }
    }

    /// Store a batch result
    pub fn record_batch_ended(&self, ended: BatchEnded) {
        tracing::info!(
            batch_id = %ended.batch_id,
            node = %ended.node,
            state = ?ended.state,
            ok = ended.outcome.is_ok(),
            "Batch result received"
        );
        let mut results = self.results();
        if results.len() == self.result_limit {
            if let Some(dropped) = results.pop_front() {
                tracing::debug!(batch_id = %dropped.batch_id, "Dropping oldest batch result");
            }
        }
        results.push_back(ended);
    }

    /// Last heartbeat time of `node`
    #[must_use]
    pub fn last_seen(&self, node: &NodeIdentity) -> Option<DateTime<Utc>> {
        self.last_seen.get(node).map(|t| *t)
    }

    /// Whether `node` beat within `timeout` of `now`
    #[must_use]
    pub fn is_alive(&self, node: &NodeIdentity, timeout: Duration, now: DateTime<Utc>) -> bool {
        self.last_seen(node)
            .is_some_and(|seen| within(seen, timeout, now))
    }

    /// Known nodes whose last heartbeat is older than `timeout`, sorted
    #[must_use]
    pub fn dead_nodes(&self, timeout: Duration, now: DateTime<Utc>) -> Vec<NodeIdentity> {
        let mut dead: Vec<NodeIdentity> = self
            .last_seen
            .iter()
            .filter(|entry| !within(*entry.value(), timeout, now))
            .map(|entry| entry.key().clone())
            .collect();
        dead.sort();
        dead
    }

    /// Every node that has ever sent a heartbeat, sorted
    #[must_use]
    pub fn known_nodes(&self) -> Vec<NodeIdentity> {
        let mut nodes: Vec<NodeIdentity> = self.last_seen.iter().map(|e| e.key().clone()).collect();
        nodes.sort();
        nodes
    }

    /// Results held for `batch_id`, oldest first
    #[must_use]
    pub fn batch_results(&self, batch_id: &str) -> Vec<BatchEnded> {
        self.results()
            .iter()
            .filter(|ended| ended.batch_id == batch_id)
            .cloned()
            .collect()
    }

    /// Remove and return the results held for `batch_id`, oldest first
    pub fn take_results(&self, batch_id: &str) -> Vec<BatchEnded> {
        let mut results = self.results();
        let (taken, kept): (VecDeque<_>, VecDeque<_>) = results
            .drain(..)
            .partition(|ended| ended.batch_id == batch_id);
        *results = kept;
        taken.into()
    }

    fn results(&self) -> MutexGuard<'_, VecDeque<BatchEnded>> {
        self.batch_results.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consume the monitor channel until cancelled or the subscription ends.
    pub async fn run(&self, mut subscription: Subscription, cancel: CancellationToken) {
        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => break,
                message = subscription.receiver.recv() => message,
            };
            match message {
                Some(Message::Heartbeat(heartbeat)) => {
                    tracing::trace!(node = %heartbeat.node, "Heartbeat received");
                    self.record_heartbeat(&heartbeat);
                }
                Some(Message::BatchEnded(ended)) => self.record_batch_ended(ended),
                Some(other) => tracing::debug!(?other, "Ignoring message on monitor channel"),
                None => break,
            }
        }
    }
}

fn within(seen: DateTime<Utc>, timeout: Duration, now: DateTime<Utc>) -> bool {
    chrono::Duration::from_std(timeout)
        .map_or(true, |timeout| now.signed_duration_since(seen) <= timeout)
}
