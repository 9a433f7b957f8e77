//! Periodic liveness announcements to the monitor

use crate::bus::MessageBus;
use crate::identity::NodeIdentity;
use crate::message::{ChannelId, Heartbeat, Message};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Sends a heartbeat on a fixed interval until cancelled.
#[derive(Clone)]
pub struct HeartbeatSender {
    node: NodeIdentity,
    bus: Arc<dyn MessageBus>,
    monitor: ChannelId,
    interval: Duration,
}

impl HeartbeatSender {
    /// Create a sender announcing `node` on `monitor`
    #[must_use]
    pub fn new(
        node: NodeIdentity,
        bus: Arc<dyn MessageBus>,
        monitor: ChannelId,
        interval: Duration,
    ) -> Self {
        Self {
            node,
            bus,
            monitor,
            interval,
        }
    }

    /// Publish one heartbeat now.
    ///
    /// # Errors
    ///
    /// Returns `Bus` if the monitor channel refuses the message.
    pub fn beat(&self) -> crate::Result<()> {
        self.bus.send(
            &self.monitor,
            Message::Heartbeat(Heartbeat {
                node: self.node.clone(),
                sent_at: chrono::Utc::now(),
            }),
        )
    }

    /// Run the heartbeat loop on the current runtime.
    ///
    /// The first beat goes out immediately. A failed publish is logged and
    /// the loop carries on.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                node = %self.node,
                interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
                "Heartbeat started"
            );

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.beat() {
                            tracing::warn!(node = %self.node, error = %e, "Failed to send heartbeat");
                        } else {
                            tracing::trace!(node = %self.node, "Heartbeat sent");
                        }
                    }
                }
            }
            tracing::info!(node = %self.node, "Heartbeat stopped");
        })
    }
}

impl std::fmt::Debug for HeartbeatSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatSender")
            .field("node", &self.node)
            .field("monitor", &self.monitor)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
