//! Operator notifications

use serde::{Deserialize, Serialize};

/// Severity of an operator notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationType {
    /// Informational
    Info,
    /// Needs attention
    Warning,
    /// Something failed
    Error,
}

/// Sends alerts to the people running the archive.
pub trait Notifier: Send + Sync {
    /// Deliver `message` with severity `kind`
    fn notify(&self, message: &str, kind: NotificationType);
}

/// Notifier that writes alerts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str, kind: NotificationType) {
        match kind {
            NotificationType::Info => tracing::info!(notification = true, "{message}"),
            NotificationType::Warning => tracing::warn!(notification = true, "{message}"),
            NotificationType::Error => tracing::error!(notification = true, "{message}"),
        }
    }
}
