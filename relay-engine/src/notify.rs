//! Run snapshot notifications
//!
//! The service hands a [`RunEvent`] to a [`Notifier`] after each committed
//! mutation. Delivery is fire-and-forget: at most once, never retried, and a
//! failure never undoes the mutation.

use relay_core::dto::event::RunEvent;
use tokio::sync::broadcast;

/// Notification error type
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("no watcher is subscribed")]
    NoSubscribers,

    #[error("failed to build snapshot: {0}")]
    Snapshot(String),
}

/// Fan-out of run snapshots to live watchers
pub trait Notifier: Send + Sync {
    fn notify(&self, event: RunEvent) -> Result<(), NotifyError>;

    /// Whether anyone would receive an event sent now. Snapshots are not
    /// built while this is false.
    fn has_watchers(&self) -> bool {
        true
    }
}

/// Notifier backed by a tokio broadcast channel
///
/// Watchers that fall more than `capacity` events behind skip the oldest ones.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<RunEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receive every event sent from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    pub fn watcher_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, event: RunEvent) -> Result<(), NotifyError> {
        self.sender
            .send(event)
            .map(|_| ())
            .map_err(|_| NotifyError::NoSubscribers)
    }

    fn has_watchers(&self) -> bool {
        self.watcher_count() > 0
    }
}
