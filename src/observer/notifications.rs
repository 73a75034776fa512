//! Notification plumbing between watchers, the registry and subscribers.
//!
//! Two channels are involved:
//! - [`WatcherEvent`]s flow from watcher instances and the conversion
//!   pipeline over one `mpsc` channel into a single pump task, which is the
//!   only writer of the registry.
//! - [`RegistryEvent`]s are broadcast to any number of subscribers (the
//!   serving layer, the CLI) after the registry has applied a change.

use std::path::PathBuf;
use tokio::sync::{broadcast, mpsc};

/// Change published by the registry after it has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A fresh output was generated; the entry's revision was bumped.
    Updated { output: PathBuf },
    /// The source disappeared; the entry is flagged deleted.
    Deleted { output: PathBuf },
}

impl RegistryEvent {
    pub fn output(&self) -> &PathBuf {
        match self {
            RegistryEvent::Updated { output } | RegistryEvent::Deleted { output } => output,
        }
    }
}

/// Raw notifications emitted by a watcher lineage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    /// Conversion succeeded and `output` was rewritten.
    Converted { output: PathBuf },
    /// Subscribing failed because the source no longer exists.
    SourceMissing { output: PathBuf },
    /// The lineage gave up watching `source` without it being deleted.
    Released { source: PathBuf },
}

/// Sending half of the watcher notification channel.
///
/// Cloned into every watcher instance; a successor created on rename gets a
/// clone of its predecessor's sender, so the pump never has to resubscribe.
pub type WatcherEventSender = mpsc::UnboundedSender<WatcherEvent>;

/// Receiving half, owned by the pump task.
pub type WatcherEventReceiver = mpsc::UnboundedReceiver<WatcherEvent>;

pub fn watcher_channel() -> (WatcherEventSender, WatcherEventReceiver) {
    mpsc::unbounded_channel()
}

/// Fans registry events out to subscribers.
#[derive(Clone)]
pub struct NotificationBroadcaster {
    sender: broadcast::Sender<RegistryEvent>,
}

impl NotificationBroadcaster {
    /// Create a new broadcaster with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send an event to all current subscribers
    pub fn send(&self, event: RegistryEvent) {
        match self.sender.send(event.clone()) {
            Ok(count) => {
                crate::debug_event!("broadcast", "sent", "{event:?} to {count} subscribers");
            }
            Err(_) => {
                // No receivers, this is fine
                crate::debug_event!("broadcast", "dropped", "no subscribers for {event:?}");
            }
        }
    }

    /// Subscribe to receive notifications
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let broadcaster = NotificationBroadcaster::new(8);
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();

        let event = RegistryEvent::Updated {
            output: PathBuf::from("/out/board.png"),
        };
        broadcaster.send(event.clone());

        assert_eq!(a.recv().await.unwrap(), event);
        assert_eq!(b.recv().await.unwrap(), event);
    }

    #[test]
    fn test_send_without_subscribers_is_silent() {
        let broadcaster = NotificationBroadcaster::new(8);
        broadcaster.send(RegistryEvent::Deleted {
            output: PathBuf::from("/out/gone.png"),
        });
    }
}
