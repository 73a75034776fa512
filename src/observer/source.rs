//! Change notification sources for a single source file.
//!
//! Two strategies:
//! - [`EventSource`]: OS file events through `notify`.
//! - [`PollSource`]: periodic stat + modification time comparison, for
//!   shared or network file systems that do not deliver events.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use notify::event::{MetadataKind, ModifyKind};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::{CancellationToken, DropGuard};

use super::error::WatchError;

/// What happened to a watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSignal {
    /// Contents changed in place.
    Changed,
    /// The directory entry was replaced or removed (atomic save, delete).
    /// The current subscription is no longer meaningful.
    Renamed,
}

/// Keeps the underlying watch alive; tearing it down on drop.
enum SubscriptionGuard {
    Notify(#[allow(dead_code)] notify::RecommendedWatcher),
    Poll(#[allow(dead_code)] DropGuard),
    Detached,
}

/// A live subscription to change signals for one path.
pub struct Subscription {
    signals: mpsc::UnboundedReceiver<FileSignal>,
    _guard: SubscriptionGuard,
}

impl Subscription {
    /// Wrap a plain channel. The producer owns its own lifetime.
    pub fn from_channel(signals: mpsc::UnboundedReceiver<FileSignal>) -> Self {
        Self {
            signals,
            _guard: SubscriptionGuard::Detached,
        }
    }

    /// Next signal, or `None` once the producer is gone.
    pub async fn recv(&mut self) -> Option<FileSignal> {
        self.signals.recv().await
    }
}

/// Something that can watch a single file for changes.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Source name for logging.
    fn name(&self) -> &str;

    /// Start observing `path`.
    ///
    /// Must fail with [`WatchError::NotFound`] when `path` does not exist.
    async fn subscribe(&self, path: &Path) -> Result<Subscription, WatchError>;
}

/// Pick the source matching the shared-fs setting.
pub fn source_for(shared_fs: bool, poll_interval: Duration) -> Arc<dyn ChangeSource> {
    if shared_fs {
        Arc::new(PollSource::new(poll_interval))
    } else {
        Arc::new(EventSource)
    }
}

/// OS event based source (`notify::RecommendedWatcher`).
#[derive(Debug, Default, Clone, Copy)]
pub struct EventSource;

/// Map a notify event kind to a signal. `None` means ignore.
fn classify(kind: &EventKind) -> Option<FileSignal> {
    match kind {
        EventKind::Modify(ModifyKind::Name(_)) | EventKind::Remove(_) | EventKind::Create(_) => {
            Some(FileSignal::Renamed)
        }
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::WriteTime)) => {
            Some(FileSignal::Changed)
        }
        // Attribute churn (link count on delete, chmod) is not a content change
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(FileSignal::Changed),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
    }
}

#[async_trait]
impl ChangeSource for EventSource {
    fn name(&self) -> &str {
        "event"
    }

    async fn subscribe(&self, path: &Path) -> Result<Subscription, WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback_path = path.to_path_buf();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if let Some(signal) = classify(&event.kind) {
                    let _ = tx.send(signal);
                }
            }
            Err(e) => {
                tracing::warn!("[source] watch error for {}: {e}", callback_path.display());
            }
        })
        .map_err(|e| WatchError::from_notify(path.to_path_buf(), e))?;

        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| WatchError::from_notify(path.to_path_buf(), e))?;

        Ok(Subscription {
            signals: rx,
            _guard: SubscriptionGuard::Notify(watcher),
        })
    }
}

/// Polling source comparing modification times.
#[derive(Debug, Clone, Copy)]
pub struct PollSource {
    interval: Duration,
}

impl PollSource {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[async_trait]
impl ChangeSource for PollSource {
    fn name(&self) -> &str {
        "poll"
    }

    async fn subscribe(&self, path: &Path) -> Result<Subscription, WatchError> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| WatchError::from_io(path.to_path_buf(), e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        tokio::spawn(poll_loop(
            path.to_path_buf(),
            meta.modified().ok(),
            self.interval,
            tx,
            token.clone(),
        ));

        Ok(Subscription {
            signals: rx,
            _guard: SubscriptionGuard::Poll(token.drop_guard()),
        })
    }
}

async fn poll_loop(
    path: PathBuf,
    mut last_modified: Option<SystemTime>,
    period: Duration,
    tx: mpsc::UnboundedSender<FileSignal>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match tokio::fs::metadata(&path).await {
            Ok(meta) => {
                let current = meta.modified().ok();
                if current == last_modified {
                    tracing::trace!("[poll] {} unchanged", path.display());
                    continue;
                }
                crate::debug_event!(
                    "poll",
                    "modification time changed",
                    "{} {last_modified:?} -> {current:?}",
                    path.display()
                );
                last_modified = current;
                if tx.send(FileSignal::Changed).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Let the watcher resubscribe; that attempt reports the deletion
                let _ = tx.send(FileSignal::Renamed);
                break;
            }
            Err(e) => {
                tracing::warn!("[poll] cannot stat {}: {e}", path.display());
            }
        }
    }
}
