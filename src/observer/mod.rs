//! Board observer: keeps PNG snapshots of `.ora` files up to date.
//!
//! # Architecture
//!
//! ```text
//! DirectoryScanner ──register──> WatchRegistry <──apply── pump task
//!        │                          │                        ^
//!        └─spawn─> Watcher ──> ConversionPipeline ──WatcherEvent─┘
//!                    │  rename
//!                    └─spawn─> Watcher (successor)
//!
//! WatchRegistry ──RegistryEvent──> subscribers (serving layer, CLI)
//! ArchiveExporter reads a registry snapshot on request
//! ```
//!
//! Every registry mutation coming from watchers goes through the single
//! pump task, so check-and-mutate sequences never interleave.

mod archive;
mod error;
mod notifications;
mod pipeline;
mod registry;
mod scanner;
mod source;
mod watcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ObserverConfig;
use crate::convert::{Converter, MergedImageConverter};

pub use archive::{ARCHIVE_PREFIX, ArchiveExporter, ArchiveSummary, MANIFEST_NAME, Snapshot, write_archive};
pub use error::{ArchiveError, ConvertError, WatchError};
pub use notifications::{
    NotificationBroadcaster, RegistryEvent, WatcherEvent, WatcherEventReceiver, WatcherEventSender,
    watcher_channel,
};
pub use pipeline::ConversionPipeline;
pub use registry::{Registration, WatchRegistry, WatchedEntry, WatchedFileDetails, WatcherId};
pub use scanner::DirectoryScanner;
pub use source::{ChangeSource, EventSource, FileSignal, PollSource, Subscription, source_for};
pub use watcher::{Watcher, WatcherContext, WatcherState, WatcherStep};

/// Runtime knobs for the observer.
#[derive(Debug, Clone)]
pub struct ObserverOptions {
    /// Poll modification times instead of using OS events.
    pub shared_fs: bool,
    pub poll_interval: Duration,
    pub scan_interval: Duration,
    pub retry_delay: Duration,
    /// Extra attempts after a failed conversion.
    pub conversion_retries: u32,
    pub watch_retry_delay: Duration,
    pub source_extension: String,
    pub output_extension: String,
}

impl Default for ObserverOptions {
    fn default() -> Self {
        ObserverConfig::default().to_options()
    }
}

/// A running observer.
///
/// Dropping it stops all background work; [`shutdown`](Self::shutdown)
/// additionally waits for in-flight tasks.
pub struct Observer {
    registry: Arc<WatchRegistry>,
    exporter: ArchiveExporter,
    board_dir: PathBuf,
    out_dir: PathBuf,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Observer {
    /// Create a builder for configuring the observer.
    pub fn builder() -> ObserverBuilder {
        ObserverBuilder::new()
    }

    pub fn registry(&self) -> &Arc<WatchRegistry> {
        &self.registry
    }

    /// Subscribe to update/delete notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    pub fn exporter(&self) -> &ArchiveExporter {
        &self.exporter
    }

    pub fn board_dir(&self) -> &Path {
        &self.board_dir
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Stop scanning, watching and pending retries, then wait for running
    /// tasks. Conversions already in progress are allowed to finish.
    pub async fn shutdown(self) {
        crate::log_event!("observer", "shutting down");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        crate::debug_event!("observer", "stopped");
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Builder for constructing an [`Observer`].
pub struct ObserverBuilder {
    board_dir: Option<PathBuf>,
    out_dir: Option<PathBuf>,
    options: ObserverOptions,
    converter: Option<Arc<dyn Converter>>,
    source: Option<Arc<dyn ChangeSource>>,
}

impl ObserverBuilder {
    /// Create a new builder with defaults.
    pub fn new() -> Self {
        Self {
            board_dir: None,
            out_dir: None,
            options: ObserverOptions::default(),
            converter: None,
            source: None,
        }
    }

    /// Directory holding the source boards.
    pub fn board_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.board_dir = Some(dir.into());
        self
    }

    /// Directory receiving generated snapshots. Created if missing.
    pub fn out_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.out_dir = Some(dir.into());
        self
    }

    pub fn options(mut self, options: ObserverOptions) -> Self {
        self.options = options;
        self
    }

    /// Converter to use. Defaults to [`MergedImageConverter`].
    pub fn converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Override the change source picked from `options.shared_fs`.
    pub fn source(mut self, source: Arc<dyn ChangeSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Start scanning. Must be called inside a tokio runtime.
    pub async fn start(self) -> Result<Observer, WatchError> {
        let board_dir = self.board_dir.ok_or_else(|| WatchError::InitFailed {
            reason: "board directory is required".to_string(),
        })?;
        let out_dir = self.out_dir.ok_or_else(|| WatchError::InitFailed {
            reason: "output directory is required".to_string(),
        })?;

        let board_dir = absolute(&board_dir)?;
        let out_dir = absolute(&out_dir)?;
        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(|e| WatchError::InitFailed {
                reason: format!("cannot create {}: {e}", out_dir.display()),
            })?;

        let options = self.options;
        let converter = self.converter.unwrap_or_else(|| Arc::new(MergedImageConverter));
        let source = self
            .source
            .unwrap_or_else(|| source_for(options.shared_fs, options.poll_interval));

        crate::log_event!(
            "observer",
            "starting",
            "{} -> {} (shared fs: {}, source: {}, converter: {})",
            board_dir.display(),
            out_dir.display(),
            if options.shared_fs { "on" } else { "off" },
            source.name(),
            converter.name()
        );

        let registry = Arc::new(WatchRegistry::new());
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (events, event_rx) = watcher_channel();

        let pipeline = ConversionPipeline::new(
            converter,
            events.clone(),
            options.retry_delay,
            cancel.clone(),
            tracker.clone(),
        );
        let ctx = Arc::new(WatcherContext {
            registry: Arc::clone(&registry),
            source,
            pipeline,
            events,
            conversion_retries: options.conversion_retries,
            watch_retry_delay: options.watch_retry_delay,
            cancel: cancel.clone(),
            tracker: tracker.clone(),
        });

        tracker.spawn(pump(Arc::clone(&registry), event_rx, cancel.clone()));

        let scanner = DirectoryScanner::new(
            board_dir.clone(),
            out_dir.clone(),
            options.source_extension,
            options.output_extension,
            options.scan_interval,
            ctx,
        );
        tracker.spawn(scanner.run(cancel.clone()));

        Ok(Observer {
            exporter: ArchiveExporter::new(Arc::clone(&registry)),
            registry,
            board_dir,
            out_dir,
            cancel,
            tracker,
        })
    }
}

impl Default for ObserverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn absolute(path: &Path) -> Result<PathBuf, WatchError> {
    std::path::absolute(path).map_err(|e| WatchError::InitFailed {
        reason: format!("cannot resolve {}: {e}", path.display()),
    })
}

/// Apply watcher notifications to the registry, one at a time.
async fn pump(registry: Arc<WatchRegistry>, mut events: WatcherEventReceiver, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };
        crate::debug_event!("pump", "applying", "{event:?}");
        registry.apply(event);
    }
}
