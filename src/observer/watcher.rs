//! Per-file watch lifecycle.
//!
//! A [`Watcher`] is one uninterrupted observation segment of one source
//! file. It runs on its own task and moves through two states:
//!
//! ```text
//!   subscribe ok          rename
//!  ------------> Watching -------> Ended  (successor spawned)
//!                 |    ^
//!          change |    | conversion spawned, state unchanged
//!                 +----+
//! ```
//!
//! A rename (atomic save, delete) ends the instance and spawns a successor
//! for the same pair on a new task, reusing the same notification channel.
//! The successor's subscription attempt is what detects a deleted source.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::error::WatchError;
use super::notifications::{WatcherEvent, WatcherEventSender};
use super::pipeline::ConversionPipeline;
use super::registry::{WatchRegistry, WatcherId};
use super::source::{ChangeSource, FileSignal, Subscription};

/// Lifecycle state of one watcher instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Not subscribed yet.
    Starting,
    Watching,
    /// Terminal for this instance.
    Ended,
}

/// Reaction to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherStep {
    /// A conversion was started.
    Convert,
    /// The instance ended; a successor must take over.
    Restart,
    /// Signal arrived after the instance ended.
    Ignored,
}

/// Everything a watcher lineage shares with the rest of the observer.
pub struct WatcherContext {
    pub registry: Arc<WatchRegistry>,
    pub source: Arc<dyn ChangeSource>,
    pub pipeline: ConversionPipeline,
    pub events: WatcherEventSender,
    pub conversion_retries: u32,
    pub watch_retry_delay: Duration,
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
}

pub struct Watcher {
    id: WatcherId,
    source_path: PathBuf,
    output_path: PathBuf,
    /// Created by a rename; skips the initial conversion.
    restarted: bool,
    state: WatcherState,
    ctx: Arc<WatcherContext>,
}

impl Watcher {
    /// First instance for a freshly registered pair.
    pub fn new(ctx: Arc<WatcherContext>, source_path: PathBuf, output_path: PathBuf) -> Self {
        Self {
            id: ctx.registry.next_watcher_id(),
            source_path,
            output_path,
            restarted: false,
            state: WatcherState::Starting,
            ctx,
        }
    }

    /// Instance taking over after this one ended.
    fn successor(&self) -> Self {
        Self {
            id: self.ctx.registry.next_watcher_id(),
            source_path: self.source_path.clone(),
            output_path: self.output_path.clone(),
            restarted: true,
            state: WatcherState::Starting,
            ctx: Arc::clone(&self.ctx),
        }
    }

    pub fn id(&self) -> WatcherId {
        self.id
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn is_restarted(&self) -> bool {
        self.restarted
    }

    /// Run this instance on its own tracked task.
    pub fn spawn(self) {
        let tracker = self.ctx.tracker.clone();
        tracker.spawn(self.run_boxed());
    }

    // Boxed with an explicit `Send` bound so `run` can spawn a successor
    // without the compiler having to inspect `run`'s own future type.
    fn run_boxed(self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(self.run())
    }

    async fn run(mut self) {
        let Some(mut subscription) = self.subscribe().await else {
            self.state = WatcherState::Ended;
            return;
        };
        self.enter_watching();

        loop {
            let signal = tokio::select! {
                _ = self.ctx.cancel.cancelled() => {
                    crate::debug_event!(self.id, "stopped", "{}", self.source_path.display());
                    break;
                }
                signal = subscription.recv() => signal,
            };

            let Some(signal) = signal else {
                tracing::warn!(
                    "[{}] change notifications stopped for {}",
                    self.id,
                    self.source_path.display()
                );
                self.state = WatcherState::Ended;
                let _ = self.ctx.events.send(WatcherEvent::Released {
                    source: self.source_path.clone(),
                });
                break;
            };

            if self.on_signal(signal) == WatcherStep::Restart {
                let successor = self.successor();
                crate::debug_event!(self.id, "handing over", "{}", successor.id);
                successor.spawn();
                break;
            }
        }
        // Dropping the subscription here tears down the OS watch / poll task.
    }

    /// Mark the subscription as established. A fresh instance converts once
    /// right away so a new file gets a snapshot without waiting for a change.
    pub fn enter_watching(&mut self) {
        crate::debug_event!(self.id, "watching", "{}", self.source_path.display());
        self.state = WatcherState::Watching;
        if !self.restarted {
            self.convert();
        }
    }

    /// Apply one change signal to the state machine.
    pub fn on_signal(&mut self, signal: FileSignal) -> WatcherStep {
        if self.state != WatcherState::Watching {
            crate::debug_event!(
                self.id,
                "signal ignored",
                "{signal:?} while {:?}: {}",
                self.state,
                self.source_path.display()
            );
            return WatcherStep::Ignored;
        }

        match signal {
            FileSignal::Changed => {
                crate::log_event!(self.id, "file changed", "{}", self.source_path.display());
                self.convert();
                WatcherStep::Convert
            }
            FileSignal::Renamed => {
                crate::log_event!(self.id, "file was renamed", "{}", self.source_path.display());
                self.state = WatcherState::Ended;
                WatcherStep::Restart
            }
        }
    }

    fn convert(&self) {
        self.ctx.pipeline.spawn(
            self.source_path.clone(),
            self.output_path.clone(),
            self.ctx.conversion_retries,
        );
    }

    /// Subscribe with one delayed retry for transient failures.
    ///
    /// A missing source is reported as deleted right away. Giving up on any
    /// other failure releases the entry so the next scan can try again.
    async fn subscribe(&self) -> Option<Subscription> {
        crate::debug_event!(self.id, "subscribing", "{} ({})", self.source_path.display(), self.ctx.source.name());

        let first = match self.ctx.source.subscribe(&self.source_path).await {
            Ok(subscription) => return Some(subscription),
            Err(e) => e,
        };
        if first.is_not_found() {
            return self.report_missing(first);
        }

        crate::debug_event!(self.id, "retrying subscription", "{first}");
        tokio::select! {
            _ = self.ctx.cancel.cancelled() => return None,
            _ = sleep(self.ctx.watch_retry_delay) => {}
        }

        match self.ctx.source.subscribe(&self.source_path).await {
            Ok(subscription) => Some(subscription),
            Err(e) if e.is_not_found() => self.report_missing(e),
            Err(e) => {
                tracing::warn!(
                    "[{}] could not start watcher for {}: {e}",
                    self.id,
                    self.source_path.display()
                );
                let _ = self.ctx.events.send(WatcherEvent::Released {
                    source: self.source_path.clone(),
                });
                None
            }
        }
    }

    fn report_missing(&self, error: WatchError) -> Option<Subscription> {
        crate::log_event!(self.id, "source gone", "{error}");
        let _ = self.ctx.events.send(WatcherEvent::SourceMissing {
            output: self.output_path.clone(),
        });
        None
    }
}
