//! Conversion with bounded retry.
//!
//! Never fails outward: every error ends in a log line. Success is
//! reported as [`WatcherEvent::Converted`] on the notification channel.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::error::ConvertError;
use super::notifications::{WatcherEvent, WatcherEventSender};
use crate::convert::Converter;

/// Wraps a [`Converter`] with retry and failure logging.
#[derive(Clone)]
pub struct ConversionPipeline {
    converter: Arc<dyn Converter>,
    events: WatcherEventSender,
    retry_delay: Duration,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl ConversionPipeline {
    pub fn new(
        converter: Arc<dyn Converter>,
        events: WatcherEventSender,
        retry_delay: Duration,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            converter,
            events,
            retry_delay,
            cancel,
            tracker,
        }
    }

    /// Convert `source` into `output`, retrying up to `retries` extra times.
    ///
    /// Returns whether a conversion succeeded. Retries stop early on
    /// shutdown; an attempt already running is left to finish.
    pub async fn convert(&self, source: &Path, output: &Path, retries: u32) -> bool {
        let mut remaining = retries;

        loop {
            crate::debug_event!("pipeline", "converting", "{}", source.display());

            match self.attempt(source, output).await {
                Ok(()) => {
                    crate::log_event!("pipeline", "generated", "{}", output.display());
                    let _ = self.events.send(WatcherEvent::Converted {
                        output: output.to_path_buf(),
                    });
                    return true;
                }
                Err(e) if remaining > 0 => {
                    tracing::info!(
                        "[pipeline] failed generating {}, trying again ... ({e})",
                        output.display()
                    );
                    remaining -= 1;
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            crate::debug_event!("pipeline", "retry cancelled", "{}", output.display());
                            return false;
                        }
                        _ = sleep(self.retry_delay) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("[pipeline] failed generating {}: {e}", output.display());
                    return false;
                }
            }
        }
    }

    /// Fire-and-forget [`convert`](Self::convert) on a tracked task.
    ///
    /// Overlapping conversions of the same file are allowed; the last one
    /// to finish determines the visible output.
    pub fn spawn(&self, source: PathBuf, output: PathBuf, retries: u32) {
        let pipeline = self.clone();
        self.tracker.spawn(async move {
            pipeline.convert(&source, &output, retries).await;
        });
    }

    /// One converter invocation on its own task, so a panicking converter
    /// is reported like any other failure.
    async fn attempt(&self, source: &Path, output: &Path) -> Result<(), ConvertError> {
        let converter = Arc::clone(&self.converter);
        let source = source.to_path_buf();
        let output = output.to_path_buf();

        match tokio::spawn(async move { converter.convert(&source, &output).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(ConvertError::Panicked(panic_message(e.into_panic()))),
            Err(_) => Err(ConvertError::Cancelled),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::notifications::{WatcherEventReceiver, watcher_channel};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Converter for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn convert(&self, _source: &Path, _output: &Path) -> Result<(), ConvertError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(ConvertError::Io(std::io::Error::other("boom")))
            } else {
                Ok(())
            }
        }
    }

    struct Panicky;

    #[async_trait]
    impl Converter for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn convert(&self, _source: &Path, _output: &Path) -> Result<(), ConvertError> {
            panic!("converter exploded");
        }
    }

    fn pipeline_with(converter: Arc<dyn Converter>) -> (ConversionPipeline, WatcherEventReceiver) {
        let (tx, rx) = watcher_channel();
        let pipeline = ConversionPipeline::new(
            converter,
            tx,
            Duration::from_millis(5),
            CancellationToken::new(),
            TaskTracker::new(),
        );
        (pipeline, rx)
    }

    #[tokio::test]
    async fn test_success_emits_converted() {
        let converter = Arc::new(Flaky {
            failures: 0,
            calls: AtomicUsize::new(0),
        });
        let (pipeline, mut rx) = pipeline_with(converter.clone());

        assert!(pipeline.convert(Path::new("/b/a.ora"), Path::new("/o/a.png"), 1).await);

        assert_eq!(
            rx.try_recv().unwrap(),
            WatcherEvent::Converted {
                output: PathBuf::from("/o/a.png")
            }
        );
        assert_eq!(converter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_failure_is_retried() {
        let converter = Arc::new(Flaky {
            failures: 1,
            calls: AtomicUsize::new(0),
        });
        let (pipeline, mut rx) = pipeline_with(converter.clone());

        assert!(pipeline.convert(Path::new("/b/a.ora"), Path::new("/o/a.png"), 1).await);

        assert_eq!(converter.calls.load(Ordering::SeqCst), 2);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_retry_exhaustion_makes_two_attempts_and_stays_silent() {
        let converter = Arc::new(Flaky {
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let (pipeline, mut rx) = pipeline_with(converter.clone());

        assert!(!pipeline.convert(Path::new("/b/a.ora"), Path::new("/o/a.png"), 1).await);

        assert_eq!(converter.calls.load(Ordering::SeqCst), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_panicking_converter_is_a_failure() {
        let (pipeline, mut rx) = pipeline_with(Arc::new(Panicky));

        assert!(!pipeline.convert(Path::new("/b/a.ora"), Path::new("/o/a.png"), 0).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_stops_pending_retry() {
        let converter = Arc::new(Flaky {
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let (tx, _rx) = watcher_channel();
        let cancel = CancellationToken::new();
        let pipeline = ConversionPipeline::new(
            converter.clone(),
            tx,
            Duration::from_secs(60),
            cancel.clone(),
            TaskTracker::new(),
        );
        cancel.cancel();

        assert!(!pipeline.convert(Path::new("/b/a.ora"), Path::new("/o/a.png"), 5).await);
        assert_eq!(converter.calls.load(Ordering::SeqCst), 1);
    }
}
