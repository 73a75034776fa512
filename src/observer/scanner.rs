//! Periodic directory scan discovering new source files.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use super::registry::{Registration, WatchRegistry};
use super::watcher::{Watcher, WatcherContext};

/// Lists the board directory on a fixed interval and starts a watcher for
/// every source file not already watched.
pub struct DirectoryScanner {
    board_dir: PathBuf,
    out_dir: PathBuf,
    source_extension: String,
    output_extension: String,
    interval: Duration,
    registry: Arc<WatchRegistry>,
    ctx: Arc<WatcherContext>,
    /// Names already reported as skipped, so each is logged once.
    reported: HashSet<String>,
}

impl DirectoryScanner {
    pub fn new(
        board_dir: PathBuf,
        out_dir: PathBuf,
        source_extension: String,
        output_extension: String,
        interval: Duration,
        ctx: Arc<WatcherContext>,
    ) -> Self {
        Self {
            board_dir,
            out_dir,
            source_extension,
            output_extension,
            interval,
            registry: Arc::clone(&ctx.registry),
            ctx,
            reported: HashSet::new(),
        }
    }

    /// Output path for a directory entry, or `None` if it is not a source.
    ///
    /// Hidden files are never sources. The extension is matched
    /// case-insensitively and replaced by the output extension.
    pub fn output_path_for(&self, file_name: &str) -> Option<PathBuf> {
        if file_name.starts_with('.') {
            return None;
        }
        let path = Path::new(file_name);
        let ext = path.extension()?.to_str()?;
        if !ext.eq_ignore_ascii_case(&self.source_extension) {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        Some(self.out_dir.join(format!("{stem}.{}", self.output_extension)))
    }

    /// Run scan cycles until `cancel` fires. The first cycle runs at once.
    pub async fn run(mut self, cancel: CancellationToken) {
        crate::log_event!(
            "scanner",
            "observing",
            "{} -> {} every {:?}",
            self.board_dir.display(),
            self.out_dir.display(),
            self.interval
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.scan_once().await {
                tracing::warn!("[scanner] cannot read {}: {e}", self.board_dir.display());
            }
        }

        crate::debug_event!("scanner", "stopped");
    }

    /// One scan cycle. Returns the number of watchers started.
    pub async fn scan_once(&mut self) -> io::Result<usize> {
        let mut dir = tokio::fs::read_dir(&self.board_dir).await?;
        let mut started = 0;

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();

            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let output = if is_dir {
                None
            } else {
                self.output_path_for(&name)
            };
            let Some(output) = output else {
                if self.reported.insert(name.clone()) {
                    crate::log_event!("scanner", "skipping", "{name}");
                }
                continue;
            };

            let source = entry.path();
            match self.registry.register(&source, &output) {
                registration if registration.should_watch() => {
                    crate::log_event!("scanner", "found", "{name} ({registration:?})");
                    Watcher::new(Arc::clone(&self.ctx), source, output).spawn();
                    started += 1;
                }
                Registration::Conflict { existing } => {
                    if self.reported.insert(name.clone()) {
                        tracing::warn!(
                            "[scanner] {name} maps to the same output as {}, ignoring it",
                            existing.display()
                        );
                    }
                }
                _ => {}
            }
        }

        Ok(started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::Converter;
    use crate::observer::ConvertError;
    use crate::observer::error::WatchError;
    use crate::observer::notifications::watcher_channel;
    use crate::observer::pipeline::ConversionPipeline;
    use crate::observer::source::{ChangeSource, FileSignal, Subscription};
    use tokio::sync::mpsc;
    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio_util::task::TaskTracker;

    struct Noop;

    #[async_trait]
    impl Converter for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        async fn convert(&self, _source: &Path, _output: &Path) -> Result<(), ConvertError> {
            Ok(())
        }
    }

    /// Subscriptions that stay open and never fire.
    struct Quiet(parking_lot::Mutex<Vec<mpsc::UnboundedSender<FileSignal>>>);

    #[async_trait]
    impl ChangeSource for Quiet {
        fn name(&self) -> &str {
            "quiet"
        }

        async fn subscribe(&self, _path: &Path) -> Result<Subscription, WatchError> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.0.lock().push(tx);
            Ok(Subscription::from_channel(rx))
        }
    }

    fn scanner(board_dir: &Path, out_dir: &Path) -> DirectoryScanner {
        let (tx, _rx) = watcher_channel();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let ctx = WatcherContext {
            registry: Arc::new(WatchRegistry::new()),
            source: Arc::new(Quiet(parking_lot::Mutex::new(Vec::new()))),
            pipeline: ConversionPipeline::new(
                Arc::new(Noop),
                tx.clone(),
                Duration::from_millis(5),
                cancel.clone(),
                tracker.clone(),
            ),
            events: tx,
            conversion_retries: 1,
            watch_retry_delay: Duration::from_millis(5),
            cancel,
            tracker,
        };
        DirectoryScanner::new(
            board_dir.to_path_buf(),
            out_dir.to_path_buf(),
            "ora".to_string(),
            "png".to_string(),
            Duration::from_secs(4),
            Arc::new(ctx),
        )
    }

    #[test]
    fn test_output_path_substitutes_extension() {
        let s = scanner(Path::new("/boards"), Path::new("/out"));
        assert_eq!(
            s.output_path_for("board.ora"),
            Some(PathBuf::from("/out/board.png"))
        );
        assert_eq!(
            s.output_path_for("Sketch.v2.ORA"),
            Some(PathBuf::from("/out/Sketch.v2.png"))
        );
    }

    #[test]
    fn test_output_path_rejects_non_sources() {
        let s = scanner(Path::new("/boards"), Path::new("/out"));
        assert_eq!(s.output_path_for(".board.ora"), None);
        assert_eq!(s.output_path_for("board.ora~"), None);
        assert_eq!(s.output_path_for("notes.txt"), None);
        assert_eq!(s.output_path_for("ora"), None);
    }

    #[tokio::test]
    async fn test_rescan_is_idempotent() {
        let boards = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        std::fs::write(boards.path().join("a.ora"), b"a").unwrap();
        std::fs::write(boards.path().join("b.ORA"), b"b").unwrap();
        std::fs::write(boards.path().join(".hidden.ora"), b"h").unwrap();
        std::fs::write(boards.path().join("readme.txt"), b"r").unwrap();
        std::fs::create_dir(boards.path().join("nested.ora")).unwrap();

        let mut s = scanner(boards.path(), out.path());

        assert_eq!(s.scan_once().await.unwrap(), 2);
        assert_eq!(s.scan_once().await.unwrap(), 0);

        let mut files = s.registry.watched_files();
        files.sort();
        assert_eq!(files, vec!["a.png", "b.png"]);
        assert!(s.reported.contains("readme.txt"));
        assert!(s.reported.contains(".hidden.ora"));
    }

    #[tokio::test]
    async fn test_deleted_entry_is_rediscovered() {
        let boards = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        std::fs::write(boards.path().join("board.ora"), b"a").unwrap();
        let mut s = scanner(boards.path(), out.path());
        s.scan_once().await.unwrap();

        let output = out.path().join("board.png");
        s.registry.update(&output);
        s.registry.delete(&output);

        assert_eq!(s.scan_once().await.unwrap(), 1);
        let details = s.registry.watched_files_details();
        assert_eq!(details.len(), 1);
        assert!(!details[0].deleted);
        assert_eq!(details[0].rev, 1);
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let out = TempDir::new().unwrap();
        let mut s = scanner(&out.path().join("absent"), out.path());

        assert!(s.scan_once().await.is_err());
    }
}
