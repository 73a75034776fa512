//! Bookkeeping of every known (source, output) pair.
//!
//! The registry is the only shared mutable structure in the observer. All
//! writes go through one short critical section per call; notifications
//! are broadcast after the lock is released.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use super::notifications::{NotificationBroadcaster, RegistryEvent, WatcherEvent};

/// Capacity of the registry event broadcast channel.
const BROADCAST_CAPACITY: usize = 256;

/// One watched source file and its generated output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEntry {
    pub source: PathBuf,
    pub output: PathBuf,
    /// Bumped once per successful conversion; never reset.
    pub revision: u64,
    /// Source currently absent. The entry and its last output are kept.
    pub deleted: bool,
    /// A watcher lineage currently owns this entry.
    live: bool,
}

impl WatchedEntry {
    fn new(source: PathBuf, output: PathBuf, live: bool) -> Self {
        Self {
            source,
            output,
            revision: 0,
            deleted: false,
            live,
        }
    }

    /// File name of the output, e.g. `board.png`.
    pub fn output_name(&self) -> String {
        basename(&self.output)
    }
}

/// Per-file status handed to the serving layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchedFileDetails {
    pub name: String,
    pub rev: u64,
    pub deleted: bool,
}

/// Outcome of registering a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// New entry with revision 0.
    Inserted,
    /// Existing deleted entry came back; revision kept.
    Reactivated,
    /// Entry was present but no watcher owned it any more.
    Reclaimed,
    /// A deleted entry for another source with the same output was taken
    /// over; revision kept.
    Replaced { previous: PathBuf },
    /// A live, non-deleted entry already exists. Nothing changed.
    AlreadyWatched,
    /// Another source already maps to the same output name.
    Conflict { existing: PathBuf },
}

impl Registration {
    /// Whether the caller now owns the entry and must start a watcher.
    pub fn should_watch(&self) -> bool {
        matches!(
            self,
            Registration::Inserted
                | Registration::Reactivated
                | Registration::Reclaimed
                | Registration::Replaced { .. }
        )
    }
}

/// Identifier of one watcher instance, unique within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(u64);

impl fmt::Display for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watcher#{}", self.0)
    }
}

/// Insertion-ordered registry of watched files.
pub struct WatchRegistry {
    entries: Mutex<IndexMap<PathBuf, WatchedEntry>>,
    broadcaster: NotificationBroadcaster,
    next_id: AtomicU64,
}

impl Default for WatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
            broadcaster: NotificationBroadcaster::new(BROADCAST_CAPACITY),
            next_id: AtomicU64::new(0),
        }
    }

    /// Subscribe to update/delete notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.broadcaster.subscribe()
    }

    /// Allocate an id for a new watcher instance.
    pub fn next_watcher_id(&self) -> WatcherId {
        WatcherId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Idempotent registration without claiming a watcher.
    ///
    /// An existing entry (deleted or not) is kept with its revision and has
    /// its deleted flag cleared.
    pub fn add_watched(&self, source: &Path, output: &Path) -> Registration {
        self.register_inner(source, output, false)
    }

    /// Register `source` and claim its watcher lineage in one step.
    ///
    /// Of two racing callers for the same source, at most one gets a
    /// registration for which [`Registration::should_watch`] is true.
    pub fn register(&self, source: &Path, output: &Path) -> Registration {
        self.register_inner(source, output, true)
    }

    fn register_inner(&self, source: &Path, output: &Path, claim: bool) -> Registration {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(source) {
            crate::debug_event!(
                "registry",
                "already known",
                "{} (deleted: {}, live: {})",
                source.display(),
                entry.deleted,
                entry.live
            );
            let outcome = if entry.deleted {
                Registration::Reactivated
            } else if claim && !entry.live {
                Registration::Reclaimed
            } else {
                return Registration::AlreadyWatched;
            };
            entry.deleted = false;
            entry.live |= claim;
            return outcome;
        }

        let name = basename(output);
        let clash = entries
            .values()
            .position(|e| e.output == output || e.output_name() == name);
        if let Some(index) = clash {
            let existing = &entries[index];
            if !existing.deleted {
                return Registration::Conflict {
                    existing: existing.source.clone(),
                };
            }

            // A deleted entry hands its slot and revision to the new source
            let previous = existing.source.clone();
            let mut entry = WatchedEntry::new(source.to_path_buf(), output.to_path_buf(), claim);
            entry.revision = existing.revision;
            entries.shift_remove_index(index);
            entries.shift_insert(index, source.to_path_buf(), entry);
            return Registration::Replaced { previous };
        }

        entries.insert(
            source.to_path_buf(),
            WatchedEntry::new(source.to_path_buf(), output.to_path_buf(), claim),
        );
        Registration::Inserted
    }

    /// True iff a non-deleted entry exists for `source`.
    pub fn is_watched(&self, source: &Path) -> bool {
        self.entries
            .lock()
            .get(source)
            .is_some_and(|e| !e.deleted)
    }

    /// Mark the watcher lineage for `source` as gone, so the next scan
    /// starts a new one.
    pub fn release(&self, source: &Path) {
        if let Some(entry) = self.entries.lock().get_mut(source) {
            entry.live = false;
        }
    }

    /// Bump the revision of every entry producing `output`.
    pub fn update(&self, output: &Path) {
        let matched = {
            let mut entries = self.entries.lock();
            let mut matched = 0;
            for entry in entries.values_mut().filter(|e| e.output == output) {
                entry.revision += 1;
                matched += 1;
                crate::log_event!(
                    "registry",
                    "revision",
                    "{} r{}",
                    entry.output_name(),
                    entry.revision
                );
            }
            matched
        };

        for _ in 0..matched {
            self.broadcaster.send(RegistryEvent::Updated {
                output: output.to_path_buf(),
            });
        }
    }

    /// Flag every entry producing `output` as deleted.
    pub fn delete(&self, output: &Path) {
        let matched = {
            let mut entries = self.entries.lock();
            let mut matched = 0;
            for entry in entries.values_mut().filter(|e| e.output == output) {
                entry.deleted = true;
                entry.live = false;
                matched += 1;
            }
            matched
        };

        if matched > 0 {
            crate::log_event!("registry", "deleted", "{}", output.display());
        }
        for _ in 0..matched {
            self.broadcaster.send(RegistryEvent::Deleted {
                output: output.to_path_buf(),
            });
        }
    }

    /// Apply a notification coming from a watcher lineage.
    pub fn apply(&self, event: WatcherEvent) {
        match event {
            WatcherEvent::Converted { output } => self.update(&output),
            WatcherEvent::SourceMissing { output } => self.delete(&output),
            WatcherEvent::Released { source } => self.release(&source),
        }
    }

    /// Output file names in insertion order.
    pub fn watched_files(&self) -> Vec<String> {
        self.entries
            .lock()
            .values()
            .map(WatchedEntry::output_name)
            .collect()
    }

    /// Name, revision and deleted flag per entry, in insertion order.
    pub fn watched_files_details(&self) -> Vec<WatchedFileDetails> {
        self.entries
            .lock()
            .values()
            .map(|e| WatchedFileDetails {
                name: e.output_name(),
                rev: e.revision,
                deleted: e.deleted,
            })
            .collect()
    }

    /// True iff some entry, deleted or not, produces `name`.
    pub fn has_image(&self, name: &str) -> bool {
        self.entries.lock().values().any(|e| e.output_name() == name)
    }

    /// Absolute output path of the first entry producing `name`.
    pub fn full_image_path(&self, name: &str) -> Option<PathBuf> {
        self.entries
            .lock()
            .values()
            .find(|e| e.output_name() == name)
            .map(|e| e.output.clone())
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> Vec<WatchedEntry> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
