//! Snapshot archive of all current outputs.
//!
//! Every registry entry's output goes under `boards/`, deleted entries
//! included, followed by `boards/INFO.txt` listing names and revisions.
//! Files are copied into the zip one at a time rather than buffered.

use std::fs::File;
use std::io::{self, Seek, Write};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Local};
use tempfile::NamedTempFile;
use zip::{CompressionMethod, ZipWriter};
use zip::write::SimpleFileOptions;

use super::error::ArchiveError;
use super::registry::{WatchRegistry, WatchedEntry};

/// Directory prefix inside the archive.
pub const ARCHIVE_PREFIX: &str = "boards";

/// Name of the generated manifest entry.
pub const MANIFEST_NAME: &str = "INFO.txt";

/// What went into an archive.
#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    /// Output names written to the archive.
    pub files: Vec<String>,
    /// Entries whose output has never been generated.
    pub missing: Vec<String>,
    pub created: DateTime<Local>,
}

/// A finished archive in a temporary file, removed when dropped.
pub struct Snapshot {
    pub file: NamedTempFile,
    pub summary: ArchiveSummary,
}

impl Snapshot {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Builds zip snapshots from the registry.
#[derive(Clone)]
pub struct ArchiveExporter {
    registry: Arc<WatchRegistry>,
}

impl ArchiveExporter {
    pub fn new(registry: Arc<WatchRegistry>) -> Self {
        Self { registry }
    }

    /// Build the archive into a temporary file.
    pub async fn zip(&self) -> Result<Snapshot, ArchiveError> {
        let entries = self.registry.entries();

        tokio::task::spawn_blocking(move || -> Result<Snapshot, ArchiveError> {
            let mut file = NamedTempFile::new().map_err(|e| ArchiveError::io("<tempfile>", e))?;
            let summary = write_archive(&entries, file.as_file_mut())?;
            Ok(Snapshot { file, summary })
        })
        .await?
    }

    /// Build the archive at `path`.
    pub async fn zip_to(&self, path: &Path) -> Result<ArchiveSummary, ArchiveError> {
        let entries = self.registry.entries();
        let path = path.to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<ArchiveSummary, ArchiveError> {
            let mut file = File::create(&path).map_err(|e| ArchiveError::io(&path, e))?;
            write_archive(&entries, &mut file)
        })
        .await?
    }

    /// Callback flavour of [`zip`](Self::zip) for callers that do not await.
    pub fn zip_with<F>(&self, callback: F)
    where
        F: FnOnce(Result<Snapshot, ArchiveError>) + Send + 'static,
    {
        let exporter = self.clone();
        tokio::spawn(async move {
            callback(exporter.zip().await);
        });
    }
}

/// Stream all outputs plus the manifest into `writer`.
pub fn write_archive<W: Write + Seek>(
    entries: &[WatchedEntry],
    writer: W,
) -> Result<ArchiveSummary, ArchiveError> {
    let mut zip = ZipWriter::new(writer);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut files = Vec::new();
    let mut missing = Vec::new();
    let mut manifest = String::from("This ORA board snapshot contains the following files:");

    for entry in entries {
        let name = entry.output_name();
        manifest.push_str(&format!("\n* {name}, r{}", entry.revision));
        if entry.deleted {
            manifest.push_str(" (deleted)");
        }

        let mut input = match File::open(&entry.output) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                crate::debug_event!("archive", "no output yet", "{name}");
                manifest.push_str(" (missing)");
                missing.push(name);
                continue;
            }
            Err(e) => return Err(ArchiveError::io(&entry.output, e)),
        };

        zip.start_file(format!("{ARCHIVE_PREFIX}/{name}"), options)?;
        io::copy(&mut input, &mut zip).map_err(|e| ArchiveError::io(&entry.output, e))?;
        files.push(name);
    }

    let created = Local::now();
    manifest.push_str(&format!(
        "\n\nCreated on {}",
        created.format("%Y-%m-%d %H:%M:%S")
    ));

    zip.start_file(format!("{ARCHIVE_PREFIX}/{MANIFEST_NAME}"), options)?;
    zip.write_all(manifest.as_bytes())
        .map_err(|e| ArchiveError::io(MANIFEST_NAME, e))?;
    zip.finish()?;

    crate::log_event!(
        "archive",
        "finalized",
        "{} files, {} missing",
        files.len(),
        missing.len()
    );

    Ok(ArchiveSummary {
        files,
        missing,
        created,
    })
}
