//! Error types for the board observer.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from setting up a watch on a source file.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Failed to initialize observer: {reason}")]
    InitFailed { reason: String },

    #[error("Source file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Cannot watch {path}: {reason}")]
    SetupFailed { path: PathBuf, reason: String },
}

impl WatchError {
    /// Classify a `notify` failure for `path`.
    pub fn from_notify(path: PathBuf, e: notify::Error) -> Self {
        let not_found = match &e.kind {
            notify::ErrorKind::PathNotFound => true,
            notify::ErrorKind::Io(io_err) => io_err.kind() == io::ErrorKind::NotFound,
            _ => false,
        };

        if not_found {
            WatchError::NotFound { path }
        } else {
            WatchError::SetupFailed {
                path,
                reason: e.to_string(),
            }
        }
    }

    /// Classify an I/O failure (e.g. the initial stat) for `path`.
    pub fn from_io(path: PathBuf, e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            WatchError::NotFound { path }
        } else {
            WatchError::SetupFailed {
                path,
                reason: e.to_string(),
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, WatchError::NotFound { .. })
    }
}

/// Errors reported by a converter.
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid OpenRaster archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("{path} has no mergedimage.png")]
    MissingMergedImage { path: PathBuf },

    #[error("Converter command failed ({status}): {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("Converter command line is empty")]
    EmptyCommand,

    #[error("Converter panicked: {0}")]
    Panicked(String),

    #[error("Conversion cancelled")]
    Cancelled,
}

/// Errors from building a snapshot archive.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error while archiving {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Archive task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ArchiveError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ArchiveError::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_path_not_found_is_not_found() {
        let err = notify::Error::path_not_found();
        let classified = WatchError::from_notify(PathBuf::from("/b/board.ora"), err);
        assert!(classified.is_not_found());
    }

    #[test]
    fn test_notify_io_not_found_is_not_found() {
        let err = notify::Error::io(io::Error::from(io::ErrorKind::NotFound));
        let classified = WatchError::from_notify(PathBuf::from("/b/board.ora"), err);
        assert!(classified.is_not_found());
    }

    #[test]
    fn test_other_io_is_setup_failure() {
        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        let classified = WatchError::from_io(PathBuf::from("/b/board.ora"), err);
        assert!(matches!(classified, WatchError::SetupFailed { .. }));
    }
}
