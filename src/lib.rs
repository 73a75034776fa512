//! Live OpenRaster board mirror.
//!
//! Watches a directory of `.ora` files, keeps a PNG snapshot of each one
//! up to date, and tracks a revision counter per file for a serving layer
//! to poll.

pub mod config;
pub mod convert;
pub mod logging;
pub mod observer;

pub use config::Settings;
pub use convert::{CommandConverter, Converter, MergedImageConverter};
pub use observer::{
    ArchiveError, ArchiveExporter, ConvertError, Observer, ObserverBuilder, ObserverOptions,
    RegistryEvent, WatchError, WatchRegistry, WatchedFileDetails,
};
