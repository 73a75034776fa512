//! Converters turning a source board into a raster snapshot.
//!
//! The observer treats conversion as opaque: it hands a converter a source
//! path and an output path and only looks at the result.

mod command;
mod merged;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ConverterConfig;
use crate::observer::ConvertError;

pub use command::CommandConverter;
pub use merged::MergedImageConverter;

/// Produces `output` from `source`.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Converter name for logging.
    fn name(&self) -> &str;

    /// Write a fresh output file for `source`.
    ///
    /// The output must be fully regenerated, never patched, so overlapping
    /// calls for the same pair are harmless.
    async fn convert(&self, source: &Path, output: &Path) -> Result<(), ConvertError>;
}

/// Build the converter selected by the settings.
pub fn from_config(config: &ConverterConfig) -> Result<Arc<dyn Converter>, ConvertError> {
    if config.command.is_empty() {
        Ok(Arc::new(MergedImageConverter))
    } else {
        Ok(Arc::new(CommandConverter::new(config.command.clone())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_uses_merged_image() {
        let converter = from_config(&ConverterConfig::default()).unwrap();
        assert_eq!(converter.name(), "merged-image");
    }

    #[test]
    fn test_command_config_uses_command() {
        let config = ConverterConfig {
            command: vec!["ora2png".into(), "{source}".into(), "{output}".into()],
        };
        let converter = from_config(&config).unwrap();
        assert_eq!(converter.name(), "command");
    }
}
