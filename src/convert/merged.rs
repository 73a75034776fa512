//! Built-in converter using the composite stored inside OpenRaster files.
//!
//! An `.ora` file is a zip archive; `mergedimage.png` at its root holds the
//! flattened image. Copying it out is enough to get a PNG snapshot.

use std::fs::File;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use zip::ZipArchive;
use zip::result::ZipError;

use super::Converter;
use crate::observer::ConvertError;

/// Name of the flattened composite inside an OpenRaster archive.
pub const MERGED_IMAGE: &str = "mergedimage.png";

#[derive(Debug, Default, Clone, Copy)]
pub struct MergedImageConverter;

#[async_trait]
impl Converter for MergedImageConverter {
    fn name(&self) -> &str {
        "merged-image"
    }

    async fn convert(&self, source: &Path, output: &Path) -> Result<(), ConvertError> {
        let source = source.to_path_buf();
        let output = output.to_path_buf();

        tokio::task::spawn_blocking(move || extract_merged_image(&source, &output))
            .await
            .map_err(|e| ConvertError::Panicked(e.to_string()))?
    }
}

/// Copy `mergedimage.png` out of `source` into `output`.
///
/// Writes to a temporary file next to `output` and renames it into place,
/// so readers never observe a half-written PNG.
fn extract_merged_image(source: &Path, output: &Path) -> Result<(), ConvertError> {
    let mut archive = ZipArchive::new(File::open(source)?)?;
    let mut merged = match archive.by_name(MERGED_IMAGE) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => {
            return Err(ConvertError::MissingMergedImage {
                path: source.to_path_buf(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    let dir = output.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    io::copy(&mut merged, &mut tmp)?;
    tmp.persist(output).map_err(|e| e.error)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    fn write_ora(path: &Path, entries: &[(&str, &[u8])]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        let options = SimpleFileOptions::default();
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[tokio::test]
    async fn test_extracts_merged_image() {
        let dir = TempDir::new().unwrap();
        let ora = dir.path().join("board.ora");
        let png = dir.path().join("board.png");
        write_ora(
            &ora,
            &[
                ("mimetype", b"image/openraster"),
                ("stack.xml", b"<image/>"),
                (MERGED_IMAGE, b"\x89PNG fake pixels"),
            ],
        );

        MergedImageConverter.convert(&ora, &png).await.unwrap();

        assert_eq!(std::fs::read(&png).unwrap(), b"\x89PNG fake pixels");
    }

    #[tokio::test]
    async fn test_overwrites_previous_output() {
        let dir = TempDir::new().unwrap();
        let ora = dir.path().join("board.ora");
        let png = dir.path().join("board.png");
        std::fs::write(&png, b"stale").unwrap();
        write_ora(&ora, &[(MERGED_IMAGE, b"fresh")]);

        MergedImageConverter.convert(&ora, &png).await.unwrap();

        assert_eq!(std::fs::read(&png).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_missing_merged_image() {
        let dir = TempDir::new().unwrap();
        let ora = dir.path().join("board.ora");
        write_ora(&ora, &[("stack.xml", b"<image/>")]);

        let err = MergedImageConverter
            .convert(&ora, &dir.path().join("board.png"))
            .await
            .unwrap_err();

        assert!(matches!(err, ConvertError::MissingMergedImage { .. }));
    }

    #[tokio::test]
    async fn test_truncated_file_is_an_archive_error() {
        let dir = TempDir::new().unwrap();
        let ora = dir.path().join("board.ora");
        std::fs::write(&ora, b"half-written").unwrap();

        let err = MergedImageConverter
            .convert(&ora, &dir.path().join("board.png"))
            .await
            .unwrap_err();

        assert!(matches!(err, ConvertError::Archive(_)));
    }
}
