//! Image preparation pipeline: validate a candidate disk image, refuse or
//! unwrap flasher images, copy it into the cache and grow it.

use std::path::{Path, PathBuf};

use devvm_common::{DevVmError, ExpandResult, ImageFormat, Result};
use tokio::io::AsyncReadExt;
use tracing::{info, instrument, warn};

pub mod expand;
pub mod flasher;
pub mod guest_arch;
pub mod partition;
pub mod size;
pub mod working_copy;

pub use expand::expand_image;
pub use flasher::{detect_flasher, extract_flasher_image};
pub use guest_arch::detect_guest_arch;
pub use size::{format_bytes, parse_size_string};
pub use working_copy::{create_working_copy, remove_working_copy};

use crate::engine::ContainerEngine;

const GZIP_MAGIC: &[u8] = &[0x1F, 0x8B];
const ZIP_MAGIC: &[u8] = &[0x50, 0x4B, 0x03, 0x04];

/// True only for an existing regular file.
pub async fn image_exists(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

pub fn format_from_magic(header: &[u8]) -> ImageFormat {
    if header.starts_with(GZIP_MAGIC) {
        ImageFormat::Gzip
    } else if header.starts_with(ZIP_MAGIC) {
        ImageFormat::Zip
    } else {
        ImageFormat::Raw
    }
}

/// Sniff the first four bytes of `path`.
pub async fn detect_format(path: &Path) -> Result<ImageFormat> {
    let file = tokio::fs::File::open(path).await?;
    let mut header = Vec::with_capacity(4);
    file.take(4).read_to_end(&mut header).await?;
    Ok(format_from_magic(&header))
}

/// Fail with the exact decompression command unless the image is raw.
pub async fn validate_format(path: &Path) -> Result<()> {
    let shown = path.display();
    match detect_format(path).await? {
        ImageFormat::Raw => Ok(()),
        ImageFormat::Gzip => Err(DevVmError::validation(
            format!("{shown} is gzip-compressed; a raw disk image is required"),
            format!("Decompress it first: gunzip -k \"{shown}\""),
        )),
        ImageFormat::Zip => Err(DevVmError::validation(
            format!("{shown} is a zip archive; a raw disk image is required"),
            format!("Extract it first: unzip \"{shown}\""),
        )),
    }
}

/// Refuse flasher images: they boot into an installer that wipes the disk.
pub async fn ensure_not_flasher(path: &Path) -> Result<()> {
    let info = detect_flasher(path).await;
    if !info.is_flasher {
        return Ok(());
    }
    let inner = info.inner_image_name.unwrap_or_default();
    Err(DevVmError::validation(
        format!(
            "{} is a flasher image (it wraps {inner}) and cannot boot as a VM",
            path.display()
        ),
        "Download the non-flasher variant of this OS image, or unwrap the nested \
         image out-of-band and start the VM from that file",
    ))
}

/// Result of [`prepare_image`].
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub working_copy: PathBuf,
    pub expansion: Option<ExpandResult>,
}

/// Validate `source`, copy it into `cache_dir` and optionally grow the copy.
///
/// On failure after the copy exists, the copy is removed.
#[instrument(skip(engine))]
pub async fn prepare_image<E: ContainerEngine + ?Sized>(
    engine: &E,
    source: &Path,
    cache_dir: &Path,
    size: Option<&str>,
) -> Result<PreparedImage> {
    if !image_exists(source).await {
        return Err(DevVmError::validation(
            format!("Image not found: {}", source.display()),
            "Pass the path of a raw OS disk image",
        ));
    }
    validate_format(source).await?;
    ensure_not_flasher(source).await?;
    // Parse before copying so a bad size never costs a multi-GB copy.
    if let Some(size) = size {
        parse_size_string(size)?;
    }

    let working_copy = create_working_copy(source, cache_dir).await?;
    let expansion = match size {
        Some(size) => match expand_image(engine, &working_copy, size).await {
            Ok(result) => Some(result),
            Err(e) => {
                if !remove_working_copy(&working_copy).await {
                    warn!(path = %working_copy.display(), "Leaving working copy behind");
                }
                return Err(e);
            }
        },
        None => None,
    };

    info!(path = %working_copy.display(), "Image prepared");
    Ok(PreparedImage {
        working_copy,
        expansion,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_detection() {
        let magic = format_from_magic;
        assert_eq!(magic(&[0x1F, 0x8B, 0x08, 0x00]), ImageFormat::Gzip);
        assert_eq!(magic(&[0x50, 0x4B, 0x03, 0x04]), ImageFormat::Zip);
        assert_eq!(magic(&[0x50, 0x4B, 0x05, 0x06]), ImageFormat::Raw);
        assert_eq!(magic(&[0xEB, 0x3C, 0x90, 0x00]), ImageFormat::Raw);
        assert_eq!(magic(&[]), ImageFormat::Raw);
    }

    #[tokio::test]
    async fn test_validate_format_by_content() {
        let dir = tempfile::tempdir().unwrap();
        let gz = dir.path().join("a.img");
        tokio::fs::write(&gz, [0x1F, 0x8B, 0x08, 0x00, 0x00]).await.unwrap();
        let err = validate_format(&gz).await.unwrap_err().to_string();
        assert!(err.contains("gunzip -k"));

        let zip = dir.path().join("b.img");
        tokio::fs::write(&zip, [0x50, 0x4B, 0x03, 0x04]).await.unwrap();
        assert_eq!(detect_format(&zip).await.unwrap(), ImageFormat::Zip);
        let err = validate_format(&zip).await.unwrap_err().to_string();
        assert!(err.contains("unzip"));

        let raw = dir.path().join("c.img");
        tokio::fs::write(&raw, [0u8; 16]).await.unwrap();
        assert!(validate_format(&raw).await.is_ok());
    }

    #[tokio::test]
    async fn test_image_exists_rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!image_exists(dir.path()).await);
        assert!(!image_exists(&dir.path().join("missing")).await);
        let file = dir.path().join("disk.img");
        tokio::fs::write(&file, b"x").await.unwrap();
        assert!(image_exists(&file).await);
    }
}
