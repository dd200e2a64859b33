//! Private, mutable duplicates of user-supplied images.

use std::path::{Path, PathBuf};

use chrono::Utc;
use devvm_common::{DevVmError, Result};
use tracing::{debug, info, warn};

use crate::constants::WORKING_COPY_PREFIX;

/// `<prefix>-<epoch millis>-<original basename>`
pub fn working_copy_name(source: &Path, epoch_millis: i64) -> String {
    let basename = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image.img".to_string());
    format!("{WORKING_COPY_PREFIX}-{epoch_millis}-{basename}")
}

/// Copy `source` byte-for-byte into `cache_dir`. The source is never modified.
pub async fn create_working_copy(source: &Path, cache_dir: &Path) -> Result<PathBuf> {
    if !super::image_exists(source).await {
        return Err(DevVmError::validation(
            format!("Image not found: {}", source.display()),
            "Check the path, or download an OS image first",
        ));
    }

    tokio::fs::create_dir_all(cache_dir).await?;
    let name = working_copy_name(source, Utc::now().timestamp_millis());
    let destination = cache_dir.join(name);

    info!(
        source = %source.display(),
        destination = %destination.display(),
        "Creating working copy"
    );
    if let Err(e) = tokio::fs::copy(source, &destination).await {
        // Don't leave a truncated copy behind.
        let _ = tokio::fs::remove_file(&destination).await;
        return Err(e.into());
    }
    Ok(destination)
}

/// Best-effort delete. A missing file counts as removed.
pub async fn remove_working_copy(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "Removed working copy");
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove working copy");
            false
        }
    }
}
