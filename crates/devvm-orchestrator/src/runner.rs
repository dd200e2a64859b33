//! The runner image every instance and helper container starts from.

use devvm_common::{DevVmError, Result};
use tracing::{info, instrument};

use crate::constants::RUNNER_IMAGE;
use crate::engine::ContainerEngine;

pub const DOCKERFILE: &str = include_str!("../assets/Dockerfile");
pub const ENTRY_SCRIPT: &str = include_str!("../assets/entry.sh");

fn append_file(
    archive: &mut tar::Builder<Vec<u8>>,
    path: &str,
    contents: &[u8],
    mode: u32,
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_cksum();
    archive.append_data(&mut header, path, contents)
}

/// In-memory tar build context holding the Dockerfile and entry script.
pub fn build_context() -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());
    append_file(&mut archive, "Dockerfile", DOCKERFILE.as_bytes(), 0o644)?;
    append_file(&mut archive, "entry.sh", ENTRY_SCRIPT.as_bytes(), 0o755)?;
    archive.into_inner()
}

/// Rebuild the runner image. Always runs; the engine's layer cache keeps
/// repeat builds cheap and edits to the assets are always picked up.
#[instrument(skip(engine))]
pub async fn build_runner_image<E: ContainerEngine + ?Sized>(engine: &E) -> Result<()> {
    info!(image = RUNNER_IMAGE, "Building runner image");
    let context = build_context()?;
    engine
        .build_image(RUNNER_IMAGE, context)
        .await
        .map_err(|e| DevVmError::Engine(format!("Failed to build {RUNNER_IMAGE}: {e}")))
}

pub async fn runner_image_exists<E: ContainerEngine + ?Sized>(engine: &E) -> Result<bool> {
    Ok(engine.image_exists(RUNNER_IMAGE).await?)
}
