use std::path::Path;

use devvm_common::{DevVmError, ExpandResult, Result};
use tracing::{info, instrument};

use super::size::{format_bytes, parse_size_string};
use crate::constants::HELPER_INPUT_PATH;
use crate::engine::{Bind, ContainerEngine};
use crate::helper::{helper_spec, run_helper};

pub fn resize_script(target_bytes: u64) -> String {
    format!("set -eu\nqemu-img resize -f raw {HELPER_INPUT_PATH} {target_bytes}\n")
}

/// Grow `image` in place to at least `size` (e.g. `"8G"`). Never shrinks.
#[instrument(skip(engine))]
pub async fn expand_image<E: ContainerEngine + ?Sized>(
    engine: &E,
    image: &Path,
    size: &str,
) -> Result<ExpandResult> {
    let target = parse_size_string(size)?;
    let old_size = tokio::fs::metadata(image).await?.len();

    if old_size >= target {
        info!(
            current = %format_bytes(old_size),
            requested = %format_bytes(target),
            "Image already large enough, skipping expansion"
        );
        return Ok(ExpandResult {
            expanded: false,
            old_size,
            new_size: old_size,
        });
    }

    let spec = helper_spec(
        "expand",
        resize_script(target),
        vec![Bind::read_write(image, HELPER_INPUT_PATH)],
    );
    let output = run_helper(engine, &spec).await?;
    if !output.success() {
        return Err(DevVmError::EngineOutput {
            message: format!(
                "Resizing {} to {} failed with exit code {}",
                image.display(),
                format_bytes(target),
                output.exit_code
            ),
            output: output.output,
        });
    }

    let new_size = tokio::fs::metadata(image).await?.len();
    info!(
        from = %format_bytes(old_size),
        to = %format_bytes(new_size),
        "Expanded image"
    );
    Ok(ExpandResult {
        expanded: true,
        old_size,
        new_size,
    })
}
