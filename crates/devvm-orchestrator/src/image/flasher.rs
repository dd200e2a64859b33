//! Detection and extraction of "flasher" images, which carry the real bootable
//! image as a file inside one of their root partitions.
//!
//! Detection only reads the partition table and one directory, in-process.
//! Extraction copies a multi-gigabyte file out of an ext4 filesystem, so it is
//! delegated to `losetup` and `debugfs` inside a disposable helper container.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use devvm_common::{DevVmError, FlasherInfo, Result};
use ext4_view::{Ext4, Ext4Read};
use tracing::{debug, info, instrument};

use super::partition::{partition_display_name, read_partition_table};
use crate::constants::{
    FLASHER_PARTITION_PREFIXES, FLASHER_PAYLOAD_DIR, FLASHER_PAYLOAD_SUFFIX, HELPER_INPUT_PATH,
    HELPER_OUTPUT_DIR,
};
use crate::engine::{Bind, ContainerEngine};
use crate::helper::{helper_spec, run_helper, shell_quote};

type ReadError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A view of one partition as a standalone filesystem device.
struct PartitionReader {
    file: File,
    offset: u64,
}

impl Ext4Read for PartitionReader {
    fn read(&mut self, start_byte: u64, dst: &mut [u8]) -> std::result::Result<(), ReadError> {
        self.file.seek(SeekFrom::Start(self.offset + start_byte))?;
        self.file.read_exact(dst)?;
        Ok(())
    }
}

pub fn is_flasher_partition_name(name: &str) -> bool {
    FLASHER_PARTITION_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

fn find_payload(file: &File, offset: u64) -> std::result::Result<Option<String>, ReadError> {
    let reader = PartitionReader {
        file: file.try_clone()?,
        offset,
    };
    let fs = Ext4::load(Box::new(reader))?;
    for entry in fs.read_dir(FLASHER_PAYLOAD_DIR)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Ok(name) = name.as_str() {
            if name.ends_with(FLASHER_PAYLOAD_SUFFIX) {
                return Ok(Some(name.to_string()));
            }
        }
    }
    Ok(None)
}

fn inspect_flasher(path: &Path) -> std::result::Result<FlasherInfo, ReadError> {
    let mut file = File::open(path)?;
    let table = read_partition_table(&mut file)?;
    for partition in &table.partitions {
        let Some(name) = partition_display_name(&mut file, partition)? else {
            continue;
        };
        if !is_flasher_partition_name(&name) {
            continue;
        }
        debug!(partition = %name, offset = partition.offset, "Found candidate flasher partition");
        match find_payload(&file, partition.offset) {
            Ok(Some(inner)) => {
                return Ok(FlasherInfo {
                    is_flasher: true,
                    inner_image_name: Some(inner),
                    partition_name: Some(name),
                    partition_offset: Some(partition.offset),
                });
            }
            Ok(None) => {}
            Err(e) => debug!(
                partition = %name,
                error = %e,
                "Could not list flasher payload directory"
            ),
        }
    }
    Ok(FlasherInfo::not_flasher())
}

/// Never fails: anything unreadable is reported as "not a flasher".
#[instrument]
pub async fn detect_flasher(path: &Path) -> FlasherInfo {
    let owned = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || inspect_flasher(&owned)).await;
    match result {
        Ok(Ok(info)) => info,
        Ok(Err(e)) => {
            debug!(error = %e, "Flasher detection failed; treating as regular image");
            FlasherInfo::not_flasher()
        }
        Err(e) => {
            debug!(error = %e, "Flasher detection task failed");
            FlasherInfo::not_flasher()
        }
    }
}

/// Script run inside the helper: loop-attach the partition read-only, dump the
/// payload with debugfs, always detach.
///
/// `inner_name` must already have passed [`is_safe_payload_name`]; debugfs has
/// its own quoting rules, so names are restricted instead of escaped.
pub fn extraction_script(offset: u64, inner_name: &str) -> String {
    let source = format!("{FLASHER_PAYLOAD_DIR}/{inner_name}");
    let target = format!("{HELPER_OUTPUT_DIR}/{inner_name}");
    format!(
        "set -eu\n\
         LOOP=$(losetup --find --show --read-only --offset {offset} {HELPER_INPUT_PATH})\n\
         trap 'losetup -d \"$LOOP\"' EXIT\n\
         debugfs -R \"dump -p {source} {target}\" \"$LOOP\"\n\
         test -s {quoted}\n",
        quoted = shell_quote(&target)
    )
}

fn is_payload_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

pub fn is_safe_payload_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && name.chars().all(is_payload_char)
}

/// Pull the nested image out of a flasher into `output_dir`.
#[instrument(skip(engine, info))]
pub async fn extract_flasher_image<E: ContainerEngine + ?Sized>(
    engine: &E,
    flasher_path: &Path,
    info: &FlasherInfo,
    output_dir: &Path,
) -> Result<PathBuf> {
    let (Some(inner), Some(offset)) = (&info.inner_image_name, info.partition_offset) else {
        return Err(DevVmError::validation(
            format!("{} is not a flasher image", flasher_path.display()),
            "Only images detected as flasher images can be unwrapped",
        ));
    };
    if !is_safe_payload_name(inner) {
        return Err(DevVmError::validation(
            format!("Refusing to extract oddly named payload {inner:?}"),
            "Unwrap the image manually with losetup and debugfs",
        ));
    }

    tokio::fs::create_dir_all(output_dir).await?;
    let spec = helper_spec(
        "extract",
        extraction_script(offset, inner),
        vec![
            Bind::read_only(flasher_path, HELPER_INPUT_PATH),
            Bind::read_write(output_dir, HELPER_OUTPUT_DIR),
        ],
    );

    info!(inner = %inner, offset, "Extracting nested image from flasher");
    let output = run_helper(engine, &spec).await?;
    if !output.success() {
        return Err(DevVmError::EngineOutput {
            message: format!(
                "Extracting {inner} from {} failed with exit code {}",
                flasher_path.display(),
                output.exit_code
            ),
            output: output.output,
        });
    }
    Ok(output_dir.join(inner))
}
