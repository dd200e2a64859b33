use std::path::Path;

use devvm_common::{GuestArch, Result};
use tokio::io::AsyncReadExt;

use crate::constants::{ARM64_FIRMWARE_MARKER, GUEST_ARCH_SCAN_BYTES};

const CHUNK: usize = 1024 * 1024;

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Scan the start of an image for the ARM64 EFI loader name.
pub async fn detect_guest_arch(path: &Path) -> Result<GuestArch> {
    let file = tokio::fs::File::open(path).await?;
    let mut reader = file.take(GUEST_ARCH_SCAN_BYTES);
    let overlap = ARM64_FIRMWARE_MARKER.len() - 1;
    let mut window = Vec::with_capacity(CHUNK + overlap);
    let mut buf = vec![0u8; CHUNK];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(GuestArch::X86_64);
        }
        window.extend_from_slice(&buf[..n]);
        if contains(&window, ARM64_FIRMWARE_MARKER) {
            return Ok(GuestArch::Aarch64);
        }
        // Keep a tail so a marker split across reads is still found.
        let keep = window.len().min(overlap);
        window.drain(..window.len() - keep);
    }
}
