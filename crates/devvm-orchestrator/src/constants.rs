//! Fixed values shared between the orchestrator and the runner image.
//!
//! The entry script inside the runner reads the environment variable names and
//! mount paths defined here, so changing one side means changing both.

/// Tag of the image every instance and helper container runs from.
pub const RUNNER_IMAGE: &str = "devvm-runner:latest";

/// Port the guest exposes its console/SSH service on, inside the container.
pub const GUEST_CONSOLE_PORT: u16 = 22222;

/// First host port tried when allocating a forwarded port.
pub const DEFAULT_BASE_PORT: u16 = 22222;

/// Where the working copy is bind-mounted inside an instance container.
pub const IMAGE_MOUNT_PATH: &str = "/image/disk.img";

pub const ENV_MEMORY: &str = "VM_MEMORY";
pub const ENV_CPUS: &str = "VM_CPUS";
pub const ENV_ACCEL: &str = "VM_ACCEL";
pub const ENV_ARCH: &str = "VM_ARCH";

pub const DEFAULT_NAME_PREFIX: &str = "devvm-";
pub const WORKING_COPY_PREFIX: &str = "devvm";
pub const DEFAULT_MEMORY: &str = "2G";
pub const DEFAULT_CPUS: u32 = 4;

/// Seconds the engine waits for a graceful stop before killing.
pub const STOP_TIMEOUT_SECS: i64 = 10;

/// Attempts made when a freshly chosen name or port turns out to be taken.
pub const LAUNCH_ATTEMPTS: usize = 3;

pub const LABEL_MANAGED: &str = "devvm.managed";
pub const LABEL_IMAGE: &str = "devvm.image";
pub const LABEL_HELPER: &str = "devvm.helper";

pub const KVM_DEVICE: &str = "/dev/kvm";

/// Only this much of an image is scanned for the ARM64 firmware marker.
pub const GUEST_ARCH_SCAN_BYTES: u64 = 100 * 1024 * 1024;
pub const ARM64_FIRMWARE_MARKER: &[u8] = b"BOOTAA64.EFI";

/// Partition names (legacy first) that may hold a nested flasher payload.
pub const FLASHER_PARTITION_PREFIXES: &[&str] = &["flash-rootA", "resin-rootA", "balena-rootA"];
pub const FLASHER_PAYLOAD_DIR: &str = "/opt";
pub const FLASHER_PAYLOAD_SUFFIX: &str = ".balenaos-img";

/// Mount points used by the helper containers.
pub const HELPER_INPUT_PATH: &str = "/work/input.img";
pub const HELPER_OUTPUT_DIR: &str = "/work/out";
