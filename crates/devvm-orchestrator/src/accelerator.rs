//! Hardware-acceleration selection for the emulator.
//!
//! Docker Desktop on macOS and Windows runs containers inside its own Linux VM,
//! so the host hypervisor (HVF, WHPX) is never reachable from the runner. Only a
//! Linux host with an accessible `/dev/kvm` gets hardware acceleration.

use std::path::Path;

use devvm_common::AcceleratorInfo;
use tracing::debug;

use crate::constants::KVM_DEVICE;

pub const ACCEL_HARDWARE_CHAIN: &str = "kvm:tcg";
pub const ACCEL_SOFTWARE: &str = "tcg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPlatform {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl HostPlatform {
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            HostPlatform::Linux
        } else if cfg!(target_os = "macos") {
            HostPlatform::MacOs
        } else if cfg!(target_os = "windows") {
            HostPlatform::Windows
        } else {
            HostPlatform::Other
        }
    }
}

/// What the host reports about its virtualization device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvmAccess {
    Missing,
    Denied,
    Available,
}

impl KvmAccess {
    pub fn check(device: &Path) -> Self {
        if !device.exists() {
            return KvmAccess::Missing;
        }
        if readable_and_writable(device) {
            KvmAccess::Available
        } else {
            KvmAccess::Denied
        }
    }
}

#[cfg(unix)]
fn readable_and_writable(path: &Path) -> bool {
    use nix::unistd::{access, AccessFlags};
    access(path, AccessFlags::R_OK | AccessFlags::W_OK).is_ok()
}

#[cfg(not(unix))]
fn readable_and_writable(_path: &Path) -> bool {
    false
}

fn software_only(description: impl Into<String>, warning: Option<String>) -> AcceleratorInfo {
    AcceleratorInfo {
        accel: ACCEL_SOFTWARE.to_string(),
        hardware: false,
        warning,
        description: description.into(),
    }
}

/// Pure decision over the platform and the device check.
pub fn decide_accelerator(platform: HostPlatform, kvm: KvmAccess) -> AcceleratorInfo {
    match platform {
        HostPlatform::MacOs => software_only(
            "Software emulation (TCG): Hypervisor.framework is not reachable \
             from inside Docker containers on macOS",
            None,
        ),
        HostPlatform::Windows => software_only(
            "Software emulation (TCG): Hyper-V/WHPX is not reachable \
             from inside Docker containers on Windows",
            None,
        ),
        HostPlatform::Linux => match kvm {
            KvmAccess::Missing => software_only(
                format!(
                    "Software emulation (TCG): {KVM_DEVICE} not found, \
                     hardware virtualization is unavailable or disabled"
                ),
                None,
            ),
            KvmAccess::Denied => software_only(
                "Software emulation (TCG): no permission to use KVM",
                Some(format!(
                    "{KVM_DEVICE} exists but is not readable and writable by this user. \
                     Add yourself to the kvm group (sudo usermod -aG kvm $USER) and log in again \
                     to enable hardware acceleration."
                )),
            ),
            KvmAccess::Available => AcceleratorInfo {
                accel: ACCEL_HARDWARE_CHAIN.to_string(),
                hardware: true,
                warning: None,
                description: "Hardware acceleration (KVM), falling back to TCG".to_string(),
            },
        },
        HostPlatform::Other => software_only(
            "Software emulation (TCG): hardware acceleration is not supported on this platform",
            None,
        ),
    }
}

pub fn detect_accelerator() -> AcceleratorInfo {
    let platform = HostPlatform::current();
    let kvm = match platform {
        HostPlatform::Linux => KvmAccess::check(Path::new(KVM_DEVICE)),
        _ => KvmAccess::Missing,
    };
    let info = decide_accelerator(platform, kvm);
    debug!(?platform, ?kvm, accel = %info.accel, "Selected accelerator");
    info
}
