//! Host architecture normalization and device-type compatibility checks.

use devvm_common::{DevVmError, HostArch, Result};

const ARCH_ALIASES: &[(&str, HostArch)] = &[
    ("x64", HostArch::X64),
    ("x86_64", HostArch::X64),
    ("amd64", HostArch::X64),
    ("arm64", HostArch::Arm64),
    ("aarch64", HostArch::Arm64),
];

/// Device types that can boot in a local VM, with the host architecture they
/// run natively on.
const DEVICE_TYPE_ARCH: &[(&str, HostArch)] = &[
    ("generic-amd64", HostArch::X64),
    ("genericx86-64-ext", HostArch::X64),
    ("intel-nuc", HostArch::X64),
    ("qemux86-64", HostArch::X64),
    ("generic-aarch64", HostArch::Arm64),
    ("qemuarm64", HostArch::Arm64),
];

/// Map a reported CPU architecture string onto a supported value.
pub fn normalize_arch(reported: &str) -> Result<HostArch> {
    let lowered = reported.to_ascii_lowercase();
    ARCH_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lowered)
        .map(|(_, arch)| *arch)
        .ok_or_else(|| {
            DevVmError::validation(
                format!("Unsupported host architecture: {reported}"),
                "Supported architectures: x64 (x86_64, amd64), arm64 (aarch64)",
            )
        })
}

pub fn detect_host_arch() -> Result<HostArch> {
    normalize_arch(std::env::consts::ARCH)
}

pub fn expected_host_arch(device_type: &str) -> Option<HostArch> {
    DEVICE_TYPE_ARCH
        .iter()
        .find(|(dt, _)| *dt == device_type)
        .map(|(_, arch)| *arch)
}

/// Returns a warning when `device_type` is not native to `host`.
///
/// Never an error: foreign architectures are emulated, only slower.
pub fn check_architecture_match(device_type: &str, host: HostArch) -> Option<String> {
    match expected_host_arch(device_type) {
        Some(expected) if expected == host => None,
        Some(expected) => Some(format!(
            "Device type {device_type} targets {expected} but this host is {host}. \
             The VM will run under full software emulation, expect significantly \
             slower performance."
        )),
        None => {
            let known: Vec<&str> = DEVICE_TYPE_ARCH.iter().map(|(dt, _)| *dt).collect();
            Some(format!(
                "Device type {device_type} is not a known local VM target ({}); \
                 it may not boot, and performance may be significantly degraded.",
                known.join(", ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_aliases() {
        assert_eq!(normalize_arch("x86_64").unwrap(), HostArch::X64);
        assert_eq!(normalize_arch("AMD64").unwrap(), HostArch::X64);
        assert_eq!(normalize_arch("aarch64").unwrap(), HostArch::Arm64);
        assert_eq!(normalize_arch("arm64").unwrap(), HostArch::Arm64);
    }

    #[test]
    fn test_unsupported_arch_names_value_and_supported_list() {
        let err = normalize_arch("riscv64").unwrap_err().to_string();
        assert!(err.contains("riscv64"));
        assert!(err.contains("x64"));
        assert!(err.contains("arm64"));
    }

    #[test]
    fn test_architecture_match() {
        assert_eq!(
            check_architecture_match("generic-amd64", HostArch::X64),
            None
        );
        let warning = check_architecture_match("generic-amd64", HostArch::Arm64).unwrap();
        assert!(warning.contains("performance"));
        assert_eq!(
            check_architecture_match("generic-aarch64", HostArch::Arm64),
            None
        );
    }

    #[test]
    fn test_unknown_device_type_warns() {
        let warning = check_architecture_match("raspberrypi4-64", HostArch::X64).unwrap();
        assert!(warning.contains("raspberrypi4-64"));
    }
}
