// Value types shared between the orchestrator and its callers.

use std::fmt::{self, Display};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DevVmError {
    #[error("{message}\n{hint}")]
    Validation { message: String, hint: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Container engine error: {0}")]
    Engine(String),

    #[error("{message}\n--- container output ---\n{output}")]
    EngineOutput { message: String, output: String },

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

impl DevVmError {
    pub fn validation(message: impl Into<String>, hint: impl Into<String>) -> Self {
        DevVmError::Validation {
            message: message.into(),
            hint: hint.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        DevVmError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DevVmError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, DevVmError>;

/// Normalized host CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostArch {
    X64,
    Arm64,
}

impl HostArch {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostArch::X64 => "x64",
            HostArch::Arm64 => "arm64",
        }
    }
}

impl Display for HostArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU architecture presented by the emulated machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestArch {
    X86_64,
    Aarch64,
}

impl GuestArch {
    /// Value passed to the runner's entry script.
    pub fn as_str(&self) -> &'static str {
        match self {
            GuestArch::X86_64 => "x86_64",
            GuestArch::Aarch64 => "aarch64",
        }
    }
}

impl Display for GuestArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Raw,
    Gzip,
    Zip,
}

impl Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Gzip => "gzip",
            ImageFormat::Zip => "zip",
        };
        f.write_str(s)
    }
}

/// Result of inspecting an image for a nested flasher payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlasherInfo {
    pub is_flasher: bool,
    pub inner_image_name: Option<String>,
    /// Name of the partition holding the payload.
    pub partition_name: Option<String>,
    /// Byte offset of that partition from the start of the image.
    pub partition_offset: Option<u64>,
}

impl FlasherInfo {
    pub fn not_flasher() -> Self {
        Self::default()
    }
}

/// Lifecycle state of an instance container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Running,
    Exited,
    Paused,
    Created,
}

impl Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Exited => "exited",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Created => "created",
        };
        f.write_str(s)
    }
}

/// One managed VM running inside a container.
///
/// Never persisted: every field is rebuilt from the container engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub container_id: String,
    pub status: InstanceStatus,
    /// Host port forwarded to the guest console port.
    pub ssh_port: Option<u16>,
    pub created: DateTime<Utc>,
    /// Host-side path of the bind-mounted working copy.
    pub working_copy: Option<PathBuf>,
}

impl Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short_id: String = self.container_id.chars().take(12).collect();
        let port = self
            .ssh_port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "{}  {}  {}  port {}  created {}",
            self.name,
            short_id,
            self.status,
            port,
            self.created.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// Hardware-acceleration decision for a single launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorInfo {
    /// Emulator accelerator directive, possibly a fallback chain (`kvm:tcg`).
    pub accel: String,
    pub hardware: bool,
    pub warning: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandResult {
    pub expanded: bool,
    pub old_size: u64,
    pub new_size: u64,
}

/// Outcome of a successful launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchResult {
    pub instance: Instance,
    pub accelerator: AcceleratorInfo,
    pub guest_arch: GuestArch,
}

/// Outcome of stopping every instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopAllReport {
    pub stopped_count: usize,
    pub cleaned_count: usize,
    /// `(instance name, error message)` for each instance that failed.
    pub failures: Vec<(String, String)>,
}
