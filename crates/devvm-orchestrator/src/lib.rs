// Re-export dependencies consumers (like the binary) need
pub use bollard;
pub use devvm_common as common;

pub mod accelerator;
pub mod arch;
pub mod config;
pub mod console;
pub mod constants;
pub mod engine;
pub mod helper;
pub mod image;
pub mod orchestrator;
pub mod runner;

pub use accelerator::detect_accelerator;
pub use arch::{check_architecture_match, detect_host_arch, normalize_arch};
pub use config::DevVmConfig;
pub use console::{attach, AttachOutcome};
pub use engine::{ContainerEngine, DockerEngine, EngineError};
pub use orchestrator::{LaunchRequest, Orchestrator};
