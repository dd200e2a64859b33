//! Container-engine seam.
//!
//! Orchestration code talks to [`ContainerEngine`] only. [`DockerEngine`] is the
//! production implementation over bollard; tests substitute an in-memory engine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use chrono::{DateTime, Utc};
use devvm_common::{DevVmError, InstanceStatus};
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::io::AsyncWrite;

mod docker;

pub use docker::DockerEngine;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No such container or image: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Not modified: {0}")]
    NotModified(String),
    #[error("Port already in use: {0}")]
    PortInUse(String),
    #[error("Image build failed: {0}")]
    BuildFailed(String),
    #[error("Docker API error: {0}")]
    DockerApi(#[source] BollardError),
    #[error("Stream error: {0}")]
    Stream(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }

    /// Classify a raw engine message the way the daemon reports it.
    pub fn from_server(status_code: u16, message: String) -> Self {
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("port is already allocated")
            || lowered.contains("address already in use")
        {
            return EngineError::PortInUse(message);
        }
        match status_code {
            404 => EngineError::NotFound(message),
            409 => EngineError::Conflict(message),
            304 => EngineError::NotModified(message),
            _ => EngineError::Stream(format!("{status_code}: {message}")),
        }
    }
}

impl From<BollardError> for EngineError {
    fn from(err: BollardError) -> Self {
        match err {
            BollardError::DockerResponseServerError {
                status_code,
                message,
            } => EngineError::from_server(status_code, message),
            other => EngineError::DockerApi(other),
        }
    }
}

impl From<EngineError> for DevVmError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound(id) => DevVmError::not_found("Container", id),
            EngineError::Io(e) => DevVmError::Io(e),
            other => DevVmError::Engine(other.to_string()),
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// A host path bound into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Bind {
    pub fn read_write(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }

    pub fn read_only(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: true,
        }
    }

    /// `host:container[:ro]`, the engine's bind syntax.
    pub fn to_engine_string(&self) -> String {
        let mut s = format!("{}:{}", self.host.display(), self.container);
        if self.read_only {
            s.push_str(":ro");
        }
        s
    }

    /// Parse `host:container[:mode]`. Splits from the right so Windows drive
    /// letters in the host part survive.
    pub fn parse(spec: &str) -> Option<Self> {
        let mut parts: Vec<&str> = spec.rsplitn(3, ':').collect();
        parts.reverse();
        let (host, container, mode) = match parts.as_slice() {
            [host, container] => (*host, *container, None),
            [host, container, mode] if container.starts_with('/') => {
                (*host, *container, Some(*mode))
            }
            [drive, rest, container] => {
                // `C:\path:/target` splits as ["C", "\path", "/target"]
                return Some(Self::read_write(format!("{drive}:{rest}"), *container));
            }
            _ => return None,
        };
        if host.is_empty() || container.is_empty() {
            return None;
        }
        let read_only = mode.map(|m| m.split(',').any(|o| o == "ro")).unwrap_or(false);
        Some(Self {
            host: PathBuf::from(host),
            container: container.to_string(),
            read_only,
        })
    }
}

/// Everything needed to create one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub privileged: bool,
    pub binds: Vec<Bind>,
    /// `(container port, host port)` TCP pairs.
    pub port_bindings: Vec<(u16, u16)>,
    /// Host device nodes passed through at the same path.
    pub devices: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Allocate a TTY and keep stdin open so a console can attach later.
    pub interactive: bool,
}

/// Engine-side view of one container, as returned by inspect.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub status: InstanceStatus,
    pub running: bool,
    pub created: DateTime<Utc>,
    /// `(container port, host port)` TCP pairs.
    pub port_bindings: Vec<(u16, u16)>,
    pub binds: Vec<Bind>,
    pub tty: bool,
    pub labels: HashMap<String, String>,
}

impl ContainerRecord {
    pub fn host_port_for(&self, container_port: u16) -> Option<u16> {
        self.port_bindings
            .iter()
            .find(|(c, _)| *c == container_port)
            .map(|(_, h)| *h)
    }

    pub fn bind_for(&self, container_path: &str) -> Option<&Bind> {
        self.binds.iter().find(|b| b.container == container_path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Combined stream of a TTY container.
    Console(Vec<u8>),
}

/// Both halves of a hijacked attach connection.
pub struct ConsoleStream {
    pub output: BoxStream<'static, EngineResult<ConsoleChunk>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Build `tag` from an in-memory tar build context.
    async fn build_image(&self, tag: &str, context_tar: Vec<u8>) -> EngineResult<()>;

    async fn image_exists(&self, tag: &str) -> EngineResult<bool>;

    /// Ids of managed containers (any state) whose name starts with `name_prefix`.
    async fn list_containers(&self, name_prefix: &str) -> EngineResult<Vec<String>>;

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerRecord>;

    /// Returns the new container id.
    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String>;

    async fn start_container(&self, id: &str) -> EngineResult<()>;

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> EngineResult<()>;

    /// Force-remove the container and its anonymous volumes.
    async fn remove_container(&self, id: &str) -> EngineResult<()>;

    /// Block until the container exits; returns its exit code.
    async fn wait_container(&self, id: &str) -> EngineResult<i64>;

    /// Combined stdout/stderr, optionally only the last `tail` lines.
    async fn container_logs(&self, id: &str, tail: Option<usize>) -> EngineResult<String>;

    async fn attach_container(&self, id: &str) -> EngineResult<ConsoleStream>;
}
