use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::BuildImageOptions;
use bollard::models::{
    ContainerInspectResponse, ContainerStateStatusEnum, DeviceMapping, HostConfig,
    MountPointTypeEnum, PortBinding,
};
use bollard::Docker;
use chrono::{DateTime, Utc};
use devvm_common::InstanceStatus;
use futures::StreamExt;
use tracing::{debug, info, instrument};

use super::{
    Bind, ConsoleChunk, ConsoleStream, ContainerEngine, ContainerRecord, ContainerSpec,
    EngineError, EngineResult,
};
use crate::constants::LABEL_MANAGED;

/// [`ContainerEngine`] backed by a local Docker daemon.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Arc<Docker>,
}

impl DockerEngine {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self { docker }
    }

    /// Connect using `DOCKER_HOST` or the platform's default socket.
    pub fn connect() -> EngineResult<Self> {
        let docker = Docker::connect_with_defaults()?;
        Ok(Self::new(Arc::new(docker)))
    }

    pub fn client(&self) -> &Docker {
        &self.docker
    }
}

/// Unrecognized engine states are transitional (restarting, removing, dead
/// while being reaped), so they read as running.
pub(crate) fn status_from_engine(state: Option<ContainerStateStatusEnum>) -> InstanceStatus {
    match state {
        Some(ContainerStateStatusEnum::RUNNING) => InstanceStatus::Running,
        Some(ContainerStateStatusEnum::EXITED) => InstanceStatus::Exited,
        Some(ContainerStateStatusEnum::PAUSED) => InstanceStatus::Paused,
        Some(ContainerStateStatusEnum::CREATED) => InstanceStatus::Created,
        _ => InstanceStatus::Running,
    }
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for (container_port, host_port) in &spec.port_bindings {
        let key = format!("{container_port}/tcp");
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(host_port.to_string()),
            }]),
        );
    }

    let devices: Vec<DeviceMapping> = spec
        .devices
        .iter()
        .map(|path| DeviceMapping {
            path_on_host: Some(path.clone()),
            path_in_container: Some(path.clone()),
            cgroup_permissions: Some("rwm".to_string()),
        })
        .collect();

    let host_config = HostConfig {
        privileged: Some(spec.privileged),
        binds: Some(spec.binds.iter().map(Bind::to_engine_string).collect()),
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        devices: (!devices.is_empty()).then_some(devices),
        ..Default::default()
    };

    let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

    Config {
        image: Some(spec.image.clone()),
        env: Some(env),
        entrypoint: spec.entrypoint.clone(),
        cmd: spec.cmd.clone(),
        labels: Some(spec.labels.clone()),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        tty: Some(spec.interactive),
        open_stdin: Some(spec.interactive),
        attach_stdin: Some(spec.interactive),
        attach_stdout: Some(spec.interactive),
        attach_stderr: Some(spec.interactive),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn console_chunk(log: LogOutput) -> Option<ConsoleChunk> {
    match log {
        LogOutput::StdOut { message } => Some(ConsoleChunk::Stdout(message.to_vec())),
        LogOutput::StdErr { message } => Some(ConsoleChunk::Stderr(message.to_vec())),
        LogOutput::Console { message } => Some(ConsoleChunk::Console(message.to_vec())),
        LogOutput::StdIn { .. } => None,
    }
}

fn record_from_inspect(inspect: ContainerInspectResponse) -> ContainerRecord {
    let id = inspect.id.unwrap_or_default();
    let name = inspect
        .name
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();
    let (status, running) = match inspect.state {
        Some(state) => (
            status_from_engine(state.status),
            state.running.unwrap_or(false),
        ),
        None => (InstanceStatus::Running, false),
    };
    let created = inspect
        .created
        .as_deref()
        .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
        .map(|c| c.with_timezone(&Utc))
        .unwrap_or_default();

    let mut port_bindings = Vec::new();
    let mut binds = Vec::new();
    if let Some(host_config) = inspect.host_config {
        for (key, bindings) in host_config.port_bindings.unwrap_or_default() {
            let Some(container_port) = key.split('/').next().and_then(|p| p.parse::<u16>().ok())
            else {
                continue;
            };
            for binding in bindings.unwrap_or_default() {
                if let Some(host_port) = binding.host_port.and_then(|p| p.parse::<u16>().ok()) {
                    port_bindings.push((container_port, host_port));
                }
            }
        }
        binds.extend(
            host_config
                .binds
                .unwrap_or_default()
                .iter()
                .filter_map(|b| Bind::parse(b)),
        );
    }
    if binds.is_empty() {
        for mount in inspect.mounts.unwrap_or_default() {
            if mount.typ != Some(MountPointTypeEnum::BIND) {
                continue;
            }
            if let (Some(source), Some(destination)) = (mount.source, mount.destination) {
                binds.push(Bind {
                    host: PathBuf::from(source),
                    container: destination,
                    read_only: !mount.rw.unwrap_or(true),
                });
            }
        }
    }

    let (tty, labels) = match inspect.config {
        Some(config) => (
            config.tty.unwrap_or(false),
            config.labels.unwrap_or_default(),
        ),
        None => (false, HashMap::new()),
    };

    ContainerRecord {
        id,
        name,
        status,
        running,
        created,
        port_bindings,
        binds,
        tty,
        labels,
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    #[instrument(skip(self, context_tar), fields(context_bytes = context_tar.len()))]
    async fn build_image(&self, tag: &str, context_tar: Vec<u8>) -> EngineResult<()> {
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(context_tar.into()));
        let mut last_error = None;
        while let Some(event) = stream.next().await {
            match event {
                Ok(info) => {
                    if let Some(line) = info.stream.as_deref() {
                        let line = line.trim_end();
                        if !line.is_empty() {
                            debug!(target: "devvm::build", "{}", line);
                        }
                    }
                    if let Some(error) = info.error {
                        last_error = Some(error);
                    }
                }
                Err(BollardError::DockerStreamError { error }) => {
                    return Err(EngineError::BuildFailed(error));
                }
                Err(e) => return Err(EngineError::from(e)),
            }
        }
        if let Some(error) = last_error {
            return Err(EngineError::BuildFailed(error));
        }
        info!(%tag, "Runner image built");
        Ok(())
    }

    async fn image_exists(&self, tag: &str) -> EngineResult<bool> {
        match self.docker.inspect_image(tag).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_containers(&self, name_prefix: &str) -> EngineResult<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name_prefix.to_string()]);
        filters.insert("label".to_string(), vec![format!("{LABEL_MANAGED}=true")]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let summaries = self.docker.list_containers(Some(options)).await?;
        // The engine's name filter is a substring match; narrow it to a prefix.
        let ids = summaries
            .into_iter()
            .filter(|c| {
                c.names
                    .as_ref()
                    .map(|names| {
                        names
                            .iter()
                            .any(|n| n.trim_start_matches('/').starts_with(name_prefix))
                    })
                    .unwrap_or(false)
            })
            .filter_map(|c| c.id)
            .collect();
        Ok(ids)
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerRecord> {
        let inspect = self.docker.inspect_container(id, None).await?;
        Ok(record_from_inspect(inspect))
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await?;
        for warning in &response.warnings {
            debug!(container_id = %response.id, %warning, "Engine warning on create");
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> EngineResult<()> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: timeout_secs }))
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> EngineResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> EngineResult<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(id, Some(options));
        match stream.next().await {
            Some(Ok(body)) => Ok(body.status_code),
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(EngineError::Stream(
                "wait stream ended unexpectedly".to_string(),
            )),
        }
    }

    async fn container_logs(&self, id: &str, tail: Option<usize>) -> EngineResult<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail
                .map(|t| t.to_string())
                .unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));
        let mut collected = Vec::new();
        while let Some(entry) = stream.next().await {
            match entry? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => collected.extend_from_slice(&message),
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(String::from_utf8_lossy(&collected).into_owned())
    }

    async fn attach_container(&self, id: &str) -> EngineResult<ConsoleStream> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            detach_keys: None,
        };
        let AttachContainerResults { output, input } =
            self.docker.attach_container(id, Some(options)).await?;

        let output = output
            .filter_map(|entry| async move {
                match entry {
                    Ok(log) => console_chunk(log).map(Ok),
                    Err(e) => Some(Err(EngineError::from(e))),
                }
            })
            .boxed();

        Ok(ConsoleStream { output, input })
    }
}
