//! Instance lifecycle on top of a [`ContainerEngine`].
//!
//! There is no local state: every call re-reads the engine, so names, ports
//! and working-copy paths are always derived from the containers that exist.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use devvm_common::{
    AcceleratorInfo, DevVmError, GuestArch, Instance, LaunchResult, Result, StopAllReport,
};
use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::accelerator::detect_accelerator;
use crate::config::DevVmConfig;
use crate::constants::{
    ENV_ACCEL, ENV_ARCH, ENV_CPUS, ENV_MEMORY, GUEST_CONSOLE_PORT, IMAGE_MOUNT_PATH, KVM_DEVICE,
    LABEL_IMAGE, LABEL_MANAGED, LAUNCH_ATTEMPTS, RUNNER_IMAGE, STOP_TIMEOUT_SECS,
};
use crate::engine::{Bind, ContainerEngine, ContainerRecord, ContainerSpec, EngineError};
use crate::image::{self, detect_guest_arch, image_exists, remove_working_copy, PreparedImage};
use crate::runner;

pub mod naming;

use naming::{instance_name, matches_ordinal, next_free_port, next_ordinal};

/// Parameters of a single launch.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub working_copy: PathBuf,
    /// Fixed host port; allocated from the configured base when `None`.
    pub port: Option<u16>,
    pub memory: String,
    pub cpus: u32,
    /// Configure the container so a console can be attached.
    pub interactive: bool,
}

impl LaunchRequest {
    /// A request sized from `config` defaults.
    pub fn new(working_copy: impl Into<PathBuf>, config: &DevVmConfig) -> Self {
        Self {
            working_copy: working_copy.into(),
            port: None,
            memory: config.memory.clone(),
            cpus: config.cpus,
            interactive: true,
        }
    }
}

pub fn instance_from_record(record: ContainerRecord) -> Instance {
    Instance {
        ssh_port: record.host_port_for(GUEST_CONSOLE_PORT),
        working_copy: record.bind_for(IMAGE_MOUNT_PATH).map(|b| b.host.clone()),
        name: record.name,
        container_id: record.id,
        status: record.status,
        created: record.created,
    }
}

/// Resolve `identifier` against `instances`: exact name, then ordinal, then id prefix.
pub fn resolve_identifier<'a>(
    instances: &'a [Instance],
    identifier: &str,
    prefix: &str,
) -> Option<&'a Instance> {
    if identifier.is_empty() {
        return None;
    }
    if let Some(found) = instances.iter().find(|i| i.name == identifier) {
        return Some(found);
    }
    if identifier.bytes().all(|b| b.is_ascii_digit()) {
        if let Some(found) = instances
            .iter()
            .find(|i| matches_ordinal(&i.name, prefix, identifier))
        {
            return Some(found);
        }
    }
    instances
        .iter()
        .find(|i| i.container_id.starts_with(identifier))
}

pub struct Orchestrator {
    engine: Arc<dyn ContainerEngine>,
    config: DevVmConfig,
}

impl Orchestrator {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: DevVmConfig) -> Self {
        Self { engine, config }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn config(&self) -> &DevVmConfig {
        &self.config
    }

    pub async fn build_runner_image(&self) -> Result<()> {
        runner::build_runner_image(self.engine.as_ref()).await
    }

    pub async fn runner_image_exists(&self) -> Result<bool> {
        runner::runner_image_exists(self.engine.as_ref()).await
    }

    /// Validate `source` and copy it into the cache, expanding to the configured size.
    pub async fn prepare_image(&self, source: &Path) -> Result<PreparedImage> {
        image::prepare_image(
            self.engine.as_ref(),
            source,
            &self.config.cache_dir,
            self.config.image_size.as_deref(),
        )
        .await
    }

    /// Rebuild the runner image, then prepare `source`. `size` overrides the
    /// configured target size.
    pub async fn prepare_for_launch(
        &self,
        source: &Path,
        size: Option<&str>,
    ) -> Result<PreparedImage> {
        // Layer caching keeps this cheap and picks up edited assets.
        self.build_runner_image().await?;
        image::prepare_image(
            self.engine.as_ref(),
            source,
            &self.config.cache_dir,
            size.or(self.config.image_size.as_deref()),
        )
        .await
    }

    /// All managed instances, running or not, sorted by name.
    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        let ids = self.engine.list_containers(&self.config.name_prefix).await?;
        let inspect = ids.iter().map(|id| self.engine.inspect_container(id));
        let inspections = join_all(inspect).await;

        let mut instances = Vec::with_capacity(ids.len());
        for (id, inspected) in ids.iter().zip(inspections) {
            match inspected {
                Ok(record) => instances.push(instance_from_record(record)),
                // Removed between list and inspect.
                Err(EngineError::NotFound(_)) => debug!(container_id = %id, "Container vanished"),
                Err(e) => return Err(e.into()),
            }
        }
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(instances)
    }

    pub async fn find_instance(&self, identifier: &str) -> Result<Instance> {
        let instances = self.list_instances().await?;
        resolve_identifier(&instances, identifier, &self.config.name_prefix)
            .cloned()
            .ok_or_else(|| DevVmError::not_found("Instance", identifier))
    }

    pub async fn next_instance_name(&self) -> Result<String> {
        let instances = self.list_instances().await?;
        Ok(self.name_after(&instances))
    }

    pub async fn next_free_port(&self) -> Result<u16> {
        let instances = self.list_instances().await?;
        next_free_port(
            instances.iter().filter_map(|i| i.ssh_port),
            self.config.base_port,
        )
    }

    fn name_after(&self, instances: &[Instance]) -> String {
        let prefix = &self.config.name_prefix;
        let ordinal = next_ordinal(instances.iter().map(|i| i.name.as_str()), prefix);
        instance_name(prefix, ordinal, Utc::now().timestamp())
    }

    fn instance_spec(
        &self,
        name: &str,
        port: u16,
        request: &LaunchRequest,
        accelerator: &AcceleratorInfo,
        guest_arch: GuestArch,
    ) -> ContainerSpec {
        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(
            LABEL_IMAGE.to_string(),
            request.working_copy.display().to_string(),
        );

        let bind = Bind::read_write(request.working_copy.clone(), IMAGE_MOUNT_PATH);
        ContainerSpec {
            name: name.to_string(),
            image: RUNNER_IMAGE.to_string(),
            env: vec![
                (ENV_MEMORY.to_string(), request.memory.clone()),
                (ENV_CPUS.to_string(), request.cpus.to_string()),
                (ENV_ACCEL.to_string(), accelerator.accel.clone()),
                (ENV_ARCH.to_string(), guest_arch.as_str().to_string()),
            ],
            // KVM and loop devices.
            privileged: true,
            binds: vec![bind],
            port_bindings: vec![(GUEST_CONSOLE_PORT, port)],
            devices: if accelerator.hardware {
                vec![KVM_DEVICE.to_string()]
            } else {
                Vec::new()
            },
            labels,
            interactive: request.interactive,
            ..Default::default()
        }
    }

    /// Create and start an instance over a prepared working copy.
    ///
    /// If anything fails once the working copy has been checked, it is deleted
    /// before the error is returned.
    #[instrument(skip(self, request), fields(working_copy = %request.working_copy.display()))]
    pub async fn launch(&self, request: LaunchRequest) -> Result<LaunchResult> {
        if !self.runner_image_exists().await? {
            return Err(DevVmError::not_found("Image", RUNNER_IMAGE));
        }
        if !image_exists(&request.working_copy).await {
            return Err(DevVmError::validation(
                format!("Working copy not found: {}", request.working_copy.display()),
                "Prepare the image again before launching",
            ));
        }

        let result = self.launch_prepared(&request).await;
        if result.is_err() && !remove_working_copy(&request.working_copy).await {
            warn!(
                path = %request.working_copy.display(),
                "Leaving working copy of failed launch behind"
            );
        }
        result
    }

    async fn launch_prepared(&self, request: &LaunchRequest) -> Result<LaunchResult> {
        let accelerator = detect_accelerator();
        if let Some(warning) = &accelerator.warning {
            warn!("{warning}");
        }
        let guest_arch = detect_guest_arch(&request.working_copy).await?;
        info!(accel = %accelerator.accel, guest_arch = %guest_arch, "Launch parameters resolved");

        // Host ports another process holds; the engine's own listing can't show them.
        let mut refused_ports: HashSet<u16> = HashSet::new();

        for attempt in 1..=LAUNCH_ATTEMPTS {
            let instances = self.list_instances().await?;
            let used_ports = instances.iter().filter_map(|i| i.ssh_port);
            let port = match request.port {
                Some(port) if used_ports.clone().any(|p| p == port) => {
                    return Err(port_taken(port));
                }
                Some(port) => port,
                None => next_free_port(
                    used_ports.chain(refused_ports.iter().copied()),
                    self.config.base_port,
                )?,
            };
            let name = self.name_after(&instances);
            let spec = self.instance_spec(&name, port, request, &accelerator, guest_arch);

            info!(name = %name, port, attempt, "Creating instance container");
            let id = match self.engine.create_container(&spec).await {
                Ok(id) => id,
                Err(EngineError::Conflict(message)) if attempt < LAUNCH_ATTEMPTS => {
                    warn!(name = %name, %message, "Name taken; rescanning");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match self.engine.start_container(&id).await {
                Ok(()) => {
                    // The working copy is deleted on error, so the container must go too.
                    let record = match self.engine.inspect_container(&id).await {
                        Ok(record) => record,
                        Err(e) => {
                            self.discard_container(&id).await;
                            return Err(e.into());
                        }
                    };
                    let instance = instance_from_record(record);
                    info!(
                        name = %instance.name,
                        container_id = %instance.container_id,
                        port,
                        "Instance started"
                    );
                    return Ok(LaunchResult {
                        instance,
                        accelerator,
                        guest_arch,
                    });
                }
                Err(e) => {
                    self.discard_container(&id).await;
                    match e {
                        EngineError::PortInUse(_) if request.port.is_some() => {
                            return Err(port_taken(port));
                        }
                        EngineError::PortInUse(message) if attempt < LAUNCH_ATTEMPTS => {
                            warn!(port, %message, "Port taken; rescanning");
                            refused_ports.insert(port);
                        }
                        other => return Err(other.into()),
                    }
                }
            }
        }

        Err(DevVmError::Engine(format!(
            "Could not create an instance after {LAUNCH_ATTEMPTS} attempts"
        )))
    }

    async fn discard_container(&self, id: &str) {
        if let Err(e) = self.engine.remove_container(id).await {
            warn!(container_id = %id, error = %e, "Failed to remove half-created container");
        }
    }

    /// Start a stopped instance; starting a running one is an error.
    #[instrument(skip(self))]
    pub async fn start_instance(&self, container_id: &str) -> Result<Instance> {
        let record = self.engine.inspect_container(container_id).await?;
        if record.running {
            return Err(DevVmError::validation(
                format!("Instance {} is already running", record.name),
                "Attach to it, or stop it first",
            ));
        }
        self.engine.start_container(container_id).await?;
        let record = self.engine.inspect_container(container_id).await?;
        info!(name = %record.name, "Instance started");
        Ok(instance_from_record(record))
    }

    /// Graceful stop. An already stopped or missing container is not an error.
    #[instrument(skip(self))]
    pub async fn stop_instance(&self, container_id: &str) -> Result<()> {
        match self
            .engine
            .stop_container(container_id, STOP_TIMEOUT_SECS)
            .await
        {
            Ok(()) => {
                info!(container_id = %container_id, "Instance stopped");
                Ok(())
            }
            Err(EngineError::NotFound(_)) | Err(EngineError::NotModified(_)) => {
                debug!(container_id = %container_id, "Instance already stopped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Force-remove. A missing container is not an error.
    #[instrument(skip(self))]
    pub async fn remove_instance(&self, container_id: &str) -> Result<()> {
        match self.engine.remove_container(container_id).await {
            Ok(()) | Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn restart_instance(&self, container_id: &str) -> Result<Instance> {
        self.stop_instance(container_id).await?;
        self.start_instance(container_id).await
    }

    pub async fn instance_logs(&self, container_id: &str, tail: Option<usize>) -> Result<String> {
        Ok(self.engine.container_logs(container_id, tail).await?)
    }

    /// Stop, remove, then delete the working copy. Returns whether nothing was
    /// left behind; an instance without a working copy has nothing to delete.
    async fn teardown(&self, instance: &Instance) -> Result<bool> {
        self.stop_instance(&instance.container_id).await?;
        self.remove_instance(&instance.container_id).await?;
        Ok(match &instance.working_copy {
            Some(path) => remove_working_copy(path).await,
            None => true,
        })
    }

    /// Tear down one instance. Only lookup failures are errors; teardown
    /// failures are logged and reported as `false`.
    #[instrument(skip(self))]
    pub async fn stop_with_cleanup(&self, identifier: &str) -> Result<bool> {
        let instance = self.find_instance(identifier).await?;
        match self.teardown(&instance).await {
            Ok(cleaned) => Ok(cleaned),
            Err(e) => {
                warn!(name = %instance.name, error = %e, "Teardown failed");
                Ok(false)
            }
        }
    }

    /// Tear down every instance concurrently. One failure never stops the rest.
    #[instrument(skip(self))]
    pub async fn stop_all_with_cleanup(&self) -> Result<StopAllReport> {
        let instances = self.list_instances().await?;
        let outcomes = join_all(instances.iter().map(|i| self.teardown(i))).await;

        let mut report = StopAllReport::default();
        for (instance, outcome) in instances.iter().zip(outcomes) {
            match outcome {
                Ok(cleaned) => {
                    report.stopped_count += 1;
                    if cleaned && instance.working_copy.is_some() {
                        report.cleaned_count += 1;
                    }
                }
                Err(e) => {
                    warn!(name = %instance.name, error = %e, "Teardown failed");
                    report.failures.push((instance.name.clone(), e.to_string()));
                }
            }
        }
        info!(
            stopped = report.stopped_count,
            cleaned = report.cleaned_count,
            failed = report.failures.len(),
            "Stopped all instances"
        );
        Ok(report)
    }
}

fn port_taken(port: u16) -> DevVmError {
    DevVmError::validation(
        format!("Port {port} is already in use"),
        "Choose another port, or omit it to allocate one automatically",
    )
}
