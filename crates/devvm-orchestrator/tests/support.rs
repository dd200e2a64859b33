#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use devvm_orchestrator::common::InstanceStatus;
use devvm_orchestrator::constants::{
    GUEST_CONSOLE_PORT, HELPER_INPUT_PATH, IMAGE_MOUNT_PATH, LABEL_HELPER, LABEL_MANAGED,
    RUNNER_IMAGE,
};
use devvm_orchestrator::engine::{
    Bind, ConsoleChunk, ConsoleStream, ContainerEngine, ContainerRecord, ContainerSpec,
    EngineError, EngineResult,
};
use devvm_orchestrator::{DevVmConfig, Orchestrator};
use futures::StreamExt;
use tokio::sync::Mutex;

/// How helper containers behave when waited on.
#[derive(Clone, Debug)]
pub struct HelperBehavior {
    pub exit_code: i64,
    pub output: String,
    /// Apply `qemu-img resize` scripts to the bound file.
    pub emulate_resize: bool,
}

impl Default for HelperBehavior {
    fn default() -> Self {
        Self {
            exit_code: 0,
            output: String::new(),
            emulate_resize: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MockContainer {
    pub spec: ContainerSpec,
    pub record: ContainerRecord,
}

#[derive(Default)]
pub struct MockState {
    pub images: HashSet<String>,
    pub containers: Vec<MockContainer>,
    pub next_id: u64,
    /// Every spec passed to create, including refused ones.
    pub create_calls: Vec<ContainerSpec>,
    pub removed: Vec<String>,
    pub stopped: Vec<String>,
    /// The next N creates fail with a name conflict.
    pub conflicts_remaining: usize,
    /// Host ports some other process holds; starting a container bound to one fails.
    pub busy_host_ports: HashSet<u16>,
    /// Container names whose stop fails.
    pub failing_stops: HashSet<String>,
    pub fail_build: bool,
    pub build_calls: usize,
    /// Inspecting a container fails once it has been started.
    pub fail_inspect_after_start: bool,
    pub uninspectable: HashSet<String>,
    pub helper: HelperBehavior,
    pub console_output: Vec<ConsoleChunk>,
}

/// In-memory container engine.
#[derive(Clone, Default)]
pub struct MockEngine {
    pub state: Arc<Mutex<MockState>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_runner_image() -> Self {
        let engine = Self::new();
        {
            let mut state = engine.state.lock().await;
            state.images.insert(RUNNER_IMAGE.to_string());
        }
        engine
    }

    /// Add a managed instance as if an earlier launch had created it.
    pub async fn seed_instance(
        &self,
        name: &str,
        host_port: u16,
        working_copy: Option<&Path>,
        running: bool,
    ) -> String {
        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        let spec = ContainerSpec {
            name: name.to_string(),
            image: RUNNER_IMAGE.to_string(),
            privileged: true,
            binds: working_copy
                .map(|p| vec![Bind::read_write(p.to_path_buf(), IMAGE_MOUNT_PATH)])
                .unwrap_or_default(),
            port_bindings: vec![(GUEST_CONSOLE_PORT, host_port)],
            labels,
            interactive: true,
            ..Default::default()
        };
        let mut state = self.state.lock().await;
        let id = insert_container(&mut state, spec);
        set_running(&mut state, &id, running);
        id
    }

    pub async fn container_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .containers
            .iter()
            .map(|c| c.record.name.clone())
            .collect()
    }

    pub async fn create_calls(&self) -> Vec<ContainerSpec> {
        self.state.lock().await.create_calls.clone()
    }

    pub async fn removed(&self) -> Vec<String> {
        self.state.lock().await.removed.clone()
    }

    pub async fn is_running(&self, id: &str) -> bool {
        let state = self.state.lock().await;
        state
            .containers
            .iter()
            .any(|c| c.record.id == id && c.record.running)
    }
}

fn insert_container(state: &mut MockState, spec: ContainerSpec) -> String {
    state.next_id += 1;
    let id = format!("{:08x}{}", state.next_id, "c0ffee".repeat(9));
    let record = ContainerRecord {
        id: id.clone(),
        name: spec.name.clone(),
        status: InstanceStatus::Created,
        running: false,
        created: DateTime::from_timestamp(1_700_000_000 + state.next_id as i64, 0)
            .unwrap_or_else(Utc::now),
        port_bindings: spec.port_bindings.clone(),
        binds: spec.binds.clone(),
        tty: spec.interactive,
        labels: spec.labels.clone(),
    };
    state.containers.push(MockContainer { spec, record });
    id
}

fn set_running(state: &mut MockState, id: &str, running: bool) {
    if let Some(c) = state.containers.iter_mut().find(|c| c.record.id == id) {
        c.record.running = running;
        c.record.status = if running {
            InstanceStatus::Running
        } else {
            InstanceStatus::Exited
        };
    }
}

fn lookup<'a>(state: &'a mut MockState, id: &str) -> EngineResult<&'a mut MockContainer> {
    state
        .containers
        .iter_mut()
        .find(|c| c.record.id == id || c.record.name == id)
        .ok_or_else(|| EngineError::NotFound(id.to_string()))
}

/// Emulate `qemu-img resize -f raw <path> <bytes>` against the bound host file.
fn emulate_resize(spec: &ContainerSpec) {
    let Some(script) = spec.cmd.as_ref().and_then(|c| c.first()) else {
        return;
    };
    let Some(line) = script.lines().find(|l| l.starts_with("qemu-img resize")) else {
        return;
    };
    let Some(bytes) = line
        .split_whitespace()
        .last()
        .and_then(|b| b.parse::<u64>().ok())
    else {
        return;
    };
    if let Some(bind) = spec.binds.iter().find(|b| b.container == HELPER_INPUT_PATH) {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&bind.host)
            .expect("open bound image");
        file.set_len(bytes).expect("resize bound image");
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn build_image(&self, tag: &str, context_tar: Vec<u8>) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state.build_calls += 1;
        if state.fail_build {
            return Err(EngineError::BuildFailed("step 3/5 failed".to_string()));
        }
        assert!(!context_tar.is_empty(), "build context must not be empty");
        state.images.insert(tag.to_string());
        Ok(())
    }

    async fn image_exists(&self, tag: &str) -> EngineResult<bool> {
        Ok(self.state.lock().await.images.contains(tag))
    }

    async fn list_containers(&self, name_prefix: &str) -> EngineResult<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .containers
            .iter()
            .filter(|c| c.record.name.starts_with(name_prefix))
            .filter(|c| c.record.labels.get(LABEL_MANAGED).map(String::as_str) == Some("true"))
            .map(|c| c.record.id.clone())
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerRecord> {
        let mut state = self.state.lock().await;
        let record = lookup(&mut state, id)?.record.clone();
        if state.uninspectable.contains(&record.id) {
            return Err(EngineError::Stream("500: inspect timed out".to_string()));
        }
        Ok(record)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        let mut state = self.state.lock().await;
        state.create_calls.push(spec.clone());
        if state.conflicts_remaining > 0 {
            state.conflicts_remaining -= 1;
            return Err(EngineError::Conflict(format!(
                "container name \"/{}\" is already in use",
                spec.name
            )));
        }
        if state.containers.iter().any(|c| c.record.name == spec.name) {
            return Err(EngineError::Conflict(spec.name.clone()));
        }
        if !state.images.contains(&spec.image) {
            return Err(EngineError::NotFound(spec.image.clone()));
        }
        Ok(insert_container(&mut state, spec.clone()))
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        let busy = state.busy_host_ports.clone();
        let container = lookup(&mut state, id)?;
        if container.record.running {
            return Err(EngineError::NotModified(id.to_string()));
        }
        if let Some((_, port)) = container
            .record
            .port_bindings
            .iter()
            .find(|(_, host)| busy.contains(host))
        {
            return Err(EngineError::PortInUse(format!(
                "Bind for 0.0.0.0:{port} failed: port is already allocated"
            )));
        }
        let id = container.record.id.clone();
        set_running(&mut state, &id, true);
        if state.fail_inspect_after_start {
            state.uninspectable.insert(id);
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout_secs: i64) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        let failing = state.failing_stops.clone();
        let container = lookup(&mut state, id)?;
        if failing.contains(&container.record.name) {
            return Err(EngineError::Stream("500: cannot kill container".to_string()));
        }
        if !container.record.running {
            return Err(EngineError::NotModified(id.to_string()));
        }
        let id = container.record.id.clone();
        set_running(&mut state, &id, false);
        state.stopped.push(id);
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        let real_id = lookup(&mut state, id)?.record.id.clone();
        state.containers.retain(|c| c.record.id != real_id);
        state.removed.push(real_id);
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> EngineResult<i64> {
        let mut state = self.state.lock().await;
        let behavior = state.helper.clone();
        let container = lookup(&mut state, id)?;
        let is_helper = container.spec.labels.contains_key(LABEL_HELPER);
        if is_helper && behavior.exit_code == 0 && behavior.emulate_resize {
            emulate_resize(&container.spec);
        }
        let id = container.record.id.clone();
        set_running(&mut state, &id, false);
        Ok(if is_helper { behavior.exit_code } else { 0 })
    }

    async fn container_logs(&self, id: &str, tail: Option<usize>) -> EngineResult<String> {
        let mut state = self.state.lock().await;
        let helper_output = state.helper.output.clone();
        let container = lookup(&mut state, id)?;
        let full = if container.spec.labels.contains_key(LABEL_HELPER) {
            helper_output
        } else {
            "booting\nkernel up\nlogin:\n".to_string()
        };
        Ok(match tail {
            Some(n) => {
                let lines: Vec<&str> = full.lines().collect();
                let start = lines.len().saturating_sub(n);
                lines[start..].iter().map(|l| format!("{l}\n")).collect()
            }
            None => full,
        })
    }

    async fn attach_container(&self, id: &str) -> EngineResult<ConsoleStream> {
        let mut state = self.state.lock().await;
        let chunks = state.console_output.clone();
        lookup(&mut state, id)?;
        Ok(ConsoleStream {
            output: futures::stream::iter(chunks.into_iter().map(Ok)).boxed(),
            input: Box::pin(tokio::io::sink()),
        })
    }
}

pub fn orchestrator(engine: &MockEngine, cache_dir: &Path) -> Orchestrator {
    Orchestrator::new(
        Arc::new(engine.clone()),
        DevVmConfig::with_cache_dir(cache_dir),
    )
}

/// A raw image file of `len` bytes filled with a repeating pattern.
pub fn write_image(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, data).expect("write image");
    path
}
