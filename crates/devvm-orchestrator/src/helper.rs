//! Short-lived privileged containers that run one native-tool script against an
//! image file and exit.

use std::collections::HashMap;

use devvm_common::{DevVmError, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::{LABEL_HELPER, RUNNER_IMAGE};
use crate::engine::{Bind, ContainerEngine, ContainerSpec};

#[derive(Debug, Clone)]
pub struct HelperOutput {
    pub exit_code: i64,
    /// Combined stdout and stderr.
    pub output: String,
}

impl HelperOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Container spec for a helper running `script` under `sh -c`.
pub fn helper_spec(purpose: &str, script: String, binds: Vec<Bind>) -> ContainerSpec {
    let mut labels = HashMap::new();
    labels.insert(LABEL_HELPER.to_string(), purpose.to_string());
    ContainerSpec {
        // Deliberately outside the instance name prefix so listings never see it.
        name: format!("devvmhelper-{purpose}-{}", Uuid::new_v4().simple()),
        image: RUNNER_IMAGE.to_string(),
        entrypoint: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        cmd: Some(vec![script]),
        privileged: true,
        binds,
        labels,
        ..Default::default()
    }
}

/// Create, start and wait for a helper container, always removing it after.
pub async fn run_helper<E: ContainerEngine + ?Sized>(
    engine: &E,
    spec: &ContainerSpec,
) -> Result<HelperOutput> {
    info!(name = %spec.name, "Starting helper container");
    let id = engine.create_container(spec).await?;

    let result = async {
        engine.start_container(&id).await?;
        let exit_code = engine.wait_container(&id).await?;
        let output = engine.container_logs(&id, None).await.unwrap_or_else(|e| {
            warn!(container_id = %id, error = %e, "Failed to collect helper output");
            String::new()
        });
        Ok::<_, DevVmError>(HelperOutput { exit_code, output })
    }
    .await;

    if let Err(e) = engine.remove_container(&id).await {
        warn!(container_id = %id, error = %e, "Failed to remove helper container");
    }

    let output = result?;
    debug!(name = %spec.name, exit_code = output.exit_code, "Helper container finished");
    Ok(output)
}

/// Quote a value for a POSIX shell script.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
