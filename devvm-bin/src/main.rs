use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use devvm_common::DevVmError;
use devvm_orchestrator::image::format_bytes;
use devvm_orchestrator::{
    attach, check_architecture_match, detect_host_arch, AttachOutcome, DevVmConfig, DockerEngine,
    LaunchRequest, Orchestrator,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Run OS disk images as local VMs inside containers
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Build (or refresh) the runner image.
    Build,

    /// Launch a new instance from a raw disk image.
    Start {
        /// Path to the raw OS image. It is copied, never modified.
        image: PathBuf,
        /// Host port forwarded to the guest console (allocated when omitted).
        #[arg(long)]
        port: Option<u16>,
        /// Guest memory, e.g. 2G.
        #[arg(long)]
        memory: Option<String>,
        #[arg(long)]
        cpus: Option<u32>,
        /// Grow the working copy to this size first, e.g. 8G.
        #[arg(long)]
        size: Option<String>,
        /// Device type the image was built for; warns on an architecture mismatch.
        #[arg(long)]
        device_type: Option<String>,
        /// Leave the instance running in the background instead of attaching.
        #[arg(short, long)]
        detach: bool,
    },

    /// List instances.
    List {
        #[arg(long)]
        json: bool,
    },

    /// Attach to an instance's console (Ctrl+C stops it, Ctrl+P Ctrl+Q detaches).
    Attach { id: String },

    /// Start a stopped instance.
    Resume { id: String },

    /// Stop an instance, keeping it and its disk.
    Stop { id: String },

    Restart { id: String },

    /// Stop and remove an instance, deleting its working copy.
    Rm { id: String },

    /// Stop and remove every instance.
    StopAll,

    Logs {
        id: String,
        /// Only the last N lines.
        #[arg(long)]
        tail: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if let Some(DevVmError::NotFound { .. }) = err.downcast_ref::<DevVmError>() {
                eprintln!("See `devvm list` for instances, `devvm build` for the runner image.");
            }
            1
        }
    };
    // The stdin reader behind an attached console blocks a thread that cannot
    // be cancelled, so leave without waiting for the runtime to drain.
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config = DevVmConfig::from_env()?;
    let engine = DockerEngine::connect().context("Failed to connect to Docker")?;
    let engine = Arc::new(engine);
    let orch = Orchestrator::new(engine, config);

    match cli.command {
        Cmd::Build => {
            orch.build_runner_image().await?;
            println!("Runner image ready");
        }
        Cmd::Start {
            image,
            port,
            memory,
            cpus,
            size,
            device_type,
            detach,
        } => {
            if let Some(device_type) = device_type {
                if let Some(warning) = check_architecture_match(&device_type, detect_host_arch()?) {
                    warn!("{warning}");
                }
            }
            let prepared = orch.prepare_for_launch(&image, size.as_deref()).await?;
            if let Some(expansion) = &prepared.expansion {
                if expansion.expanded {
                    println!(
                        "Expanded image from {} to {}",
                        format_bytes(expansion.old_size),
                        format_bytes(expansion.new_size)
                    );
                }
            }

            let mut request = LaunchRequest::new(&prepared.working_copy, orch.config());
            request.port = port;
            request.interactive = !detach;
            if let Some(memory) = memory {
                request.memory = memory;
            }
            if let Some(cpus) = cpus {
                request.cpus = cpus;
            }
            let launched = orch.launch(request).await?;
            println!("{}", launched.accelerator.description);
            println!("Started {}", launched.instance);

            if !detach {
                return attach_and_settle(&orch, &launched.instance.container_id).await;
            }
        }
        Cmd::List { json } => {
            let instances = orch.list_instances().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&instances)?);
            } else if instances.is_empty() {
                println!("No instances");
            } else {
                for instance in instances {
                    println!("{instance}");
                }
            }
        }
        Cmd::Attach { id } => {
            let instance = orch.find_instance(&id).await?;
            return attach_and_settle(&orch, &instance.container_id).await;
        }
        Cmd::Resume { id } => {
            let instance = orch.find_instance(&id).await?;
            let started = orch.start_instance(&instance.container_id).await?;
            println!("Started {started}");
        }
        Cmd::Stop { id } => {
            let instance = orch.find_instance(&id).await?;
            orch.stop_instance(&instance.container_id).await?;
            println!("Stopped {}", instance.name);
        }
        Cmd::Restart { id } => {
            let instance = orch.find_instance(&id).await?;
            let restarted = orch.restart_instance(&instance.container_id).await?;
            println!("Restarted {restarted}");
        }
        Cmd::Rm { id } => {
            if orch.stop_with_cleanup(&id).await? {
                println!("Removed {id}");
            } else {
                eprintln!("Cleanup of {id} was incomplete; see warnings above");
            }
        }
        Cmd::StopAll => {
            let report = orch.stop_all_with_cleanup().await?;
            println!(
                "Stopped {} instance(s), cleaned {} working cop(ies)",
                report.stopped_count, report.cleaned_count
            );
            for (name, error) in &report.failures {
                eprintln!("  {name}: {error}");
            }
            if !report.failures.is_empty() {
                return Ok(1);
            }
        }
        Cmd::Logs { id, tail } => {
            let instance = orch.find_instance(&id).await?;
            let logs = orch.instance_logs(&instance.container_id, tail).await?;
            print!("{logs}");
        }
    }
    Ok(0)
}

async fn attach_and_settle(orch: &Orchestrator, container_id: &str) -> Result<i32> {
    eprintln!("Attached. Ctrl+C stops the instance, Ctrl+P Ctrl+Q detaches.");
    match attach(orch.engine().as_ref(), container_id).await? {
        AttachOutcome::Stopped => {
            orch.stop_with_cleanup(container_id).await?;
            eprintln!("\r\nInstance stopped and removed");
            Ok(0)
        }
        AttachOutcome::Detached => {
            eprintln!("\r\nDetached; the instance keeps running. Reattach with `devvm attach`.");
            Ok(0)
        }
        AttachOutcome::Ended => {
            eprintln!("\r\nConsole closed by the instance. Remove it with `devvm rm`.");
            Ok(0)
        }
        AttachOutcome::Errored(err) => Err(err).context("Console connection failed"),
    }
}
