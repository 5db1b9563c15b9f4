//! Container runtime adapter
//!
//! Creates and destroys ephemeral, resource-constrained, network-isolated
//! sandbox containers bound to a workspace, and runs commands inside them
//! via the engine's exec API. The exec output channel is read as raw bytes
//! over the engine's unix socket and demultiplexed by [`framing`]; the
//! higher-level client library is used for the rest of the lifecycle.

pub mod framing;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::CreateExecOptions;
use bollard::models::HostConfig;
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as UnixUri};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::ExecutionError;
use crate::monitor::{MonitorHandle, ResourceMonitor};

/// Seconds a stopping sandbox gets before being killed
const STOP_GRACE_SECS: i64 = 2;
/// Idle command keeping the sandbox up for a bounded session of exec calls
const IDLE_COMMAND: &[&str] = &["sleep", "3600"];
/// Mount point of the workspace inside the sandbox
pub const SANDBOX_WORKDIR: &str = "/workspace";
/// Exit code reported when the real one could not be determined
pub const SENTINEL_EXIT_CODE: i64 = -1;

/// Everything needed to create one sandbox
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Host workspace directory, bind-mounted read-write at [`SANDBOX_WORKDIR`]
    pub workspace: PathBuf,
    pub image: String,
    /// Human-readable memory limit, e.g. "512m"
    pub memory_limit: String,
    /// Fractional CPU limit, e.g. "0.5"
    pub cpu_limit: String,
    /// Environment entries in `KEY=value` form
    pub environment: Vec<String>,
}

/// Captured output of one exec call
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub timed_out: bool,
}

/// Seam between the orchestrator and the container engine
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Create and start a sandbox; returns its opaque identifier
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<String, ExecutionError>;

    /// Run `command` inside a running sandbox under the restricted user,
    /// capturing demultiplexed output with a hard wall-clock timeout
    async fn exec_in_sandbox(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, ExecutionError>;

    /// Stop and remove a sandbox. Failures are logged, never returned,
    /// because destruction runs during cleanup where an error would mask
    /// the primary result.
    async fn destroy_sandbox(&self, sandbox_id: &str);

    /// Subscribe to the sandbox's statistics stream
    fn start_monitor(&self, sandbox_id: &str) -> MonitorHandle;
}

/// Translate a human-readable memory limit ("512m", "2g", "1024k", plain
/// bytes) into bytes
pub fn parse_memory_limit(value: &str) -> Result<i64, ExecutionError> {
    let normalized = value.trim().to_lowercase();
    let invalid = || ExecutionError::SandboxCreate(format!("invalid memory limit: {:?}", value));

    if normalized.is_empty() {
        return Err(invalid());
    }

    let (number, multiplier) = match normalized.as_bytes()[normalized.len() - 1] {
        b'k' => (&normalized[..normalized.len() - 1], 1024i64),
        b'm' => (&normalized[..normalized.len() - 1], 1024 * 1024),
        b'g' => (&normalized[..normalized.len() - 1], 1024 * 1024 * 1024),
        _ => (normalized.as_str(), 1),
    };

    let parsed: i64 = number.parse().map_err(|_| invalid())?;
    if parsed <= 0 {
        return Err(invalid());
    }
    parsed.checked_mul(multiplier).ok_or_else(invalid)
}

/// Translate a fractional CPU limit ("0.5") into nano-CPU units
pub fn parse_cpu_limit(value: &str) -> Result<i64, ExecutionError> {
    let invalid = || ExecutionError::SandboxCreate(format!("invalid cpu limit: {:?}", value));

    let parsed: f64 = value.trim().parse().map_err(|_| invalid())?;
    if !parsed.is_finite() || parsed <= 0.0 {
        return Err(invalid());
    }
    Ok((parsed * 1_000_000_000.0) as i64)
}

/// Adapter over the Docker engine
pub struct ContainerRuntime {
    docker: Docker,
    monitor: ResourceMonitor,
    config: Arc<EngineConfig>,
}

impl ContainerRuntime {
    /// Connect to the engine and make sure the internal sandbox network exists
    pub async fn new(config: Arc<EngineConfig>) -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to the container engine")?;
        ensure_internal_network(&docker, &config.network_name).await?;

        let monitor = ResourceMonitor::new(docker.clone(), config.cpu_usage_policy);
        Ok(Self {
            docker,
            monitor,
            config,
        })
    }

    /// Start the exec and accumulate its raw multiplexed output until the
    /// stream ends or the deadline fires. Returns the buffer and whether
    /// the deadline cut the stream short.
    async fn attach_exec(
        &self,
        exec_id: &str,
        timeout: Duration,
    ) -> Result<(Vec<u8>, bool), ExecutionError> {
        let client: Client<UnixConnector, Full<Bytes>> = Client::unix();
        let uri: hyper::Uri =
            UnixUri::new(&self.config.docker_socket, &format!("/exec/{}/start", exec_id)).into();

        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from_static(
                b"{\"Detach\":false,\"Tty\":false}",
            )))
            .map_err(|e| ExecutionError::SandboxExec(format!("failed to build exec request: {}", e)))?;

        let response = client
            .request(request)
            .await
            .map_err(|e| ExecutionError::SandboxExec(format!("exec start failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(ExecutionError::SandboxExec(format!(
                "exec start returned HTTP {}",
                response.status()
            )));
        }

        let mut body = response.into_body();
        let mut buffer: Vec<u8> = Vec::new();
        let mut timed_out = false;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    timed_out = true;
                    break;
                }
                next = body.frame() => match next {
                    Some(Ok(part)) => {
                        if let Some(chunk) = part.data_ref() {
                            buffer.extend_from_slice(chunk);
                        }
                    }
                    Some(Err(e)) => {
                        debug!("Exec stream for {} ended with error: {}", exec_id, e);
                        break;
                    }
                    None => break,
                }
            }
        }
        // Dropping the body tears the attached connection down, which is
        // what forcibly terminates the stream on timeout.
        drop(body);

        Ok((buffer, timed_out))
    }
}

#[async_trait]
impl SandboxRuntime for ContainerRuntime {
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<String, ExecutionError> {
        let memory = parse_memory_limit(&spec.memory_limit)?;
        let nano_cpus = parse_cpu_limit(&spec.cpu_limit)?;
        let workspace = spec.workspace.canonicalize().map_err(|e| {
            ExecutionError::SandboxCreate(format!(
                "workspace {:?} is not mountable: {}",
                spec.workspace, e
            ))
        })?;

        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}:rw",
                workspace.display(),
                SANDBOX_WORKDIR
            )]),
            memory: Some(memory),
            // Same value as memory: no swap headroom for the workload
            memory_swap: Some(memory),
            nano_cpus: Some(nano_cpus),
            pids_limit: Some(self.config.pids_limit),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            network_mode: Some(self.config.network_name.clone()),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(IDLE_COMMAND.iter().map(|s| s.to_string()).collect()),
            env: Some(spec.environment.clone()),
            working_dir: Some(SANDBOX_WORKDIR.to_string()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let name = format!("codebox-{}", Uuid::new_v4());
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| ExecutionError::SandboxCreate(e.to_string()))?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ExecutionError::SandboxCreate(e.to_string()))?;

        info!(
            "Started sandbox {} (image={}, mem={}, cpu={})",
            name, spec.image, spec.memory_limit, spec.cpu_limit
        );
        Ok(created.id)
    }

    async fn exec_in_sandbox(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, ExecutionError> {
        let exec = self
            .docker
            .create_exec(
                sandbox_id,
                CreateExecOptions {
                    cmd: Some(vec![
                        "/bin/sh".to_string(),
                        "-c".to_string(),
                        command.to_string(),
                    ]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    user: Some(self.config.sandbox_user.clone()),
                    working_dir: Some(SANDBOX_WORKDIR.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ExecutionError::SandboxExec(e.to_string()))?;

        debug!("Running exec {} in sandbox {}", exec.id, sandbox_id);
        let (buffer, timed_out) = self.attach_exec(&exec.id, timeout).await?;
        let (stdout, mut stderr) = framing::split_streams(&buffer);

        // Best-effort after a timeout: a still-running exec has no exit code
        let exit_code = match self.docker.inspect_exec(&exec.id).await {
            Ok(inspect) => inspect.exit_code.unwrap_or(SENTINEL_EXIT_CODE),
            Err(e) => {
                warn!("Failed to inspect exec {}: {}", exec.id, e);
                SENTINEL_EXIT_CODE
            }
        };

        if timed_out {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!(
                "Execution timed out after {}ms",
                timeout.as_millis()
            ));
        }

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
            timed_out,
        })
    }

    async fn destroy_sandbox(&self, sandbox_id: &str) {
        match self
            .docker
            .stop_container(sandbox_id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            Ok(()) => {}
            // 304: already stopped, 404: already gone
            Err(DockerError::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => {}
            Err(e) => warn!("Failed to stop sandbox {}: {}", sandbox_id, e),
        }

        match self
            .docker
            .remove_container(
                sandbox_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => info!("Destroyed sandbox {}", sandbox_id),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => warn!("Failed to remove sandbox {}: {}", sandbox_id, e),
        }
    }

    fn start_monitor(&self, sandbox_id: &str) -> MonitorHandle {
        self.monitor.start(sandbox_id)
    }
}

/// Create the internal-only sandbox network if it does not exist yet.
/// Sandboxes on it have no route out and cannot talk to each other.
async fn ensure_internal_network(docker: &Docker, name: &str) -> anyhow::Result<()> {
    let mut options = HashMap::new();
    options.insert(
        "com.docker.network.bridge.enable_icc".to_string(),
        "false".to_string(),
    );

    let result = docker
        .create_network(CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            internal: true,
            options,
            ..Default::default()
        })
        .await;

    match result {
        Ok(_) => {
            info!("Created internal sandbox network {}", name);
            Ok(())
        }
        Err(DockerError::DockerResponseServerError {
            status_code: 409, ..
        }) => Ok(()),
        Err(e) => Err(e).context("Failed to create sandbox network"),
    }
}
