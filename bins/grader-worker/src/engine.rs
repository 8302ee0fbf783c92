/// Sandbox Engine - Isolated Build Execution
///
/// **Core Responsibility:**
/// Run the project's build-test-lint command in a disposable container
/// bound to one workspace, and return its exit code and combined output.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to execute (Docker)
/// - Engine does NOT parse reports or compute scores
/// - A failing build is a normal result, not an error
/// - Only infrastructure faults (connect, create, start) are errors
///
/// **Lifecycle per run:**
/// 1. Ensure the image is present (best-effort pull)
/// 2. Create a container with memory/CPU/pids limits and two binds:
///    the workspace and the shared dependency cache
/// 3. Start, then wait bounded by a hard wall-clock timeout
/// 4. Collect combined stdout/stderr
/// 5. Force-remove the container on every path

use crate::config::ToolchainProfile;
use crate::metrics;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Exit code reported when the wall-clock timeout fires (as coreutils `timeout`)
pub const TIMEOUT_EXIT_CODE: i64 = 124;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("cannot reach container engine: {0}")]
    Connect(String),
    #[error("failed to pull image {image}: {reason}")]
    Pull { image: String, reason: String },
    #[error("failed to create container: {0}")]
    Create(String),
    #[error("failed to start container: {0}")]
    Start(String),
    #[error("failed waiting for container: {0}")]
    Wait(String),
    #[error("failed to read container output: {0}")]
    Logs(String),
    #[error("failed to remove container {id}: {reason}")]
    Remove { id: String, reason: String },
    #[error("invalid workspace {0}")]
    Workspace(String),
}

/// Everything the runtime needs to create one sandbox container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub working_dir: String,
    /// Docker bind strings, `source:target:mode`
    pub binds: Vec<String>,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub network_disabled: bool,
}

/// Container engine operations used by the sandbox
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    async fn image_present(&self, image: &str) -> bool;
    async fn pull_image(&self, image: &str) -> Result<(), SandboxError>;
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError>;
    async fn start_container(&self, id: &str) -> Result<(), SandboxError>;
    /// Block until the container exits and return its exit code
    async fn wait_container(&self, id: &str) -> Result<i64, SandboxError>;
    /// Combined stdout/stderr written so far
    async fn container_output(&self, id: &str) -> Result<String, SandboxError>;
    /// Forced removal; kills the container if still running
    async fn remove_container(&self, id: &str) -> Result<(), SandboxError>;
}

/// Bollard-backed runtime talking to the local Docker daemon
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Connect(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Verify the daemon answers before accepting work
    pub async fn ping(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::Connect(e.to_string()))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_present(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    async fn pull_image(&self, image: &str) -> Result<(), SandboxError> {
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::Pull {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            working_dir: Some(spec.working_dir.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(spec.network_disabled),
            host_config: Some(HostConfig {
                memory: Some(spec.memory_bytes),
                // No swap beyond the memory ceiling
                memory_swap: Some(spec.memory_bytes),
                nano_cpus: Some(spec.nano_cpus),
                pids_limit: Some(spec.pids_limit),
                binds: Some(spec.binds.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| SandboxError::Create(e.to_string()))?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), SandboxError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Start(e.to_string()))
    }

    async fn wait_container(&self, id: &str) -> Result<i64, SandboxError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Bollard surfaces non-zero exits as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(SandboxError::Wait(e.to_string())),
            None => Err(SandboxError::Wait("no wait response from container".to_string())),
        }
    }

    async fn container_output(&self, id: &str) -> Result<String, SandboxError> {
        let options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        });

        let mut output = String::new();
        let mut stream = self.docker.logs(id, options);
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdIn { .. }) => {}
                Err(e) => return Err(SandboxError::Logs(e.to_string())),
            }
        }
        Ok(output)
    }

    async fn remove_container(&self, id: &str) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| SandboxError::Remove {
                id: id.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Container cleanup guard - removes the container if the run future is
/// dropped (cancelled or panicked) before the explicit removal ran
struct ContainerGuard<R: ContainerRuntime> {
    runtime: Arc<R>,
    container_id: Option<String>,
}

impl<R: ContainerRuntime> ContainerGuard<R> {
    fn new(runtime: Arc<R>, container_id: String) -> Self {
        Self {
            runtime,
            container_id: Some(container_id),
        }
    }

    /// Explicit forced removal; disarms the guard
    async fn remove(mut self) -> Result<(), SandboxError> {
        match self.container_id.take() {
            Some(id) => self.runtime.remove_container(&id).await,
            None => Ok(()),
        }
    }
}

impl<R: ContainerRuntime> Drop for ContainerGuard<R> {
    fn drop(&mut self) {
        let Some(container_id) = self.container_id.take() else {
            return;
        };
        let runtime = Arc::clone(&self.runtime);

        // Cannot await in Drop; hand removal to the runtime if one is running
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = runtime.remove_container(&container_id).await {
                    warn!(container_id = %container_id, error = %e, "Failed to cleanup container");
                }
            });
        } else {
            warn!(container_id = %container_id, "Container leaked: no runtime available for cleanup");
        }
    }
}

/// Result of one sandboxed build
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxOutcome {
    pub exit_code: i64,
    pub output: String,
    pub timed_out: bool,
    pub duration_ms: u64,
}

/// Sandbox engine bound to one toolchain profile
pub struct SandboxEngine<R: ContainerRuntime> {
    runtime: Arc<R>,
    profile: ToolchainProfile,
    timeout: Duration,
    pull_timeout: Duration,
}

impl<R: ContainerRuntime> SandboxEngine<R> {
    pub fn new(runtime: Arc<R>, profile: ToolchainProfile) -> Self {
        let timeout = Duration::from_secs(profile.sandbox.timeout_secs);
        let pull_timeout = Duration::from_secs(profile.sandbox.pull_timeout_secs);
        Self {
            runtime,
            profile,
            timeout,
            pull_timeout,
        }
    }

    /// Override the wall-clock limits (used by tests with sub-second budgets)
    pub fn with_timeouts(mut self, timeout: Duration, pull_timeout: Duration) -> Self {
        self.timeout = timeout;
        self.pull_timeout = pull_timeout;
        self
    }

    pub fn profile(&self) -> &ToolchainProfile {
        &self.profile
    }

    /// Ensure the execution image is available
    ///
    /// **Image Cache Health Check:**
    /// - Cache hit: nothing to do
    /// - Cache miss: pull, bounded by the pull timeout
    /// - Pull failure is tolerated; container creation decides
    async fn ensure_image(&self, image: &str) {
        if self.runtime.image_present(image).await {
            debug!(image, "Image cache hit");
            return;
        }

        warn!(image, "Image cache miss (pulling now)");
        match tokio::time::timeout(self.pull_timeout, self.runtime.pull_image(image)).await {
            Ok(Ok(())) => info!(image, "Image pulled successfully"),
            Ok(Err(e)) => warn!(image, error = %e, "Image pull failed; relying on local cache"),
            Err(_) => warn!(image, timeout_secs = self.pull_timeout.as_secs(), "Image pull timed out"),
        }
    }

    fn container_spec(&self, workspace: &Path) -> Result<ContainerSpec, SandboxError> {
        let workspace = workspace
            .canonicalize()
            .map_err(|e| SandboxError::Workspace(format!("{}: {}", workspace.display(), e)))?;
        let workspace = workspace
            .to_str()
            .ok_or_else(|| SandboxError::Workspace(workspace.display().to_string()))?;

        let sandbox = &self.profile.sandbox;
        Ok(ContainerSpec {
            name: format!("grader-{}", uuid::Uuid::new_v4()),
            image: sandbox.image.clone(),
            cmd: sandbox.command.clone(),
            working_dir: sandbox.workspace_mount.clone(),
            binds: vec![
                format!("{}:{}:rw", workspace, sandbox.workspace_mount),
                format!("{}:{}:rw", sandbox.cache_volume, sandbox.cache_mount),
            ],
            memory_bytes: self.profile.memory_limit_bytes(),
            nano_cpus: self.profile.nano_cpus(),
            pids_limit: sandbox.pids_limit,
            network_disabled: sandbox.network_disabled,
        })
    }

    /// Run the toolchain command against `workspace`
    ///
    /// Never returns an error for build/test failures or timeouts;
    /// those come back as a non-zero `exit_code`.
    #[instrument(skip(self), fields(image = %self.profile.sandbox.image))]
    pub async fn run(&self, workspace: &Path) -> Result<SandboxOutcome, SandboxError> {
        let spec = self.container_spec(workspace)?;
        self.ensure_image(&spec.image).await;

        let container_id = self.runtime.create_container(&spec).await?;
        // Set up cleanup immediately after creation
        let guard = ContainerGuard::new(Arc::clone(&self.runtime), container_id.clone());
        debug!(container_id = %container_id, name = %spec.name, "Container created");

        let start_time = Instant::now();
        let result = self.execute(&container_id).await;
        let duration_ms = start_time.elapsed().as_millis() as u64;

        if let Err(e) = guard.remove().await {
            warn!(container_id = %container_id, error = %e, "Forced container removal failed");
        }

        let (exit_code, output, timed_out) = result?;
        info!(
            container_id = %container_id,
            exit_code,
            timed_out,
            duration_ms,
            "Sandbox run finished"
        );

        Ok(SandboxOutcome {
            exit_code,
            output,
            timed_out,
            duration_ms,
        })
    }

    /// Start, wait with the hard timeout, then collect output
    async fn execute(&self, container_id: &str) -> Result<(i64, String, bool), SandboxError> {
        self.runtime.start_container(container_id).await?;

        let (exit_code, timed_out, note) =
            match tokio::time::timeout(self.timeout, self.runtime.wait_container(container_id)).await {
                Ok(Ok(code)) => (code, false, None),
                Ok(Err(e)) => {
                    warn!(container_id, error = %e, "Waiting on container failed");
                    (1, false, Some(format!("[Sandbox wait failed: {}]", e)))
                }
                Err(_) => {
                    metrics::record_sandbox_timeout();
                    warn!(container_id, timeout_secs = self.timeout.as_secs(), "Sandbox timed out");
                    (
                        TIMEOUT_EXIT_CODE,
                        true,
                        Some(format!("[Sandbox timed out after {}s]", self.timeout.as_secs())),
                    )
                }
            };

        // Partial output is still useful after a timeout
        let mut output = match self.runtime.container_output(container_id).await {
            Ok(output) => output,
            Err(e) => {
                warn!(container_id, error = %e, "Could not collect container output");
                String::new()
            }
        };

        if exit_code == 137 && !timed_out {
            output.push_str("\n[Container killed: likely exceeded memory limit]");
        }
        if let Some(note) = note {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&note);
        }

        Ok((exit_code, output, timed_out))
    }
}
