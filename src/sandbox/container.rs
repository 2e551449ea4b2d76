//! Docker container backend.
//!
//! One container per project, named `atelier-<project-id>`, with the
//! project workspace bind-mounted at `/workspace`. The container runs a
//! long-lived idle process; commands are docker execs against it. An
//! existing healthy container is adopted on start, so warm sandboxes
//! survive across sessions.

use std::path::PathBuf;
use std::time::Duration;

use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use futures_util::StreamExt;

use super::{ExecOutput, SandboxPolicy, SandboxState, StopPolicy};
use crate::errors::{ErrorKind, ToolError};

/// Canonical workspace mount point inside the container.
pub const MOUNT_PATH: &str = "/workspace";

/// Cap on captured stdout/stderr per exec.
const OUTPUT_CAP: usize = 1024 * 1024;

/// Best-effort tooling baseline. Failures are logged, never fatal: the
/// image may already ship everything, or have no package manager at all.
const SETUP_SCRIPT: &str =
    "command -v git >/dev/null 2>&1 || { apt-get update -qq && apt-get install -y -qq git curl ca-certificates; }";

pub struct ContainerSandbox {
    docker: Docker,
    name: String,
    project_id: String,
    workspace: PathBuf,
    policy: SandboxPolicy,
    state: SandboxState,
}

fn unavailable(message: impl Into<String>) -> ToolError {
    ToolError::new(ErrorKind::SandboxUnavailable, message, true)
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

impl ContainerSandbox {
    /// Connect to the Docker daemon and verify it is reachable.
    pub async fn connect(
        project_id: &str,
        workspace: PathBuf,
        policy: SandboxPolicy,
    ) -> Result<Self, ToolError> {
        let docker = Docker::connect_with_socket_defaults()
            .map_err(|e| unavailable(format!("docker socket unavailable: {}", e)))?;
        docker
            .ping()
            .await
            .map_err(|e| unavailable(format!("docker daemon unreachable: {}", e)))?;
        Ok(Self {
            docker,
            name: format!("atelier-{}", project_id),
            project_id: project_id.to_string(),
            workspace,
            policy,
            state: SandboxState::NotCreated,
        })
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    pub fn container_name(&self) -> &str {
        &self.name
    }

    /// Idempotent start: adopt a running container, replace a stopped one,
    /// create from scratch otherwise.
    pub async fn start(&mut self) -> Result<(), ToolError> {
        self.state = SandboxState::Starting;

        match self
            .docker
            .inspect_container(&self.name, None::<InspectContainerOptions>)
            .await
        {
            Ok(existing) => {
                let running = existing
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                if running {
                    self.state = SandboxState::Ready;
                    return Ok(());
                }
                // Stopped leftover from a previous run: the newer start
                // wins, the old container goes away.
                self.docker
                    .remove_container(
                        &self.name,
                        Some(RemoveContainerOptions {
                            force: true,
                            ..Default::default()
                        }),
                    )
                    .await
                    .map_err(|e| unavailable(format!("failed to remove stale container: {}", e)))?;
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(unavailable(format!("container inspect failed: {}", e))),
        }

        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}",
                self.workspace.display(),
                MOUNT_PATH
            )]),
            memory: Some(self.policy.memory_bytes),
            nano_cpus: Some((self.policy.cpus * 1e9) as i64),
            ..Default::default()
        };
        let config = Config::<String> {
            image: Some(self.policy.image.clone()),
            cmd: Some(vec!["sleep".into(), "infinity".into()]),
            working_dir: Some(MOUNT_PATH.into()),
            labels: Some(
                [("atelier.project".to_string(), self.project_id.clone())]
                    .into_iter()
                    .collect(),
            ),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: self.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| unavailable(format!("container create failed: {}", e)))?;
        self.docker
            .start_container(&self.name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| unavailable(format!("container start failed: {}", e)))?;
        self.state = SandboxState::Ready;

        // Tool pre-install; give slow registries a generous window.
        match self.exec(SETUP_SCRIPT, Duration::from_secs(600)).await {
            Ok(out) if out.exit_code != 0 => {
                eprintln!(
                    "[sandbox] setup script exited {} for {}: {}",
                    out.exit_code,
                    self.name,
                    out.stderr.trim()
                );
            }
            Err(e) => eprintln!("[sandbox] setup script failed for {}: {}", self.name, e),
            Ok(_) => {}
        }
        Ok(())
    }

    pub async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, ToolError> {
        if self.state != SandboxState::Ready {
            return Err(unavailable("container sandbox is not started"));
        }
        let exec = self
            .docker
            .create_exec(
                &self.name,
                CreateExecOptions::<String> {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(MOUNT_PATH.into()),
                    cmd: Some(vec!["/bin/sh".into(), "-lc".into(), command.into()]),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| unavailable(format!("exec create failed: {}", e)))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let streamed = tokio::time::timeout(timeout, async {
            match self
                .docker
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| unavailable(format!("exec start failed: {}", e)))?
            {
                StartExecResults::Attached { mut output, .. } => {
                    while let Some(chunk) = output.next().await {
                        match chunk {
                            Ok(LogOutput::StdOut { message }) => {
                                if stdout.len() < OUTPUT_CAP {
                                    stdout.extend_from_slice(&message);
                                }
                            }
                            Ok(LogOutput::StdErr { message }) => {
                                if stderr.len() < OUTPUT_CAP {
                                    stderr.extend_from_slice(&message);
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                return Err(unavailable(format!("exec stream failed: {}", e)));
                            }
                        }
                    }
                    Ok(())
                }
                StartExecResults::Detached => Ok(()),
            }
        })
        .await;

        match streamed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                self.kill_exec_tree(&exec.id).await;
                return Err(ToolError::timeout(format!(
                    "command exceeded {}s inside the sandbox and was killed",
                    timeout.as_secs()
                )));
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| unavailable(format!("exec inspect failed: {}", e)))?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: inspect.exit_code.unwrap_or(-1),
        })
    }

    /// Kill the process group of a timed-out exec. Best effort.
    async fn kill_exec_tree(&self, exec_id: &str) {
        let pid = match self.docker.inspect_exec(exec_id).await {
            Ok(inspect) => inspect.pid,
            Err(_) => None,
        };
        let Some(pid) = pid else { return };
        let killer = format!(
            "PGID=$(ps -o pgid= -p {} 2>/dev/null | tr -d ' '); \
             if [ -n \"$PGID\" ]; then kill -KILL -- -$PGID; else kill -KILL {}; fi",
            pid, pid
        );
        let result = self
            .docker
            .create_exec(
                &self.name,
                CreateExecOptions::<String> {
                    cmd: Some(vec!["/bin/sh".into(), "-c".into(), killer]),
                    ..Default::default()
                },
            )
            .await;
        if let Ok(exec) = result {
            let _ = self.docker.start_exec(&exec.id, None).await;
        }
    }

    /// Orderly end-of-session stop. The default leaves the container warm.
    pub async fn stop(&mut self, policy: StopPolicy) -> Result<(), ToolError> {
        match policy {
            StopPolicy::LeaveRunning => Ok(()),
            StopPolicy::Remove => self.destroy().await,
        }
    }

    /// Stop and remove unconditionally. The bind-mounted workspace is not
    /// touched.
    pub async fn destroy(&mut self) -> Result<(), ToolError> {
        self.state = SandboxState::Stopping;
        let result = self
            .docker
            .remove_container(
                &self.name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        self.state = SandboxState::Gone;
        match result {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(unavailable(format!("container remove failed: {}", e))),
        }
    }

    pub async fn health(&self) -> SandboxState {
        if self.state != SandboxState::Ready {
            return self.state;
        }
        match self
            .docker
            .inspect_container(&self.name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => {
                if inspect.state.and_then(|s| s.running).unwrap_or(false) {
                    SandboxState::Ready
                } else {
                    SandboxState::Gone
                }
            }
            Err(_) => SandboxState::Gone,
        }
    }

    /// Cancellation escalation: hard-stop the container, killing every
    /// process inside. The next session start recreates it.
    pub async fn interrupt(&mut self) {
        let _ = self
            .docker
            .stop_container(&self.name, Some(StopContainerOptions { t: 0 }))
            .await;
        self.state = SandboxState::Gone;
    }
}
