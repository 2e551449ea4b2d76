//! No-isolation backend: commands run directly on the host.
//!
//! Every command passes the security gate first — containment here is the
//! denylist, nothing else, so the gate is not optional on this path.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::{ExecOutput, SandboxPolicy, SandboxState};
use crate::errors::{ErrorKind, ToolError};
use crate::security;

/// Cap on captured stdout/stderr per exec.
const OUTPUT_CAP: usize = 1024 * 1024;

pub struct HostSandbox {
    workspace: PathBuf,
    policy: SandboxPolicy,
    state: SandboxState,
    /// Process-group ids of in-flight execs, for cancellation escalation.
    active_pgids: Arc<Mutex<Vec<u32>>>,
}

impl HostSandbox {
    pub fn new(workspace: PathBuf, policy: SandboxPolicy) -> Self {
        Self {
            workspace,
            policy,
            state: SandboxState::NotCreated,
            active_pgids: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    /// The host is always "there"; start only validates the workspace.
    pub fn start(&mut self) -> Result<(), ToolError> {
        if !self.workspace.is_dir() {
            return Err(ToolError::new(
                ErrorKind::SandboxUnavailable,
                format!("workspace {} does not exist", self.workspace.display()),
                false,
            ));
        }
        self.state = SandboxState::Ready;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), ToolError> {
        self.kill_active();
        self.state = SandboxState::Gone;
        Ok(())
    }

    pub fn destroy(&mut self) -> Result<(), ToolError> {
        self.stop()
    }

    pub fn health(&self) -> SandboxState {
        self.state
    }

    pub async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, ToolError> {
        if self.state != SandboxState::Ready {
            return Err(ToolError::new(
                ErrorKind::SandboxUnavailable,
                "host sandbox is not started",
                true,
            ));
        }
        security::check(command)?;

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            ToolError::new(
                ErrorKind::SandboxUnavailable,
                format!("failed to spawn shell: {}", e),
                true,
            )
        })?;
        let pgid = child.id();
        if let Some(pgid) = pgid {
            self.active_pgids.lock().expect("pgid lock poisoned").push(pgid);
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let out_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe {
                let _ = pipe.take(OUTPUT_CAP as u64).read_to_end(&mut buf).await;
            }
            buf
        });
        let err_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe {
                let _ = pipe.take(OUTPUT_CAP as u64).read_to_end(&mut buf).await;
            }
            buf
        });

        let waited = tokio::time::timeout(timeout, child.wait()).await;
        if let Some(pgid) = pgid {
            let mut pgids = self.active_pgids.lock().expect("pgid lock poisoned");
            pgids.retain(|p| *p != pgid);
        }

        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(ToolError::new(
                    ErrorKind::SandboxUnavailable,
                    format!("wait for command failed: {}", e),
                    true,
                ));
            }
            Err(_) => {
                if let Some(pgid) = pgid {
                    kill_process_group(pgid).await;
                }
                let _ = child.wait().await;
                return Err(ToolError::timeout(format!(
                    "command exceeded {}s and was killed",
                    timeout.as_secs()
                )));
            }
        };

        let stdout = out_task.await.unwrap_or_default();
        let stderr = err_task.await.unwrap_or_default();
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: status.code().unwrap_or(-1) as i64,
        })
    }

    /// Kill every in-flight exec's process group.
    pub fn kill_active(&self) {
        let pgids: Vec<u32> = {
            let mut guard = self.active_pgids.lock().expect("pgid lock poisoned");
            guard.drain(..).collect()
        };
        for pgid in pgids {
            tokio::spawn(async move { kill_process_group(pgid).await });
        }
    }
}

/// Kill a whole process group, TERM then KILL.
async fn kill_process_group(pgid: u32) {
    let target = format!("-{}", pgid);
    let _ = Command::new("kill")
        .args(["-TERM", &target])
        .status()
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let _ = Command::new("kill").args(["-KILL", &target]).status().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxKind;
    use tempfile::tempdir;

    fn ready_sandbox(dir: &std::path::Path) -> HostSandbox {
        let policy = SandboxPolicy {
            kind: SandboxKind::None,
            ..Default::default()
        };
        let mut sandbox = HostSandbox::new(dir.to_path_buf(), policy);
        sandbox.start().unwrap();
        sandbox
    }

    #[tokio::test]
    async fn exec_captures_output_and_exit_code() {
        let dir = tempdir().unwrap();
        let sandbox = ready_sandbox(dir.path());
        let out = sandbox
            .exec("echo hello && echo oops >&2 && exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn exec_runs_in_the_workspace() {
        let dir = tempdir().unwrap();
        let sandbox = ready_sandbox(dir.path());
        sandbox
            .exec("touch marker.txt", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(dir.path().join("marker.txt").exists());
    }

    #[tokio::test]
    async fn exec_is_gated_by_the_denylist() {
        let dir = tempdir().unwrap();
        let sandbox = ready_sandbox(dir.path());
        let err = sandbox
            .exec("sudo whoami", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SecurityDenied);
    }

    #[tokio::test]
    async fn exec_times_out_and_kills_the_tree() {
        let dir = tempdir().unwrap();
        let sandbox = ready_sandbox(dir.path());
        let started = std::time::Instant::now();
        let err = sandbox
            .exec("sleep 30", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn exec_before_start_is_unavailable() {
        let dir = tempdir().unwrap();
        let policy = SandboxPolicy {
            kind: SandboxKind::None,
            ..Default::default()
        };
        let sandbox = HostSandbox::new(dir.path().to_path_buf(), policy);
        let err = sandbox.exec("true", Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SandboxUnavailable);
    }

    #[tokio::test]
    async fn start_requires_existing_workspace() {
        let policy = SandboxPolicy {
            kind: SandboxKind::None,
            ..Default::default()
        };
        let mut sandbox = HostSandbox::new(PathBuf::from("/no/such/dir"), policy);
        assert!(sandbox.start().is_err());
    }
}
