//! Per-project isolated execution environments.
//!
//! A sandbox is a tagged variant over the configured backends, all exposing
//! the same capability set: `start`, `exec`, `stop`, `destroy`, `health`.
//! The orchestrator and tool bridge depend only on that set, so new
//! backends slot in without touching them.
//!
//! File persistence between sessions comes from the workspace bind mount,
//! never from sandbox state: destroying a sandbox must not destroy the
//! workspace.

pub mod container;
pub mod host;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::{ErrorKind, ToolError};
pub use container::ContainerSandbox;
pub use host::HostSandbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxKind {
    /// No isolation: commands run on the host, gated by the denylist.
    None,
    /// Docker container with the workspace bind-mounted.
    Container,
    /// Remote cloud executor. Accepted in policies for forward
    /// compatibility; this build has no backend for it.
    Cloud,
}

impl SandboxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Container => "container",
            Self::Cloud => "cloud",
        }
    }
}

impl FromStr for SandboxKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "local" => Ok(Self::None),
            "container" | "docker" => Ok(Self::Container),
            "cloud" | "remote_cloud" => Ok(Self::Cloud),
            _ => Err(format!("Invalid sandbox kind: {}", s)),
        }
    }
}

/// Resource and runtime policy for one project's sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxPolicy {
    pub kind: SandboxKind,
    pub image: String,
    pub memory_bytes: i64,
    pub cpus: f64,
    pub exec_timeout: Duration,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            kind: SandboxKind::Container,
            image: "ubuntu:24.04".to_string(),
            memory_bytes: 4 * 1024 * 1024 * 1024,
            cpus: 2.0,
            exec_timeout: Duration::from_secs(300),
        }
    }
}

/// Raw TOML structure for an optional per-project `sandbox.toml`.
#[derive(Debug, Deserialize)]
struct PolicyToml {
    sandbox: Option<PolicySection>,
}

#[derive(Debug, Deserialize)]
struct PolicySection {
    kind: Option<String>,
    image: Option<String>,
    memory_bytes: Option<i64>,
    cpus: Option<f64>,
    exec_timeout: Option<u64>,
}

impl SandboxPolicy {
    /// Load overrides from `<workspace>/sandbox.toml` on top of `self`.
    /// A missing file returns the base policy unchanged.
    pub fn with_overrides(mut self, workspace: &Path) -> Result<Self> {
        let path = workspace.join("sandbox.toml");
        if !path.exists() {
            return Ok(self);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let parsed: PolicyToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        if let Some(section) = parsed.sandbox {
            if let Some(kind) = section.kind {
                self.kind = kind
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!(e))
                    .context("Invalid sandbox kind in sandbox.toml")?;
            }
            if let Some(image) = section.image {
                self.image = image;
            }
            if let Some(memory) = section.memory_bytes {
                self.memory_bytes = memory;
            }
            if let Some(cpus) = section.cpus {
                self.cpus = cpus;
            }
            if let Some(secs) = section.exec_timeout {
                self.exec_timeout = Duration::from_secs(secs);
            }
        }
        Ok(self)
    }
}

/// Result of one command execution inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// Sandbox lifecycle. Transitions only move forward except for the
/// `Ready -> Stopping -> Gone` tail; `start` on a `Gone` sandbox is a
/// fresh `Starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    NotCreated,
    Starting,
    Ready,
    Stopping,
    Gone,
}

/// What to do with the sandbox when a session ends in an orderly way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPolicy {
    /// Default: keep the container warm for the next session.
    LeaveRunning,
    /// Stop and remove.
    Remove,
}

pub enum Sandbox {
    Host(HostSandbox),
    Container(ContainerSandbox),
}

impl Sandbox {
    /// Build a sandbox for a project from its policy. Does not start it.
    pub async fn for_project(
        project_id: &str,
        workspace: PathBuf,
        policy: SandboxPolicy,
    ) -> Result<Self, ToolError> {
        match policy.kind {
            SandboxKind::None => Ok(Self::Host(HostSandbox::new(workspace, policy))),
            SandboxKind::Container => {
                let sandbox = ContainerSandbox::connect(project_id, workspace, policy).await?;
                Ok(Self::Container(sandbox))
            }
            SandboxKind::Cloud => Err(ToolError::new(
                ErrorKind::SandboxUnavailable,
                "cloud sandbox backend is not available in this build",
                false,
            )),
        }
    }

    /// Idempotent: adopting an already-healthy environment is a no-op.
    pub async fn start(&mut self) -> Result<(), ToolError> {
        match self {
            Self::Host(h) => h.start(),
            Self::Container(c) => c.start().await,
        }
    }

    pub async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, ToolError> {
        match self {
            Self::Host(h) => h.exec(command, timeout).await,
            Self::Container(c) => c.exec(command, timeout).await,
        }
    }

    pub async fn stop(&mut self, policy: StopPolicy) -> Result<(), ToolError> {
        match self {
            Self::Host(h) => h.stop(),
            Self::Container(c) => c.stop(policy).await,
        }
    }

    pub async fn destroy(&mut self) -> Result<(), ToolError> {
        match self {
            Self::Host(h) => h.destroy(),
            Self::Container(c) => c.destroy().await,
        }
    }

    pub async fn health(&self) -> SandboxState {
        match self {
            Self::Host(h) => h.health(),
            Self::Container(c) => c.health().await,
        }
    }

    /// Kill any in-flight exec process tree. Used by cancellation
    /// escalation after the cooperative window expires.
    pub async fn interrupt(&mut self) {
        match self {
            Self::Host(h) => h.kill_active(),
            Self::Container(c) => c.interrupt().await,
        }
    }

    pub fn exec_timeout(&self) -> Duration {
        match self {
            Self::Host(h) => h.policy().exec_timeout,
            Self::Container(c) => c.policy().exec_timeout,
        }
    }
}

/// Owns at most one live sandbox per project id. `start` for a project is
/// serialized behind that project's entry lock; a second caller waits and
/// then adopts the sandbox the first one built.
#[derive(Clone, Default)]
pub struct SandboxManager {
    entries: Arc<tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<Sandbox>>>>>,
}

impl SandboxManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the project's sandbox, creating and starting it if needed.
    pub async fn acquire(
        &self,
        project_id: &str,
        workspace: &Path,
        policy: SandboxPolicy,
    ) -> Result<Arc<tokio::sync::Mutex<Sandbox>>, ToolError> {
        let entry = {
            let mut entries = self.entries.lock().await;
            match entries.get(project_id) {
                Some(existing) => existing.clone(),
                None => {
                    let sandbox =
                        Sandbox::for_project(project_id, workspace.to_path_buf(), policy).await?;
                    let entry = Arc::new(tokio::sync::Mutex::new(sandbox));
                    entries.insert(project_id.to_string(), entry.clone());
                    entry
                }
            }
        };
        entry.lock().await.start().await?;
        Ok(entry)
    }

    /// Stop and remove a project's sandbox unconditionally. Used on project
    /// deletion and when a policy change invalidates the old environment.
    pub async fn destroy(&self, project_id: &str) {
        let entry = {
            let mut entries = self.entries.lock().await;
            entries.remove(project_id)
        };
        if let Some(entry) = entry {
            if let Err(e) = entry.lock().await.destroy().await {
                eprintln!("[sandbox] destroy for project {} failed: {}", project_id, e);
            }
        }
    }

    /// Kill in-flight execs for a project without tearing the sandbox down.
    pub async fn interrupt(&self, project_id: &str) {
        let entry = {
            let entries = self.entries.lock().await;
            entries.get(project_id).cloned()
        };
        if let Some(entry) = entry {
            entry.lock().await.interrupt().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn kind_parses_aliases() {
        assert_eq!("docker".parse::<SandboxKind>().unwrap(), SandboxKind::Container);
        assert_eq!("local".parse::<SandboxKind>().unwrap(), SandboxKind::None);
        assert_eq!(
            "remote_cloud".parse::<SandboxKind>().unwrap(),
            SandboxKind::Cloud
        );
        assert!("vm".parse::<SandboxKind>().is_err());
    }

    #[test]
    fn policy_defaults() {
        let policy = SandboxPolicy::default();
        assert_eq!(policy.kind, SandboxKind::Container);
        assert_eq!(policy.memory_bytes, 4 * 1024 * 1024 * 1024);
        assert_eq!(policy.exec_timeout, Duration::from_secs(300));
    }

    #[test]
    fn policy_overrides_from_workspace_file() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("sandbox.toml"),
            r#"
[sandbox]
kind = "none"
cpus = 4.0
exec_timeout = 120
"#,
        )
        .unwrap();
        let policy = SandboxPolicy::default().with_overrides(dir.path()).unwrap();
        assert_eq!(policy.kind, SandboxKind::None);
        assert_eq!(policy.cpus, 4.0);
        assert_eq!(policy.exec_timeout, Duration::from_secs(120));
        // Untouched fields keep their defaults
        assert_eq!(policy.image, "ubuntu:24.04");
    }

    #[test]
    fn policy_overrides_missing_file_is_identity() {
        let dir = tempdir().unwrap();
        let policy = SandboxPolicy::default().with_overrides(dir.path()).unwrap();
        assert_eq!(policy, SandboxPolicy::default());
    }

    #[test]
    fn policy_overrides_invalid_toml_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("sandbox.toml"), "not toml {{{{").unwrap();
        assert!(SandboxPolicy::default().with_overrides(dir.path()).is_err());
    }

    #[tokio::test]
    async fn cloud_backend_is_rejected() {
        let dir = tempdir().unwrap();
        let policy = SandboxPolicy {
            kind: SandboxKind::Cloud,
            ..Default::default()
        };
        let err = Sandbox::for_project("p", dir.path().to_path_buf(), policy)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::SandboxUnavailable);
    }
}
