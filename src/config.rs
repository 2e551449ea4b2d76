//! Runtime configuration.
//!
//! A single immutable `Config` is built once at startup (from the
//! environment) and threaded explicitly into every component constructor.
//! Nothing in the crate reads the environment after this point.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::sandbox::{SandboxKind, SandboxPolicy};

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Directory under which project workspaces are created.
    pub workspace_root: PathBuf,
    /// External agent binary.
    pub agent_cmd: String,
    /// Model for session 0.
    pub initializer_model: String,
    /// Model for coding sessions and deep reviews.
    pub coding_model: String,
    /// Pause between auto-chained sessions.
    pub auto_continue_delay: Duration,
    /// Default sandbox kind for new projects.
    pub sandbox_kind: SandboxKind,
    /// Default container image for new projects.
    pub sandbox_image: String,
    /// Transport line cap for the agent stream.
    pub buffer_cap: usize,
    /// Soft wall-clock cap per session; crossing it cancels cooperatively.
    pub session_timeout: Duration,
    /// Default per-exec timeout inside the sandbox.
    pub exec_timeout: Duration,
    /// Error count at which a running session is cut short.
    pub max_session_errors: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("atelier.db"),
            workspace_root: PathBuf::from("projects"),
            agent_cmd: "claude".to_string(),
            initializer_model: "claude-opus-4-5".to_string(),
            coding_model: "claude-sonnet-4-5".to_string(),
            auto_continue_delay: Duration::from_secs(5),
            sandbox_kind: SandboxKind::Container,
            sandbox_image: "ubuntu:24.04".to_string(),
            buffer_cap: 10 * 1024 * 1024,
            session_timeout: Duration::from_secs(3600),
            exec_timeout: Duration::from_secs(300),
            max_session_errors: 20,
        }
    }
}

impl Config {
    /// Read configuration from `ATELIER_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("ATELIER_DB") {
            config.db_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("ATELIER_WORKSPACES") {
            config.workspace_root = PathBuf::from(path);
        }
        if let Ok(cmd) = std::env::var("ATELIER_AGENT_CMD") {
            config.agent_cmd = cmd;
        }
        if let Ok(model) = std::env::var("ATELIER_INITIALIZER_MODEL") {
            config.initializer_model = model;
        }
        if let Ok(model) = std::env::var("ATELIER_CODING_MODEL") {
            config.coding_model = model;
        }
        if let Ok(delay) = std::env::var("ATELIER_AUTO_CONTINUE_DELAY") {
            let secs: u64 = delay
                .parse()
                .context("ATELIER_AUTO_CONTINUE_DELAY must be an integer (seconds)")?;
            config.auto_continue_delay = Duration::from_secs(secs);
        }
        if let Ok(kind) = std::env::var("ATELIER_SANDBOX") {
            config.sandbox_kind = kind
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("ATELIER_SANDBOX must be none, container or cloud")?;
        }
        if let Ok(image) = std::env::var("ATELIER_SANDBOX_IMAGE") {
            config.sandbox_image = image;
        }
        if let Ok(cap) = std::env::var("ATELIER_BUFFER_CAP") {
            config.buffer_cap = cap
                .parse()
                .context("ATELIER_BUFFER_CAP must be an integer (bytes)")?;
        }
        if let Ok(secs) = std::env::var("ATELIER_SESSION_TIMEOUT") {
            let secs: u64 = secs
                .parse()
                .context("ATELIER_SESSION_TIMEOUT must be an integer (seconds)")?;
            config.session_timeout = Duration::from_secs(secs);
        }
        if let Ok(secs) = std::env::var("ATELIER_EXEC_TIMEOUT") {
            let secs: u64 = secs
                .parse()
                .context("ATELIER_EXEC_TIMEOUT must be an integer (seconds)")?;
            config.exec_timeout = Duration::from_secs(secs);
        }
        if let Ok(count) = std::env::var("ATELIER_MAX_SESSION_ERRORS") {
            config.max_session_errors = count
                .parse()
                .context("ATELIER_MAX_SESSION_ERRORS must be an integer")?;
        }
        Ok(config)
    }

    /// Base sandbox policy for a project, before per-workspace overrides.
    pub fn sandbox_policy(&self, kind: SandboxKind, image: &str) -> SandboxPolicy {
        SandboxPolicy {
            kind,
            image: if image.is_empty() {
                self.sandbox_image.clone()
            } else {
                image.to_string()
            },
            exec_timeout: self.exec_timeout,
            ..SandboxPolicy::default()
        }
    }

    /// Model for a given session kind.
    pub fn model_for(&self, kind: crate::store::SessionKind) -> &str {
        match kind {
            crate::store::SessionKind::Initializer => &self.initializer_model,
            crate::store::SessionKind::Coding | crate::store::SessionKind::Review => {
                &self.coding_model
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.buffer_cap, 10 * 1024 * 1024);
        assert_eq!(config.sandbox_kind, SandboxKind::Container);
        assert_eq!(config.auto_continue_delay, Duration::from_secs(5));
    }

    #[test]
    fn policy_uses_project_image_when_present() {
        let config = Config::default();
        let policy = config.sandbox_policy(SandboxKind::Container, "node:22-slim");
        assert_eq!(policy.image, "node:22-slim");
        let fallback = config.sandbox_policy(SandboxKind::Container, "");
        assert_eq!(fallback.image, config.sandbox_image);
    }

    #[test]
    fn model_selection_by_kind() {
        let config = Config::default();
        assert_eq!(
            config.model_for(crate::store::SessionKind::Initializer),
            config.initializer_model
        );
        assert_eq!(
            config.model_for(crate::store::SessionKind::Review),
            config.coding_model
        );
    }
}
