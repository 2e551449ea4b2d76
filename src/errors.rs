//! Typed error hierarchy for the orchestrator core.
//!
//! Two layers:
//! - `StoreError` — matchable failures from the task store, so callers can
//!   distinguish an invariant violation from a missing row.
//! - `ToolError` — the structured `{kind, message, retriable}` payload that
//!   crosses the tool-bridge boundary. Tool failures are data, not panics:
//!   the external agent receives them as a tool result and may recover.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Uniform error classification surfaced to the agent and to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A state invariant would be violated (e.g. closing a task with
    /// non-passing tests).
    Precondition,
    /// Referenced entity does not exist.
    NotFound,
    /// Referenced entity exists but belongs to another project.
    Forbidden,
    /// Container runtime unreachable or sandbox start failed.
    SandboxUnavailable,
    /// External agent stream aborted or exceeded the transport buffer.
    AgentTransport,
    /// Exec or whole-session wall-clock timeout.
    Timeout,
    /// Command blocked by the security gate.
    SecurityDenied,
    /// Database unavailable or corrupt.
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Precondition => "precondition",
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::SandboxUnavailable => "sandbox_unavailable",
            Self::AgentTransport => "agent_transport",
            Self::Timeout => "timeout",
            Self::SecurityDenied => "security_denied",
            Self::Storage => "storage",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error returned through the tool bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
    pub retriable: bool,
}

impl ToolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, retriable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retriable,
        }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Precondition, message, true)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message, false)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message, false)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message, true)
    }

    pub fn security_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SecurityDenied, message, false)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message, true)
    }

    /// Serialize into the wire payload the agent sees.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind.as_str(),
            "message": self.message,
            "retriable": self.retriable,
        })
    }
}

/// Errors from the task store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} {id} does not belong to project {project_id}")]
    Forbidden {
        entity: &'static str,
        id: String,
        project_id: String,
    },

    #[error("{0}")]
    Precondition(String),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn forbidden(entity: &'static str, id: impl ToString, project_id: impl ToString) -> Self {
        Self::Forbidden {
            entity,
            id: id.to_string(),
            project_id: project_id.to_string(),
        }
    }
}

impl From<StoreError> for ToolError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::NotFound { .. } => ToolError::not_found(err.to_string()),
            StoreError::Forbidden { .. } => ToolError::forbidden(err.to_string()),
            StoreError::Precondition(msg) => ToolError::precondition(msg.clone()),
            StoreError::Sqlite(_) | StoreError::Other(_) => ToolError::storage(err.to_string()),
        }
    }
}
