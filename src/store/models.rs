use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::events::TokenUsage;
use crate::sandbox::SandboxKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub workspace: String,
    pub spec_path: Option<String>,
    pub sandbox_kind: SandboxKind,
    pub sandbox_image: String,
    pub completed: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    InProgress,
    Done,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
        }
    }
}

impl FromStr for WorkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            _ => Err(format!("Invalid work status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epic {
    pub id: i64,
    pub project_id: String,
    pub ordinal: i64,
    pub title: String,
    pub description: String,
    /// Derived from child tasks, never stored (done iff every task is done).
    pub status: WorkStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub epic_id: i64,
    pub ordinal: i64,
    pub title: String,
    pub description: String,
    pub status: WorkStatus,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Unknown,
    Pass,
    Fail,
}

impl TestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Pass => "pass",
            Self::Fail => "fail",
        }
    }
}

impl FromStr for TestOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "pass" => Ok(Self::Pass),
            "fail" => Ok(Self::Fail),
            _ => Err(format!("Invalid test outcome: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: i64,
    pub task_id: i64,
    pub description: String,
    pub outcome: TestOutcome,
    pub verification_note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Initializer,
    Coding,
    Review,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializer => "initializer",
            Self::Coding => "coding",
            Self::Review => "review",
        }
    }
}

impl FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializer" => Ok(Self::Initializer),
            "coding" => Ok(Self::Coding),
            "review" => Ok(Self::Review),
            _ => Err(format!("Invalid session kind: {}", s)),
        }
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate counters written once when a session is finalized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionCounters {
    pub tool_uses: u64,
    pub errors: u64,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub project_id: String,
    pub session_number: i64,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub model: String,
    pub prompt_version: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub error_message: Option<String>,
    pub counters: SessionCounters,
    pub tokens: TokenUsage,
    /// Free-form metrics bag (coverage summaries, cost, ...).
    pub metrics: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    Quick,
    Deep,
}

impl CheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Deep => "deep",
        }
    }
}

impl FromStr for CheckType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quick" => Ok(Self::Quick),
            "deep" => Ok(Self::Deep),
            _ => Err(format!("Invalid check type: {}", s)),
        }
    }
}

/// One structured quality issue: a stable tag plus a human message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityIssue {
    pub tag: String,
    pub message: String,
}

impl QualityIssue {
    pub fn new(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityCheck {
    pub id: i64,
    pub session_id: i64,
    pub check_type: CheckType,
    pub rating: i64,
    pub tool_uses: u64,
    pub errors: u64,
    pub browser_verifications: u64,
    pub critical_issues: Vec<QualityIssue>,
    pub warnings: Vec<QualityIssue>,
    pub review_text: Option<String>,
    pub created_at: String,
}

/// Totals/completed counts across the hierarchy for one project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total_epics: u64,
    pub completed_epics: u64,
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub total_tests: u64,
    pub passed_tests: u64,
}

impl Progress {
    pub fn all_tasks_done(&self) -> bool {
        self.total_tasks > 0 && self.completed_tasks == self.total_tasks
    }
}
