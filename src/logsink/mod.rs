//! Per-session event log sink.
//!
//! Each session opens two append-only artifacts under the project's
//! `logs/` directory: a structured record stream (one self-describing JSON
//! object per line) and a human-readable narrative. The sink also keeps
//! running tallies that the orchestrator reads live for early-warning
//! checks and the quality analyzer reads after the fact.
//!
//! Records are buffered and fsynced on close only; a crash mid-session
//! leaves a truncated-but-valid prefix, which readers must tolerate.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde_json::Value;

use crate::events::{LogRecord, SessionEvent};
use crate::store::SessionKind;

/// Maximum bytes of tool output content preserved per record.
pub const CONTENT_CAP: usize = 4096;

/// Tool-name prefix identifying browser-automation calls.
pub const BROWSER_TOOL_PREFIX: &str = "browser_";

/// Running tallies over one session's event stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogCounters {
    pub tool_uses: u64,
    pub errors: u64,
    pub by_tool: HashMap<String, u64>,
    pub browser_calls: u64,
    pub screenshots: u64,
}

impl LogCounters {
    pub fn observe(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::ToolUse { tool_name, .. } => {
                self.tool_uses += 1;
                *self.by_tool.entry(tool_name.clone()).or_insert(0) += 1;
                if tool_name.starts_with(BROWSER_TOOL_PREFIX) {
                    self.browser_calls += 1;
                    if tool_name.contains("screenshot") {
                        self.screenshots += 1;
                    }
                }
            }
            SessionEvent::ToolResult { is_error: true, .. } | SessionEvent::Error { .. } => {
                self.errors += 1;
            }
            _ => {}
        }
    }
}

/// Shared view of the counters, readable while the session is running.
#[derive(Clone, Default)]
pub struct CounterHandle(Arc<Mutex<LogCounters>>);

impl CounterHandle {
    pub fn snapshot(&self) -> LogCounters {
        self.0.lock().expect("counter lock poisoned").clone()
    }

    fn observe(&self, event: &SessionEvent) {
        self.0.lock().expect("counter lock poisoned").observe(event);
    }
}

/// Paths for one session's artifacts.
pub fn artifact_paths(workspace: &Path, session_number: i64, kind: SessionKind) -> (PathBuf, PathBuf) {
    let stem = format!("session_{:03}_{}", session_number, kind.as_str());
    let logs = workspace.join("logs");
    (
        logs.join(format!("{}.jsonl", stem)),
        logs.join(format!("{}.txt", stem)),
    )
}

/// Path for a session's deep-review artifact.
pub fn review_path(workspace: &Path, session_number: i64) -> PathBuf {
    workspace
        .join("logs")
        .join(format!("session_{:03}_review.md", session_number))
}

pub struct SessionLog {
    session_id: i64,
    jsonl: BufWriter<File>,
    jsonl_path: PathBuf,
    narrative: BufWriter<File>,
    counters: CounterHandle,
    finalized: bool,
}

impl SessionLog {
    /// Open both artifacts, creating the `logs/` directory if needed.
    pub fn open(
        workspace: &Path,
        session_id: i64,
        session_number: i64,
        kind: SessionKind,
    ) -> Result<Self> {
        let (jsonl_path, txt_path) = artifact_paths(workspace, session_number, kind);
        let logs_dir = workspace.join("logs");
        fs::create_dir_all(&logs_dir)
            .with_context(|| format!("Failed to create {}", logs_dir.display()))?;
        let jsonl = File::create(&jsonl_path)
            .with_context(|| format!("Failed to create {}", jsonl_path.display()))?;
        let narrative = File::create(&txt_path)
            .with_context(|| format!("Failed to create {}", txt_path.display()))?;
        Ok(Self {
            session_id,
            jsonl: BufWriter::new(jsonl),
            jsonl_path,
            narrative: BufWriter::new(narrative),
            counters: CounterHandle::default(),
            finalized: false,
        })
    }

    pub fn jsonl_path(&self) -> &Path {
        &self.jsonl_path
    }

    pub fn counters(&self) -> CounterHandle {
        self.counters.clone()
    }

    /// Append one event to both artifacts and fold it into the counters.
    pub fn append(&mut self, event: &SessionEvent) -> Result<()> {
        let bounded = bound_event(event.clone());
        self.counters.observe(&bounded);

        let record = LogRecord::now(self.session_id, bounded.clone());
        let line = serde_json::to_string(&record).context("Failed to encode log record")?;
        self.jsonl.write_all(line.as_bytes())?;
        self.jsonl.write_all(b"\n")?;

        let ts = record.ts.format("%H:%M:%S");
        writeln!(self.narrative, "[{}] {}", ts, narrate(&bounded))?;
        Ok(())
    }

    /// Flush and fsync both artifacts. Appending afterwards is a bug.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        self.jsonl.flush()?;
        self.jsonl.get_ref().sync_all().context("fsync of structured log failed")?;
        self.narrative.flush()?;
        self.narrative.get_ref().sync_all().context("fsync of narrative log failed")?;
        Ok(())
    }
}

/// Truncate unbounded payload fields before they reach the artifacts.
fn bound_event(event: SessionEvent) -> SessionEvent {
    match event {
        SessionEvent::AssistantText { content } => SessionEvent::AssistantText {
            content: truncate(&content, CONTENT_CAP),
        },
        SessionEvent::ToolUse {
            tool_name,
            input,
            duration_ms,
        } => SessionEvent::ToolUse {
            tool_name,
            input: bound_value(input),
            duration_ms,
        },
        SessionEvent::ToolResult {
            tool_name,
            content,
            is_error,
        } => SessionEvent::ToolResult {
            tool_name,
            content: truncate(&content, CONTENT_CAP),
            is_error,
        },
        other => other,
    }
}

fn bound_value(value: Value) -> Value {
    match serde_json::to_string(&value) {
        Ok(s) if s.len() > CONTENT_CAP => Value::String(truncate(&s, CONTENT_CAP)),
        _ => value,
    }
}

fn truncate(s: &str, cap: usize) -> String {
    if s.len() <= cap {
        return s.to_string();
    }
    let mut end = cap;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

/// One-line human rendering of an event for the narrative artifact.
fn narrate(event: &SessionEvent) -> String {
    match event {
        SessionEvent::SessionStart { kind, model } => {
            format!("session started ({} / {})", kind, model)
        }
        SessionEvent::AssistantText { content } => {
            let first = content.lines().next().unwrap_or("");
            format!("agent: {}", truncate(first, 160))
        }
        SessionEvent::ToolUse { tool_name, input, .. } => {
            format!("tool {} {}", tool_name, summarize_input(tool_name, input))
        }
        SessionEvent::ToolResult {
            tool_name,
            is_error,
            ..
        } => {
            if *is_error {
                format!("tool {} -> error", tool_name)
            } else {
                format!("tool {} -> ok", tool_name)
            }
        }
        SessionEvent::Error { kind, message } => format!("ERROR [{}] {}", kind, message),
        SessionEvent::SystemNotice { subtype, .. } => format!("notice: {}", subtype),
        SessionEvent::CompactionBoundary => "--- context compacted ---".to_string(),
        SessionEvent::SessionEnd {
            status,
            duration_seconds,
            tool_use_count,
            error_count,
            ..
        } => format!(
            "session ended: {} ({}s, {} tool uses, {} errors)",
            status, duration_seconds, tool_use_count, error_count
        ),
    }
}

/// Compact rendering of a tool input for the narrative. Never echoes whole
/// payloads; picks the one field a reader wants to see.
fn summarize_input(tool_name: &str, input: &Value) -> String {
    let field = match tool_name {
        "exec" => input.get("command"),
        "create_epic" | "create_task" => input.get("title"),
        "create_test" => input.get("description"),
        "update_test_result" => input.get("outcome"),
        _ => None,
    };
    match field.and_then(|v| v.as_str()) {
        Some(s) => truncate(s, 80),
        None => String::new(),
    }
}
