//! Session event model.
//!
//! A session is observed as a lazy, finite sequence of `SessionEvent`s
//! produced by the agent driver and consumed exactly once by the
//! orchestrator. Events are append-only: once emitted they are written to
//! the log sink and never mutated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token usage totals reported by the external agent at stream end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_creation: u64,
    pub cache_read: u64,
}

/// One observation from a running session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStart {
        kind: String,
        model: String,
    },
    AssistantText {
        content: String,
    },
    ToolUse {
        tool_name: String,
        /// Redacted/abbreviated input, bounded by the sink before writing.
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    ToolResult {
        tool_name: String,
        content: String,
        is_error: bool,
    },
    Error {
        kind: String,
        message: String,
    },
    SystemNotice {
        subtype: String,
        #[serde(default)]
        content: String,
    },
    CompactionBoundary,
    SessionEnd {
        status: String,
        duration_seconds: f64,
        tool_use_count: u64,
        error_count: u64,
        tokens: TokenUsage,
    },
}

impl SessionEvent {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::SessionStart { .. } => "session_start",
            Self::AssistantText { .. } => "assistant_text",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::Error { .. } => "error",
            Self::SystemNotice { .. } => "system_notice",
            Self::CompactionBoundary => "compaction_boundary",
            Self::SessionEnd { .. } => "session_end",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SessionEnd { .. })
    }
}

/// The self-describing record written to the structured log, one per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub ts: DateTime<Utc>,
    pub session_id: i64,
    #[serde(flatten)]
    pub event: SessionEvent,
}

impl LogRecord {
    /// Timestamps are captured here, at the observing side, never trusted
    /// from the external agent.
    pub fn now(session_id: i64, event: SessionEvent) -> Self {
        Self {
            ts: Utc::now(),
            session_id,
            event,
        }
    }
}

/// Distinguished subtype on system notices marking a context compaction.
pub const COMPACT_BOUNDARY_SUBTYPE: &str = "compact_boundary";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serializes_with_flattened_event() {
        let record = LogRecord::now(
            3,
            SessionEvent::ToolUse {
                tool_name: "get_next_task".into(),
                input: serde_json::json!({}),
                duration_ms: Some(12),
            },
        );
        let line = serde_json::to_string(&record).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "tool_use");
        assert_eq!(value["session_id"], 3);
        assert_eq!(value["tool_name"], "get_next_task");
        assert_eq!(value["duration_ms"], 12);
        assert!(value["ts"].is_string());
    }

    #[test]
    fn session_end_record_round_trips() {
        let record = LogRecord::now(
            1,
            SessionEvent::SessionEnd {
                status: "completed".into(),
                duration_seconds: 42.5,
                tool_use_count: 17,
                error_count: 1,
                tokens: TokenUsage {
                    input: 1000,
                    output: 2000,
                    cache_creation: 50,
                    cache_read: 700,
                },
            },
        );
        let line = serde_json::to_string(&record).unwrap();
        let back: LogRecord = serde_json::from_str(&line).unwrap();
        match back.event {
            SessionEvent::SessionEnd {
                tool_use_count,
                tokens,
                ..
            } => {
                assert_eq!(tool_use_count, 17);
                assert_eq!(tokens.cache_read, 700);
            }
            other => panic!("expected session_end, got {:?}", other),
        }
    }

    #[test]
    fn terminal_detection() {
        assert!(
            SessionEvent::SessionEnd {
                status: "cancelled".into(),
                duration_seconds: 0.0,
                tool_use_count: 0,
                error_count: 0,
                tokens: TokenUsage::default(),
            }
            .is_terminal()
        );
        assert!(!SessionEvent::CompactionBoundary.is_terminal());
    }
}
