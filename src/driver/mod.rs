//! Single-shot driver for one external agent invocation.
//!
//! `run` spawns the agent process, feeds it the rendered prompt, answers
//! its bridge tool calls, and translates the transport's wire events into
//! a finite stream of `SessionEvent`s ending with exactly one
//! `session_end`, whatever the transport does: fatal transport failures
//! become a single terminal `error` event, never a panic or an error
//! return at the call site. (The orchestrator frames the stream with
//! `session_start` when it opens the log.)
//!
//! State changes caused by a bridge tool call are committed before the
//! tool result is written back to the agent, so the agent's next decision
//! always sees its own effects.

pub mod prompt;
pub mod wire;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use crate::bridge::ToolBridge;
use crate::events::{COMPACT_BOUNDARY_SUBTYPE, SessionEvent, TokenUsage};
use crate::store::SessionKind;
use prompt::RenderedPrompt;
use wire::{LineRead, WireBlock, WireEvent, read_line_capped};

/// Everything needed to launch one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub agent_cmd: String,
    pub model: String,
    pub kind: SessionKind,
    pub prompt: RenderedPrompt,
    pub workspace: PathBuf,
    pub buffer_cap: usize,
}

/// Launch the agent and return its event stream. The returned channel
/// yields events in transport order and closes after `session_end`.
/// Flipping `cancel` to `true` closes the transport; the stream still
/// terminates with a `session_end` of status `cancelled`.
pub fn run(
    invocation: AgentInvocation,
    bridge: Option<Arc<ToolBridge>>,
    cancel: watch::Receiver<bool>,
) -> mpsc::Receiver<SessionEvent> {
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(run_process(invocation, bridge, cancel, tx));
    rx
}

struct DriveStats {
    started: Instant,
    tool_uses: u64,
    errors: u64,
    tokens: TokenUsage,
}

impl DriveStats {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            tool_uses: 0,
            errors: 0,
            tokens: TokenUsage::default(),
        }
    }

    fn session_end(&self, status: &str) -> SessionEvent {
        SessionEvent::SessionEnd {
            status: status.to_string(),
            duration_seconds: self.started.elapsed().as_secs_f64(),
            tool_use_count: self.tool_uses,
            error_count: self.errors,
            tokens: self.tokens,
        }
    }
}

async fn run_process(
    invocation: AgentInvocation,
    bridge: Option<Arc<ToolBridge>>,
    cancel: watch::Receiver<bool>,
    tx: mpsc::Sender<SessionEvent>,
) {
    let mut stats = DriveStats::new();

    let mut cmd = Command::new(&invocation.agent_cmd);
    cmd.args([
        "--print",
        "--dangerously-skip-permissions",
        "--verbose",
        "--output-format",
        "stream-json",
        "--input-format",
        "stream-json",
        "--model",
        &invocation.model,
        "--append-system-prompt",
        &invocation.prompt.system,
    ])
    .current_dir(&invocation.workspace)
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .stderr(Stdio::null())
    .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            stats.errors += 1;
            let _ = tx
                .send(SessionEvent::Error {
                    kind: "agent_transport".into(),
                    message: format!("failed to spawn agent process: {}", e),
                })
                .await;
            let _ = tx.send(stats.session_end("failed")).await;
            return;
        }
    };

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let (Some(mut stdin), Some(stdout)) = (stdin, stdout) else {
        stats.errors += 1;
        let _ = tx
            .send(SessionEvent::Error {
                kind: "agent_transport".into(),
                message: "agent process pipes unavailable".into(),
            })
            .await;
        let _ = tx.send(stats.session_end("failed")).await;
        let _ = child.kill().await;
        return;
    };

    let opening = wire::user_prompt_line(&invocation.prompt.user);
    if let Err(e) = write_line(&mut stdin, &opening).await {
        stats.errors += 1;
        let _ = tx
            .send(SessionEvent::Error {
                kind: "agent_transport".into(),
                message: format!("failed to send prompt: {}", e),
            })
            .await;
        let _ = tx.send(stats.session_end("failed")).await;
        let _ = child.kill().await;
        return;
    }

    let mut reader = BufReader::new(stdout);
    let cancelled = drive_stream(
        &mut reader,
        &mut stdin,
        invocation.buffer_cap,
        bridge,
        cancel,
        &tx,
        &mut stats,
    )
    .await;

    if cancelled {
        let _ = child.kill().await;
    } else {
        // The transport is done; reap the process without blocking forever.
        match tokio::time::timeout(std::time::Duration::from_secs(10), child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = child.kill().await;
            }
        }
    }
}

/// Consume the wire stream until a terminal event, EOF or cancellation.
/// Emits the final `session_end` in every case; returns whether the loop
/// exited through cancellation.
async fn drive_stream<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_cap: usize,
    bridge: Option<Arc<ToolBridge>>,
    mut cancel: watch::Receiver<bool>,
    tx: &mpsc::Sender<SessionEvent>,
    stats: &mut DriveStats,
) -> bool
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // tool_use id -> tool name, for naming agent-side tool results.
    let mut pending_tools: std::collections::HashMap<String, String> = Default::default();

    loop {
        if *cancel.borrow() {
            let _ = tx.send(stats.session_end("cancelled")).await;
            return true;
        }
        let read = tokio::select! {
            read = read_line_capped(reader, buffer_cap) => read,
            _ = cancel.changed() => continue,
        };
        let line = match read {
            Ok(LineRead::Line(line)) => line,
            Ok(LineRead::Overflow { discarded }) => {
                stats.errors += 1;
                let _ = tx
                    .send(SessionEvent::Error {
                        kind: "agent_transport".into(),
                        message: format!(
                            "dropped a {} byte event exceeding the {} byte transport buffer",
                            discarded, buffer_cap
                        ),
                    })
                    .await;
                continue;
            }
            Ok(LineRead::Eof) => {
                stats.errors += 1;
                let _ = tx
                    .send(SessionEvent::Error {
                        kind: "agent_transport".into(),
                        message: "agent stream ended without a result".into(),
                    })
                    .await;
                let _ = tx.send(stats.session_end("failed")).await;
                return false;
            }
            Err(e) => {
                stats.errors += 1;
                let _ = tx
                    .send(SessionEvent::Error {
                        kind: "agent_transport".into(),
                        message: format!("agent stream read failed: {}", e),
                    })
                    .await;
                let _ = tx.send(stats.session_end("failed")).await;
                return false;
            }
        };

        if line.trim().is_empty() {
            continue;
        }
        let event: WireEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(_) => {
                // Stray non-protocol output; keep it visible but harmless.
                let _ = tx
                    .send(SessionEvent::SystemNotice {
                        subtype: "raw_output".into(),
                        content: line.chars().take(200).collect(),
                    })
                    .await;
                continue;
            }
        };

        match event {
            WireEvent::Assistant { message } => {
                for block in message.content {
                    match block {
                        WireBlock::Text { text } => {
                            let _ = tx.send(SessionEvent::AssistantText { content: text }).await;
                        }
                        WireBlock::ToolUse { id, name, input } => {
                            handle_tool_use(
                                &bridge,
                                &mut pending_tools,
                                writer,
                                tx,
                                stats,
                                id,
                                name,
                                input,
                            )
                            .await;
                        }
                        WireBlock::ToolResult { .. } | WireBlock::Other => {}
                    }
                }
            }
            WireEvent::User { message } => {
                for block in message.content {
                    if let WireBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } = block
                    {
                        let tool_name = pending_tools
                            .remove(&tool_use_id)
                            .unwrap_or_else(|| "unknown".to_string());
                        if is_error {
                            stats.errors += 1;
                        }
                        let _ = tx
                            .send(SessionEvent::ToolResult {
                                tool_name,
                                content: wire::result_content_text(&content),
                                is_error,
                            })
                            .await;
                    }
                }
            }
            WireEvent::System { subtype, message } => {
                let event = if subtype == COMPACT_BOUNDARY_SUBTYPE {
                    SessionEvent::CompactionBoundary
                } else {
                    SessionEvent::SystemNotice {
                        subtype,
                        content: message.unwrap_or_default(),
                    }
                };
                let _ = tx.send(event).await;
            }
            WireEvent::Result {
                subtype,
                is_error,
                result,
                usage,
            } => {
                if let Some(usage) = usage {
                    stats.tokens = TokenUsage {
                        input: usage.input_tokens,
                        output: usage.output_tokens,
                        cache_creation: usage.cache_creation_input_tokens,
                        cache_read: usage.cache_read_input_tokens,
                    };
                }
                if is_error {
                    stats.errors += 1;
                    let _ = tx
                        .send(SessionEvent::Error {
                            kind: "agent_transport".into(),
                            message: result.unwrap_or(subtype),
                        })
                        .await;
                    let _ = tx.send(stats.session_end("failed")).await;
                } else {
                    let _ = tx.send(stats.session_end("completed")).await;
                }
                return false;
            }
        }
    }
}

/// One tool_use block: bridge tools are dispatched here and answered over
/// stdin; agent-side tools are only observed.
#[allow(clippy::too_many_arguments)]
async fn handle_tool_use<W>(
    bridge: &Option<Arc<ToolBridge>>,
    pending_tools: &mut std::collections::HashMap<String, String>,
    writer: &mut W,
    tx: &mpsc::Sender<SessionEvent>,
    stats: &mut DriveStats,
    id: String,
    name: String,
    input: Value,
) where
    W: AsyncWrite + Unpin,
{
    stats.tool_uses += 1;

    let bridged = bridge.as_ref().filter(|b| b.knows(&name));
    let Some(bridge) = bridged else {
        pending_tools.insert(id, name.clone());
        let _ = tx
            .send(SessionEvent::ToolUse {
                tool_name: name,
                input,
                duration_ms: None,
            })
            .await;
        return;
    };

    let dispatch_started = Instant::now();
    let outcome = bridge.dispatch(&name, &input).await;
    let duration_ms = dispatch_started.elapsed().as_millis() as u64;

    let (payload, is_error) = match &outcome {
        Ok(value) => (value.clone(), false),
        Err(err) => (err.to_json(), true),
    };
    // Commit order: the store already holds the state change; answer the
    // agent before telling observers.
    let reply = wire::tool_result_line(&id, &payload, is_error);
    if let Err(e) = write_line(writer, &reply).await {
        stats.errors += 1;
        let _ = tx
            .send(SessionEvent::Error {
                kind: "agent_transport".into(),
                message: format!("failed to answer tool call: {}", e),
            })
            .await;
    }

    let _ = tx
        .send(SessionEvent::ToolUse {
            tool_name: name.clone(),
            input,
            duration_ms: Some(duration_ms),
        })
        .await;
    if is_error {
        stats.errors += 1;
    }
    let _ = tx
        .send(SessionEvent::ToolResult {
            tool_name: name,
            content: payload.to_string(),
            is_error,
        })
        .await;
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{Sandbox, SandboxKind, SandboxPolicy};
    use crate::store::{StoreHandle, TaskStore};
    use std::io::Cursor;
    use tempfile::TempDir;

    async fn collect(
        script: &str,
        bridge: Option<Arc<ToolBridge>>,
        cap: usize,
    ) -> (Vec<SessionEvent>, String) {
        let (tx, mut rx) = mpsc::channel(256);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let mut reader = BufReader::new(Cursor::new(script.to_string()));
        let mut written: Vec<u8> = Vec::new();
        let mut stats = DriveStats::new();
        let cancelled = drive_stream(
            &mut reader,
            &mut written,
            cap,
            bridge,
            cancel_rx,
            &tx,
            &mut stats,
        )
        .await;
        assert!(!cancelled);
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (events, String::from_utf8_lossy(&written).into_owned())
    }

    fn wire_lines(lines: &[&str]) -> String {
        let mut script = lines.join("\n");
        script.push('\n');
        script
    }

    #[tokio::test]
    async fn text_and_result_translate_to_events() {
        let script = wire_lines(&[
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"working on it"}]}}"#,
            r#"{"type":"result","subtype":"success","usage":{"input_tokens":100,"output_tokens":50}}"#,
        ]);
        let (events, _) = collect(&script, None, 1024 * 1024).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], SessionEvent::AssistantText { content } if content == "working on it"));
        match &events[1] {
            SessionEvent::SessionEnd { status, tokens, .. } => {
                assert_eq!(status, "completed");
                assert_eq!(tokens.input, 100);
            }
            other => panic!("expected session_end, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn eof_without_result_is_a_transport_failure() {
        let script = wire_lines(&[
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#,
        ]);
        let (events, _) = collect(&script, None, 1024 * 1024).await;
        assert!(matches!(
            &events[1],
            SessionEvent::Error { kind, .. } if kind == "agent_transport"
        ));
        assert!(
            matches!(&events[2], SessionEvent::SessionEnd { status, .. } if status == "failed")
        );
    }

    #[tokio::test]
    async fn overflow_is_survivable() {
        let huge = format!(
            r#"{{"type":"assistant","message":{{"content":[{{"type":"text","text":"{}"}}]}}}}"#,
            "x".repeat(4096)
        );
        let script = wire_lines(&[
            huge.as_str(),
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"still here"}]}}"#,
            r#"{"type":"result","subtype":"success"}"#,
        ]);
        let (events, _) = collect(&script, None, 1024).await;
        assert!(matches!(
            &events[0],
            SessionEvent::Error { kind, .. } if kind == "agent_transport"
        ));
        assert!(matches!(
            &events[1],
            SessionEvent::AssistantText { content } if content == "still here"
        ));
        assert!(matches!(
            &events[2],
            SessionEvent::SessionEnd { status, error_count, .. }
                if status == "completed" && *error_count == 1
        ));
    }

    #[tokio::test]
    async fn bridge_tools_are_dispatched_and_answered() {
        let dir = TempDir::new().unwrap();
        let store = StoreHandle::new(TaskStore::open_in_memory().unwrap());
        let workspace = dir.path().to_string_lossy().into_owned();
        let project = {
            let workspace = workspace.clone();
            store
                .call(move |db| db.create_project("demo", &workspace, None, SandboxKind::None, ""))
                .await
                .unwrap()
        };
        let session = {
            let project_id = project.id.clone();
            store
                .call(move |db| {
                    db.create_session(&project_id, crate::store::SessionKind::Initializer, "m", "v1")
                })
                .await
                .unwrap()
        };
        let policy = SandboxPolicy {
            kind: SandboxKind::None,
            ..Default::default()
        };
        let mut sandbox = Sandbox::for_project(&project.id, dir.path().to_path_buf(), policy)
            .await
            .unwrap();
        sandbox.start().await.unwrap();
        let bridge = Arc::new(ToolBridge::new(
            project.id.clone(),
            session.id,
            crate::store::SessionKind::Initializer,
            store.clone(),
            Arc::new(tokio::sync::Mutex::new(sandbox)),
        ));

        let script = wire_lines(&[
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"create_epic","input":{"ordinal":1,"title":"Core"}}]}}"#,
            r#"{"type":"result","subtype":"success"}"#,
        ]);
        let (events, answered) = collect(&script, Some(bridge), 1024 * 1024).await;

        // The epic landed in the store before the reply went out.
        let epics = {
            let project_id = project.id.clone();
            store
                .call(move |db| db.list_epics(&project_id))
                .await
                .unwrap()
        };
        assert_eq!(epics.len(), 1);
        assert!(answered.contains("tool_result"));
        assert!(answered.contains("t1"));

        assert!(matches!(
            &events[0],
            SessionEvent::ToolUse { tool_name, duration_ms, .. }
                if tool_name == "create_epic" && duration_ms.is_some()
        ));
        assert!(matches!(
            &events[1],
            SessionEvent::ToolResult { is_error: false, .. }
        ));
    }

    #[tokio::test]
    async fn agent_side_tool_results_are_matched_by_id() {
        let script = wire_lines(&[
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"b1","name":"browser_navigate","input":{"url":"http://localhost:3000"}}]}}"#,
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"b1","content":"page loaded","is_error":false}]}}"#,
            r#"{"type":"result","subtype":"success"}"#,
        ]);
        let (events, answered) = collect(&script, None, 1024 * 1024).await;
        // Agent-side tools are observed, never answered by us.
        assert!(answered.is_empty());
        assert!(matches!(
            &events[0],
            SessionEvent::ToolUse { tool_name, duration_ms: None, .. }
                if tool_name == "browser_navigate"
        ));
        assert!(matches!(
            &events[1],
            SessionEvent::ToolResult { tool_name, .. } if tool_name == "browser_navigate"
        ));
    }

    #[tokio::test]
    async fn compact_boundary_is_distinguished() {
        let script = wire_lines(&[
            r#"{"type":"system","subtype":"compact_boundary"}"#,
            r#"{"type":"system","subtype":"init","message":"session init"}"#,
            r#"{"type":"result","subtype":"success"}"#,
        ]);
        let (events, _) = collect(&script, None, 1024 * 1024).await;
        assert!(matches!(events[0], SessionEvent::CompactionBoundary));
        assert!(matches!(
            &events[1],
            SessionEvent::SystemNotice { subtype, .. } if subtype == "init"
        ));
    }

    #[tokio::test]
    async fn error_result_finalizes_as_failed() {
        let script = wire_lines(&[
            r#"{"type":"result","subtype":"error_during_execution","is_error":true,"result":"credit exhausted"}"#,
        ]);
        let (events, _) = collect(&script, None, 1024 * 1024).await;
        assert!(matches!(
            &events[0],
            SessionEvent::Error { message, .. } if message == "credit exhausted"
        ));
        assert!(
            matches!(&events[1], SessionEvent::SessionEnd { status, .. } if status == "failed")
        );
    }

    #[tokio::test]
    async fn cancellation_yields_terminal_cancelled_event() {
        let (tx, mut rx) = mpsc::channel(16);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        cancel_tx.send(true).unwrap();
        // A reader that would block forever on a real pipe; here the cancel
        // check fires before any read matters.
        let mut reader = BufReader::new(Cursor::new(String::new()));
        let mut written: Vec<u8> = Vec::new();
        let mut stats = DriveStats::new();
        let cancelled = drive_stream(
            &mut reader,
            &mut written,
            1024,
            None,
            cancel_rx,
            &tx,
            &mut stats,
        )
        .await;
        assert!(cancelled);
        drop(tx);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::SessionEnd { ref status, .. } if status == "cancelled"));
    }
}
