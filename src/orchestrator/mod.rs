//! Per-project session loop.
//!
//! One orchestrator instance serves many projects concurrently, but
//! sessions within a project are strictly serial: a per-project advisory
//! lock is held for the whole of every session, and the store
//! independently refuses a second `running` session. The loop owns every
//! lifecycle decision — session kind, sandbox provisioning, event
//! consumption, finalization, quality gating and auto-chaining — while the
//! agent owns the content of the work.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::json;
use tokio::sync::watch;

use crate::bridge::{ToolBridge, WRAPUP_TOOL};
use crate::config::Config;
use crate::driver::{self, AgentInvocation, prompt};
use crate::errors::{ErrorKind, StoreError};
use crate::events::{SessionEvent, TokenUsage};
use crate::logsink::SessionLog;
use crate::review;
use crate::sandbox::SandboxManager;
use crate::store::{
    Progress, Project, Session, SessionCounters, SessionKind, SessionStatus, StoreHandle, Task,
};

/// How long a cancel stays cooperative before the sandbox process tree is
/// killed.
const COOPERATIVE_CANCEL_WINDOW: Duration = Duration::from_secs(10);

/// Auto-chain stops after this many consecutive failed sessions.
const MAX_CONSECUTIVE_FAILURES: u32 = 2;

/// Storage-error backoff cap for the project loop.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Events within which an agent-transport failure makes the session worth
/// one retry.
const TRANSPORT_RETRY_WINDOW: u64 = 10;

/// Result of one driven session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session: Session,
    pub quick_rating: i64,
    /// The stream died of a transport error within its first few events;
    /// the caller may retry once.
    retry_transport: bool,
}

pub struct Orchestrator {
    config: Arc<Config>,
    store: StoreHandle,
    sandboxes: SandboxManager,
    session_locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    stop_flags: std::sync::Mutex<HashMap<String, bool>>,
    cancel_signals: std::sync::Mutex<HashMap<String, Arc<watch::Sender<bool>>>>,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, store: StoreHandle) -> Self {
        Self {
            config,
            store,
            sandboxes: SandboxManager::new(),
            session_locks: tokio::sync::Mutex::new(HashMap::new()),
            stop_flags: std::sync::Mutex::new(HashMap::new()),
            cancel_signals: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Startup reconciliation: sessions left `running` by a dead process
    /// are closed as cancelled. Sandboxes are left alone; a healthy
    /// container is adopted by the next session that wants it.
    pub async fn recover(&self) -> Result<usize> {
        let reconciled = self.store.call(|db| db.cleanup_stale_sessions()).await?;
        if reconciled > 0 {
            eprintln!(
                "[orchestrator] reconciled {} stale running session(s) to cancelled",
                reconciled
            );
        }
        Ok(reconciled)
    }

    // ── Project lifecycle ─────────────────────────────────────────────

    /// Create a project: workspace directory, ingested spec, store row.
    pub async fn create_project(
        &self,
        name: &str,
        spec_source: Option<&Path>,
        force: bool,
    ) -> Result<Project> {
        let existing = {
            let name = name.to_string();
            self.store
                .call(move |db| db.get_project_by_name(&name))
                .await?
        };
        if let Some(existing) = existing {
            if !force {
                bail!(
                    "a project named '{}' already exists; delete it or use --force",
                    name
                );
            }
            self.delete_project(&existing.id).await?;
        }

        let workspace = self.config.workspace_root.join(name);
        std::fs::create_dir_all(&workspace)
            .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;

        let spec_path = match spec_source {
            Some(source) => Some(ingest_spec(&workspace, source)?),
            None => None,
        };

        let name = name.to_string();
        let workspace_str = workspace.to_string_lossy().into_owned();
        let kind = self.config.sandbox_kind;
        let image = self.config.sandbox_image.clone();
        let project = self
            .store
            .call(move |db| {
                db.create_project(&name, &workspace_str, spec_path.as_deref(), kind, &image)
            })
            .await?;
        Ok(project)
    }

    /// Delete a project and everything it owns: sandbox, store rows (by
    /// cascade), workspace directory.
    pub async fn delete_project(&self, project_id: &str) -> Result<()> {
        let project = self.get_project(project_id).await?;
        let active = {
            let id = project.id.clone();
            self.store.call(move |db| db.active_session(&id)).await?
        };
        if active.is_some() {
            bail!("project has a running session; cancel it first");
        }
        self.sandboxes.destroy(&project.id).await;
        {
            let id = project.id.clone();
            self.store.call(move |db| db.delete_project(&id)).await?;
        }
        if let Err(e) = std::fs::remove_dir_all(&project.workspace) {
            if e.kind() != std::io::ErrorKind::NotFound {
                eprintln!(
                    "[orchestrator] could not remove workspace {}: {}",
                    project.workspace, e
                );
            }
        }
        Ok(())
    }

    /// Wipe roadmap and session history so a fresh initializer can run.
    /// The workspace files are preserved.
    pub async fn reset_project(&self, project_id: &str) -> Result<()> {
        let id = project_id.to_string();
        self.store.call(move |db| db.reset_project(&id)).await?;
        Ok(())
    }

    async fn get_project(&self, project_id: &str) -> Result<Project> {
        let id = project_id.to_string();
        self.store
            .call(move |db| db.get_project(&id))
            .await?
            .ok_or_else(|| anyhow::anyhow!("project {} not found", project_id))
    }

    /// Project plus its derived views, for status displays.
    pub async fn project_overview(
        &self,
        project_id: &str,
    ) -> Result<(Project, Progress, Option<Task>, Vec<Session>)> {
        let project = self.get_project(project_id).await?;
        let id = project.id.clone();
        let (progress, next, history) = self
            .store
            .call(move |db| {
                Ok((
                    db.progress(&id)?,
                    db.get_next_task(&id)?,
                    db.session_history(&id)?,
                ))
            })
            .await?;
        Ok((project, progress, next, history))
    }

    // ── Session control ───────────────────────────────────────────────

    /// Let the current session finish, then stop the auto-chain loop.
    pub fn stop_after_current(&self, project_id: &str, stop: bool) {
        self.stop_flags
            .lock()
            .expect("stop flag lock poisoned")
            .insert(project_id.to_string(), stop);
    }

    fn take_stop_flag(&self, project_id: &str) -> bool {
        self.stop_flags
            .lock()
            .expect("stop flag lock poisoned")
            .remove(project_id)
            .unwrap_or(false)
    }

    /// Cancel the project's running session. Cooperative first: the agent
    /// transport closes and the session finalizes as cancelled. If the
    /// session is still alive after the window, the sandbox process tree
    /// is killed.
    pub fn cancel(&self, project_id: &str) {
        let sender = self
            .cancel_signals
            .lock()
            .expect("cancel signal lock poisoned")
            .get(project_id)
            .cloned();
        let Some(sender) = sender else { return };
        let _ = sender.send(true);

        let store = self.store.clone();
        let sandboxes = self.sandboxes.clone();
        let project_id = project_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(COOPERATIVE_CANCEL_WINDOW).await;
            let still_running = {
                let id = project_id.clone();
                store.call(move |db| db.active_session(&id)).await
            };
            if matches!(still_running, Ok(Some(_))) {
                eprintln!(
                    "[orchestrator] cooperative cancel expired for project {}; killing sandbox execs",
                    project_id
                );
                sandboxes.interrupt(&project_id).await;
            }
        });
    }

    // ── Session loops ─────────────────────────────────────────────────

    /// Run session 0. Always stops afterwards: the roadmap needs a human
    /// look before coding starts.
    pub async fn run_initializer(&self, project_id: &str) -> Result<SessionOutcome> {
        let project = self.get_project(project_id).await?;
        let progress = {
            let id = project.id.clone();
            self.store.call(move |db| db.progress(&id)).await?
        };
        if progress.total_epics > 0 {
            bail!(
                "project already initialized with {} epics; run coding sessions instead",
                progress.total_epics
            );
        }
        self.run_session_with_retry(&project, SessionKind::Initializer)
            .await
    }

    /// Auto-chain coding sessions until the work is done, the budget is
    /// exhausted, failures pile up, or someone asks us to stop.
    pub async fn run_coding(
        &self,
        project_id: &str,
        max_sessions: Option<u32>,
    ) -> Result<Option<SessionOutcome>> {
        let project = self.get_project(project_id).await?;
        let mut iterations: u32 = 0;
        let mut consecutive_failures: u32 = 0;
        let mut backoff = Duration::from_secs(1);
        let mut last_outcome: Option<SessionOutcome> = None;

        loop {
            if let Some(max) = max_sessions
                && iterations >= max
            {
                eprintln!("[orchestrator] reached session budget ({}); stopping", max);
                break;
            }
            if self.take_stop_flag(&project.id) {
                eprintln!("[orchestrator] stop requested; halting after current session");
                break;
            }

            let progress = {
                let id = project.id.clone();
                self.store.call(move |db| db.progress(&id)).await?
            };
            if progress.total_tasks == 0 {
                bail!("project not initialized; run the initializer session first");
            }
            if progress.all_tasks_done() {
                let id = project.id.clone();
                self.store
                    .call(move |db| db.mark_project_complete(&id))
                    .await?;
                eprintln!(
                    "[orchestrator] all {} tasks complete for project {}",
                    progress.total_tasks, project.name
                );
                break;
            }

            if iterations > 0 {
                tokio::time::sleep(self.config.auto_continue_delay).await;
            }
            iterations += 1;

            match self
                .run_session_with_retry(&project, SessionKind::Coding)
                .await
            {
                Ok(outcome) => {
                    backoff = Duration::from_secs(1);
                    let status = outcome.session.status;
                    last_outcome = Some(outcome);
                    match status {
                        SessionStatus::Completed => consecutive_failures = 0,
                        SessionStatus::Failed => {
                            consecutive_failures += 1;
                            if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                                eprintln!(
                                    "[orchestrator] {} consecutive failed sessions; halting",
                                    consecutive_failures
                                );
                                break;
                            }
                        }
                        // A cancel means someone out there wants us to stop.
                        SessionStatus::Cancelled => break,
                        SessionStatus::Running => unreachable!("session returned while running"),
                    }
                }
                Err(e) if is_storage_error(&e) => {
                    eprintln!(
                        "[orchestrator] storage unavailable ({}); backing off {}s",
                        e,
                        backoff.as_secs()
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(last_outcome)
    }

    /// One session, retried once when the transport dies in its opening
    /// events.
    async fn run_session_with_retry(
        &self,
        project: &Project,
        kind: SessionKind,
    ) -> Result<SessionOutcome> {
        let outcome = self.run_session(project, kind).await?;
        if outcome.retry_transport {
            eprintln!(
                "[orchestrator] transport failed within the first {} events; retrying once",
                TRANSPORT_RETRY_WINDOW
            );
            return self.run_session(project, kind).await;
        }
        Ok(outcome)
    }

    /// The per-session procedure: provision, open, drive, finalize, gate.
    async fn run_session(&self, project: &Project, kind: SessionKind) -> Result<SessionOutcome> {
        // Per-project advisory lock: one session at a time, no waiting.
        let lock = {
            let mut locks = self.session_locks.lock().await;
            locks
                .entry(project.id.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let Ok(_guard) = lock.try_lock() else {
            bail!("a session is already running for project {}", project.name);
        };

        let workspace = PathBuf::from(&project.workspace);
        if kind == SessionKind::Coding && !workspace.join("init.sh").exists() {
            bail!(
                "workspace {} is missing init.sh; the initializer session has not produced its bootstrap files",
                workspace.display()
            );
        }

        // Session 0 always gets a freshly configured sandbox.
        if kind == SessionKind::Initializer {
            self.sandboxes.destroy(&project.id).await;
        }

        let rendered = prompt::compose(kind, project.sandbox_kind);
        let session = {
            let id = project.id.clone();
            let model = self.config.model_for(kind).to_string();
            let version = rendered.version.to_string();
            self.store
                .call(move |db| db.create_session(&id, kind, &model, &version))
                .await?
        };

        let mut sink = SessionLog::open(&workspace, session.id, session.session_number, kind)?;
        sink.append(&SessionEvent::SessionStart {
            kind: kind.as_str().to_string(),
            model: session.model.clone(),
        })?;

        // Provision the sandbox, one retry on failure, then fail the
        // session visibly.
        let policy = self
            .config
            .sandbox_policy(project.sandbox_kind, &project.sandbox_image)
            .with_overrides(&workspace)?;
        let sandbox = {
            let first = self
                .sandboxes
                .acquire(&project.id, &workspace, policy.clone())
                .await;
            match first {
                Ok(sandbox) => sandbox,
                Err(first_err) => {
                    eprintln!(
                        "[orchestrator] sandbox start failed ({}); retrying once",
                        first_err
                    );
                    match self.sandboxes.acquire(&project.id, &workspace, policy).await {
                        Ok(sandbox) => sandbox,
                        Err(err) => {
                            return self
                                .fail_before_agent(&mut sink, session, err.to_string())
                                .await;
                        }
                    }
                }
            }
        };

        let bridge = Arc::new(ToolBridge::new(
            project.id.clone(),
            session.id,
            kind,
            self.store.clone(),
            sandbox,
        ));

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        self.cancel_signals
            .lock()
            .expect("cancel signal lock poisoned")
            .insert(project.id.clone(), cancel_tx.clone());

        // Soft session cap: crossing it injects a cooperative cancel.
        let timeout_task = {
            let cancel_tx = cancel_tx.clone();
            let cap = self.config.session_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(cap).await;
                let _ = cancel_tx.send(true);
            })
        };

        let invocation = AgentInvocation {
            agent_cmd: self.config.agent_cmd.clone(),
            model: session.model.clone(),
            kind,
            prompt: rendered,
            workspace: workspace.clone(),
            buffer_cap: self.config.buffer_cap,
        };
        let mut events = driver::run(invocation, Some(bridge), cancel_rx);

        // Consume the stream in order. Every event reaches the log before
        // the next one is read.
        let mut event_count: u64 = 0;
        let mut early_transport_error = false;
        let mut error_cut = false;
        let mut last_error: Option<String> = None;
        let mut end_of_stream: Option<(String, f64, u64, u64, TokenUsage)> = None;
        let counters = sink.counters();

        while let Some(event) = events.recv().await {
            event_count += 1;
            sink.append(&event)?;
            match &event {
                SessionEvent::Error { kind, message } => {
                    last_error = Some(message.clone());
                    if kind == "agent_transport" && event_count <= TRANSPORT_RETRY_WINDOW {
                        early_transport_error = true;
                    }
                }
                SessionEvent::ToolUse { tool_name, .. } if tool_name == WRAPUP_TOOL => {
                    eprintln!(
                        "[orchestrator] session {} requested wrap-up",
                        session.session_number
                    );
                }
                SessionEvent::SessionEnd {
                    status,
                    duration_seconds,
                    tool_use_count,
                    error_count,
                    tokens,
                } => {
                    end_of_stream = Some((
                        status.clone(),
                        *duration_seconds,
                        *tool_use_count,
                        *error_count,
                        *tokens,
                    ));
                }
                _ => {}
            }
            if !error_cut && counters.snapshot().errors >= self.config.max_session_errors {
                eprintln!(
                    "[orchestrator] session {} crossed {} errors; terminating early",
                    session.session_number, self.config.max_session_errors
                );
                error_cut = true;
                let _ = cancel_tx.send(true);
                // Keep draining: remaining events still reach the log.
            }
        }
        timeout_task.abort();
        self.cancel_signals
            .lock()
            .expect("cancel signal lock poisoned")
            .remove(&project.id);

        // The driver guarantees a terminal event; synthesize one anyway if
        // the task died hard, so the artifact stays well-formed.
        let (stream_status, duration, tool_uses, errors, tokens) = match end_of_stream {
            Some(end) => end,
            None => {
                let snapshot = counters.snapshot();
                let synthesized = SessionEvent::SessionEnd {
                    status: "failed".into(),
                    duration_seconds: 0.0,
                    tool_use_count: snapshot.tool_uses,
                    error_count: snapshot.errors,
                    tokens: TokenUsage::default(),
                };
                sink.append(&synthesized)?;
                (
                    "failed".into(),
                    0.0,
                    snapshot.tool_uses,
                    snapshot.errors,
                    TokenUsage::default(),
                )
            }
        };
        sink.finalize()?;

        let status = if error_cut {
            SessionStatus::Failed
        } else {
            match stream_status.as_str() {
                "completed" => SessionStatus::Completed,
                "cancelled" => SessionStatus::Cancelled,
                _ => SessionStatus::Failed,
            }
        };

        let mut metrics = json!({
            "prompt_version": session.prompt_version,
            "early_error_termination": error_cut,
        });
        if kind == SessionKind::Initializer && status == SessionStatus::Completed {
            metrics["test_coverage"] = self.coverage_report(&project.id).await?;
        }

        let finalized = {
            let session_id = session.id;
            let error_message = if status == SessionStatus::Failed {
                last_error.clone()
            } else {
                None
            };
            let counters = SessionCounters {
                tool_uses,
                errors,
                duration_seconds: duration,
            };
            self.store
                .call(move |db| {
                    db.finalize_session(
                        session_id,
                        status,
                        counters,
                        tokens,
                        error_message.as_deref(),
                        &metrics,
                    )
                })
                .await?
        };

        // Quality gate: quick path always, deep path conditionally and in
        // the background.
        let quick_rating = match review::run_quick(&self.store, &finalized, &workspace).await {
            Ok(rating) => rating,
            Err(e) => {
                eprintln!(
                    "[orchestrator] quick quality check failed for session {}: {:#}",
                    finalized.id, e
                );
                0
            }
        };
        if quick_rating > 0 {
            let should_deep = review::should_run_deep(
                &self.store,
                &project.id,
                finalized.session_number,
                quick_rating,
            )
            .await
            .unwrap_or(false);
            if should_deep {
                tokio::spawn(review::run_deep(
                    self.config.clone(),
                    self.store.clone(),
                    workspace.clone(),
                    finalized.clone(),
                    quick_rating,
                ));
            }
        }

        let retry_transport =
            status == SessionStatus::Failed && early_transport_error && !error_cut;
        Ok(SessionOutcome {
            session: finalized,
            quick_rating,
            retry_transport,
        })
    }

    /// A session that never reached the agent (sandbox provisioning
    /// failed): frame the log, finalize as failed.
    async fn fail_before_agent(
        &self,
        sink: &mut SessionLog,
        session: Session,
        reason: String,
    ) -> Result<SessionOutcome> {
        sink.append(&SessionEvent::Error {
            kind: ErrorKind::SandboxUnavailable.as_str().to_string(),
            message: reason.clone(),
        })?;
        sink.append(&SessionEvent::SessionEnd {
            status: "failed".into(),
            duration_seconds: 0.0,
            tool_use_count: 0,
            error_count: 1,
            tokens: TokenUsage::default(),
        })?;
        sink.finalize()?;

        let finalized = {
            let session_id = session.id;
            let reason = reason.clone();
            self.store
                .call(move |db| {
                    db.finalize_session(
                        session_id,
                        SessionStatus::Failed,
                        SessionCounters {
                            tool_uses: 0,
                            errors: 1,
                            duration_seconds: 0.0,
                        },
                        TokenUsage::default(),
                        Some(&reason),
                        &json!({}),
                    )
                })
                .await?
        };
        let workspace = PathBuf::from(
            self.get_project(&finalized.project_id)
                .await
                .map(|p| p.workspace)
                .unwrap_or_default(),
        );
        let quick_rating = review::run_quick(&self.store, &finalized, &workspace)
            .await
            .unwrap_or(0);
        Ok(SessionOutcome {
            session: finalized,
            quick_rating,
            retry_transport: false,
        })
    }

    /// Tasks-without-tests summary, stored on the initializer session and
    /// logged for the operator.
    async fn coverage_report(&self, project_id: &str) -> Result<serde_json::Value> {
        let id = project_id.to_string();
        let coverage = self.store.call(move |db| db.epic_coverage(&id)).await?;
        let total_tasks: u64 = coverage.iter().map(|(_, total, _)| total).sum();
        let covered_tasks: u64 = coverage.iter().map(|(_, _, with)| with).sum();
        let poor: Vec<&str> = coverage
            .iter()
            .filter(|(_, total, with)| *total > 0 && *with * 2 < *total)
            .map(|(title, _, _)| title.as_str())
            .collect();
        for title in &poor {
            eprintln!(
                "[orchestrator] epic '{}' has fewer than half its tasks covered by tests",
                title
            );
        }
        Ok(json!({
            "total_tasks": total_tasks,
            "tasks_with_tests": covered_tasks,
            "poor_coverage_epics": poor,
        }))
    }
}

fn is_storage_error(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::Sqlite(_)) | Some(StoreError::Other(_))
    )
}

/// Copy a spec file into the workspace, or concatenate a spec directory's
/// text files. Returns the stored path.
fn ingest_spec(workspace: &Path, source: &Path) -> Result<String> {
    if source.is_file() {
        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("txt");
        let dest = workspace.join(format!("app_spec.{}", ext));
        std::fs::copy(source, &dest)
            .with_context(|| format!("Failed to copy spec {}", source.display()))?;
        return Ok(dest.to_string_lossy().into_owned());
    }
    if source.is_dir() {
        let mut files: Vec<PathBuf> = Vec::new();
        for pattern in ["*.md", "*.txt", "README*"] {
            let full = source.join(pattern).to_string_lossy().into_owned();
            for entry in glob::glob(&full).context("Failed to read spec glob pattern")? {
                let path = entry.context("Failed to read spec directory entry")?;
                if !files.contains(&path) {
                    files.push(path);
                }
            }
        }
        files.sort();
        if files.is_empty() {
            bail!("spec directory {} contains no text files", source.display());
        }
        let mut combined = String::new();
        for file in &files {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let content = std::fs::read_to_string(file)
                .with_context(|| format!("Failed to read spec file {}", file.display()))?;
            combined.push_str(&format!("# {}\n\n{}\n\n", name, content));
        }
        let dest = workspace.join("app_spec.txt");
        std::fs::write(&dest, combined)
            .with_context(|| format!("Failed to write {}", dest.display()))?;
        return Ok(dest.to_string_lossy().into_owned());
    }
    bail!("spec source {} does not exist", source.display())
}
