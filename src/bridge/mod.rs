//! In-process tool server exposed to the external agent.
//!
//! One bridge instance is bound to a single `{project, session, sandbox}`
//! triple at construction. Every call validates payload shape and entity
//! ownership: an agent working project P can never read or mutate project
//! Q. Failures cross the boundary as structured `ToolError` payloads, not
//! as Rust errors, so the agent can observe them and recover.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::errors::ToolError;
use crate::sandbox::Sandbox;
use crate::store::{SessionKind, StoreHandle, TestOutcome};

/// Maximum serialized size of a tool input payload.
pub const INPUT_CAP: usize = 64 * 1024;

/// Housekeeping tool: the agent signals that it is wrapping up; the
/// orchestrator observes the marker through the event stream.
pub const WRAPUP_TOOL: &str = "session_wrapup";

/// Every tool name the bridge answers for.
pub const CATALOG: &[&str] = &[
    "task_status",
    "get_next_task",
    "list_epics",
    "get_epic",
    "list_tasks",
    "get_task",
    "list_tests",
    "update_task_status",
    "start_task",
    "update_test_result",
    "create_epic",
    "create_task",
    "create_test",
    "expand_epic",
    "log_session",
    "exec",
    WRAPUP_TOOL,
];

pub struct ToolBridge {
    project_id: String,
    session_id: i64,
    session_kind: SessionKind,
    store: StoreHandle,
    sandbox: Arc<tokio::sync::Mutex<Sandbox>>,
}

// ── Payload shapes ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct EpicRef {
    epic_id: i64,
}

#[derive(Deserialize)]
struct TaskRef {
    task_id: i64,
}

#[derive(Deserialize)]
struct TaskStatusUpdate {
    task_id: i64,
    done: bool,
}

#[derive(Deserialize)]
struct TestResultUpdate {
    test_id: i64,
    outcome: String,
    #[serde(default)]
    verification_note: Option<String>,
}

#[derive(Deserialize)]
struct NewEpic {
    ordinal: i64,
    title: String,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct NewTask {
    epic_id: i64,
    ordinal: i64,
    title: String,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct NewTest {
    task_id: i64,
    description: String,
}

#[derive(Deserialize)]
struct ExpandEpic {
    epic_id: i64,
    tasks: Vec<ExpandTask>,
}

#[derive(Deserialize)]
struct ExpandTask {
    ordinal: i64,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tests: Vec<String>,
}

#[derive(Deserialize)]
struct SessionNote {
    note: String,
}

#[derive(Deserialize)]
struct ExecRequest {
    command: String,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

fn parse<T: serde::de::DeserializeOwned>(input: &Value) -> Result<T, ToolError> {
    serde_json::from_value(input.clone())
        .map_err(|e| ToolError::precondition(format!("invalid tool input: {}", e)))
}

fn encode<T: serde::Serialize>(value: T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|e| ToolError::storage(e.to_string()))
}

impl ToolBridge {
    pub fn new(
        project_id: impl Into<String>,
        session_id: i64,
        session_kind: SessionKind,
        store: StoreHandle,
        sandbox: Arc<tokio::sync::Mutex<Sandbox>>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            session_id,
            session_kind,
            store,
            sandbox,
        }
    }

    pub fn knows(&self, tool_name: &str) -> bool {
        CATALOG.contains(&tool_name)
    }

    /// Execute one tool call. `Err` values here are still *results* from
    /// the agent's point of view; the driver serializes them back as
    /// structured tool errors.
    pub async fn dispatch(&self, tool_name: &str, input: &Value) -> Result<Value, ToolError> {
        let serialized_len = serde_json::to_string(input).map(|s| s.len()).unwrap_or(0);
        if serialized_len > INPUT_CAP {
            return Err(ToolError::precondition(format!(
                "tool input of {} bytes exceeds the {} byte limit",
                serialized_len, INPUT_CAP
            )));
        }

        match tool_name {
            "task_status" => self.task_status().await,
            "get_next_task" => self.get_next_task().await,
            "list_epics" => self.list_epics().await,
            "get_epic" => self.get_epic(parse::<EpicRef>(input)?.epic_id).await,
            "list_tasks" => self.list_tasks(parse::<EpicRef>(input)?.epic_id).await,
            "get_task" => self.get_task(parse::<TaskRef>(input)?.task_id).await,
            "list_tests" => self.list_tests(parse::<TaskRef>(input)?.task_id).await,
            "update_task_status" => self.update_task_status(parse(input)?).await,
            "start_task" => self.start_task(parse::<TaskRef>(input)?.task_id).await,
            "update_test_result" => self.update_test_result(parse(input)?).await,
            "create_epic" => self.create_epic(parse(input)?).await,
            "create_task" => self.create_task(parse(input)?).await,
            "create_test" => self.create_test(parse(input)?).await,
            "expand_epic" => self.expand_epic(parse(input)?).await,
            "log_session" => self.log_session(parse(input)?).await,
            "exec" => self.exec(parse(input)?).await,
            WRAPUP_TOOL => Ok(json!({ "acknowledged": true })),
            other => Err(ToolError::not_found(format!("unknown tool: {}", other))),
        }
    }

    // ── Ownership checks ──────────────────────────────────────────────

    async fn own_epic(&self, epic_id: i64) -> Result<(), ToolError> {
        let owner = self
            .store
            .call(move |db| db.project_of_epic(epic_id))
            .await?;
        self.check_owner("epic", epic_id, owner)
    }

    async fn own_task(&self, task_id: i64) -> Result<(), ToolError> {
        let owner = self
            .store
            .call(move |db| db.project_of_task(task_id))
            .await?;
        self.check_owner("task", task_id, owner)
    }

    async fn own_test(&self, test_id: i64) -> Result<(), ToolError> {
        let owner = self
            .store
            .call(move |db| db.project_of_test(test_id))
            .await?;
        self.check_owner("test", test_id, owner)
    }

    fn check_owner(
        &self,
        entity: &'static str,
        id: i64,
        owner: Option<String>,
    ) -> Result<(), ToolError> {
        match owner {
            None => Err(ToolError::not_found(format!("{} {} not found", entity, id))),
            Some(p) if p == self.project_id => Ok(()),
            Some(_) => Err(ToolError::forbidden(format!(
                "{} {} does not belong to this project",
                entity, id
            ))),
        }
    }

    // ── Task operations ───────────────────────────────────────────────

    async fn task_status(&self) -> Result<Value, ToolError> {
        let project_id = self.project_id.clone();
        let (progress, next) = self
            .store
            .call(move |db| {
                let progress = db.progress(&project_id)?;
                let next = db.get_next_task(&project_id)?;
                Ok((progress, next))
            })
            .await?;
        Ok(json!({ "progress": encode(progress)?, "next_task": encode(next)? }))
    }

    async fn get_next_task(&self) -> Result<Value, ToolError> {
        let project_id = self.project_id.clone();
        let next = self
            .store
            .call(move |db| db.get_next_task(&project_id))
            .await?;
        encode(next)
    }

    async fn list_epics(&self) -> Result<Value, ToolError> {
        let project_id = self.project_id.clone();
        let epics = self.store.call(move |db| db.list_epics(&project_id)).await?;
        encode(epics)
    }

    async fn get_epic(&self, epic_id: i64) -> Result<Value, ToolError> {
        self.own_epic(epic_id).await?;
        let epic = self
            .store
            .call(move |db| db.get_epic(epic_id))
            .await?
            .ok_or_else(|| ToolError::not_found(format!("epic {} not found", epic_id)))?;
        encode(epic)
    }

    async fn list_tasks(&self, epic_id: i64) -> Result<Value, ToolError> {
        self.own_epic(epic_id).await?;
        let tasks = self.store.call(move |db| db.list_tasks(epic_id)).await?;
        encode(tasks)
    }

    async fn get_task(&self, task_id: i64) -> Result<Value, ToolError> {
        self.own_task(task_id).await?;
        let task = self
            .store
            .call(move |db| db.get_task(task_id))
            .await?
            .ok_or_else(|| ToolError::not_found(format!("task {} not found", task_id)))?;
        encode(task)
    }

    async fn list_tests(&self, task_id: i64) -> Result<Value, ToolError> {
        self.own_task(task_id).await?;
        let tests = self.store.call(move |db| db.list_tests(task_id)).await?;
        encode(tests)
    }

    async fn update_task_status(&self, update: TaskStatusUpdate) -> Result<Value, ToolError> {
        self.own_task(update.task_id).await?;
        let task = self
            .store
            .call(move |db| db.update_task_status(update.task_id, update.done))
            .await?;
        encode(task)
    }

    async fn start_task(&self, task_id: i64) -> Result<Value, ToolError> {
        self.own_task(task_id).await?;
        let task = self.store.call(move |db| db.start_task(task_id)).await?;
        encode(task)
    }

    async fn update_test_result(&self, update: TestResultUpdate) -> Result<Value, ToolError> {
        self.own_test(update.test_id).await?;
        let outcome: TestOutcome = update
            .outcome
            .parse()
            .map_err(|e: String| ToolError::precondition(e))?;
        let test = self
            .store
            .call(move |db| {
                db.update_test_result(update.test_id, outcome, update.verification_note.as_deref())
            })
            .await?;
        encode(test)
    }

    // ── Roadmap creation (initializer session) ────────────────────────

    async fn create_epic(&self, new: NewEpic) -> Result<Value, ToolError> {
        self.require_initializer("create_epic")?;
        let project_id = self.project_id.clone();
        let epic = self
            .store
            .call(move |db| db.create_epic(&project_id, new.ordinal, &new.title, &new.description))
            .await?;
        encode(epic)
    }

    async fn create_task(&self, new: NewTask) -> Result<Value, ToolError> {
        self.own_epic(new.epic_id).await?;
        let task = self
            .store
            .call(move |db| db.create_task(new.epic_id, new.ordinal, &new.title, &new.description))
            .await?;
        encode(task)
    }

    async fn create_test(&self, new: NewTest) -> Result<Value, ToolError> {
        self.own_task(new.task_id).await?;
        let test = self
            .store
            .call(move |db| db.create_test(new.task_id, &new.description))
            .await?;
        encode(test)
    }

    /// Bulk-create tasks (and their tests) under one epic.
    async fn expand_epic(&self, expand: ExpandEpic) -> Result<Value, ToolError> {
        self.own_epic(expand.epic_id).await?;
        let created = self
            .store
            .call(move |db| {
                let mut created = Vec::new();
                for task in &expand.tasks {
                    let row =
                        db.create_task(expand.epic_id, task.ordinal, &task.title, &task.description)?;
                    for test in &task.tests {
                        db.create_test(row.id, test)?;
                    }
                    created.push(row);
                }
                Ok(created)
            })
            .await?;
        encode(created)
    }

    /// Roadmap structure is laid down exactly once, by the initializer.
    fn require_initializer(&self, tool: &str) -> Result<(), ToolError> {
        if self.session_kind != SessionKind::Initializer {
            return Err(ToolError::precondition(format!(
                "{} is only available during the initializer session",
                tool
            )));
        }
        Ok(())
    }

    // ── Housekeeping & execution ──────────────────────────────────────

    async fn log_session(&self, note: SessionNote) -> Result<Value, ToolError> {
        let session_id = self.session_id;
        self.store
            .call(move |db| db.append_session_note(session_id, &note.note))
            .await?;
        Ok(json!({ "logged": true }))
    }

    async fn exec(&self, request: ExecRequest) -> Result<Value, ToolError> {
        let sandbox = self.sandbox.lock().await;
        let cap = sandbox.exec_timeout();
        let timeout = match request.timeout_seconds {
            Some(secs) => Duration::from_secs(secs).min(cap),
            None => cap,
        };
        let output = sandbox.exec(&request.command, timeout).await?;
        encode(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::sandbox::{SandboxKind, SandboxPolicy};
    use crate::store::{StoreHandle, TaskStore, WorkStatus};
    use tempfile::TempDir;

    async fn bridge_fixture(kind: SessionKind) -> (ToolBridge, StoreHandle, String, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = StoreHandle::new(TaskStore::open_in_memory().unwrap());
        let workspace = dir.path().to_string_lossy().into_owned();
        let project = {
            let workspace = workspace.clone();
            store
                .call(move |db| {
                    db.create_project("demo", &workspace, None, SandboxKind::None, "")
                })
                .await
                .unwrap()
        };
        let project_id = project.id.clone();
        let session = {
            let project_id = project_id.clone();
            store
                .call(move |db| db.create_session(&project_id, SessionKind::Initializer, "m", "v1"))
                .await
                .unwrap()
        };
        let policy = SandboxPolicy {
            kind: SandboxKind::None,
            ..Default::default()
        };
        let mut sandbox = Sandbox::for_project(&project_id, dir.path().to_path_buf(), policy)
            .await
            .unwrap();
        sandbox.start().await.unwrap();
        let bridge = ToolBridge::new(
            project_id.clone(),
            session.id,
            kind,
            store.clone(),
            Arc::new(tokio::sync::Mutex::new(sandbox)),
        );
        (bridge, store, project_id, dir)
    }

    #[tokio::test]
    async fn roadmap_creation_and_status_flow() {
        let (bridge, _store, _pid, _dir) = bridge_fixture(SessionKind::Initializer).await;

        let epic = bridge
            .dispatch(
                "create_epic",
                &json!({"ordinal": 1, "title": "Core", "description": "core work"}),
            )
            .await
            .unwrap();
        let epic_id = epic["id"].as_i64().unwrap();

        bridge
            .dispatch(
                "expand_epic",
                &json!({
                    "epic_id": epic_id,
                    "tasks": [
                        {"ordinal": 1, "title": "Scaffold", "tests": ["app boots"]},
                        {"ordinal": 2, "title": "Persist", "tests": ["data survives restart"]}
                    ]
                }),
            )
            .await
            .unwrap();

        let status = bridge.dispatch("task_status", &json!({})).await.unwrap();
        assert_eq!(status["progress"]["total_tasks"], 2);
        assert_eq!(status["progress"]["total_tests"], 2);
        assert_eq!(status["next_task"]["title"], "Scaffold");
    }

    #[tokio::test]
    async fn create_epic_is_initializer_only() {
        let (bridge, _store, _pid, _dir) = bridge_fixture(SessionKind::Coding).await;
        let err = bridge
            .dispatch("create_epic", &json!({"ordinal": 1, "title": "Core"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Precondition);
    }

    #[tokio::test]
    async fn cross_project_access_is_forbidden() {
        let (bridge, store, _pid, dir) = bridge_fixture(SessionKind::Initializer).await;
        // Entity owned by a different project.
        let workspace = dir.path().to_string_lossy().into_owned();
        let other_epic = store
            .call(move |db| {
                let other =
                    db.create_project("other", &workspace, None, SandboxKind::None, "")?;
                db.create_epic(&other.id, 1, "Other core", "")
            })
            .await
            .unwrap();

        let err = bridge
            .dispatch("get_epic", &json!({"epic_id": other_epic.id}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Forbidden);

        let err = bridge
            .dispatch(
                "create_task",
                &json!({"epic_id": other_epic.id, "ordinal": 1, "title": "sneaky"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn closing_a_task_with_failing_tests_is_a_structured_error() {
        let (bridge, _store, _pid, _dir) = bridge_fixture(SessionKind::Initializer).await;
        let epic = bridge
            .dispatch("create_epic", &json!({"ordinal": 1, "title": "Core"}))
            .await
            .unwrap();
        let task = bridge
            .dispatch(
                "create_task",
                &json!({"epic_id": epic["id"], "ordinal": 1, "title": "Build"}),
            )
            .await
            .unwrap();
        let test = bridge
            .dispatch(
                "create_test",
                &json!({"task_id": task["id"], "description": "works"}),
            )
            .await
            .unwrap();

        let err = bridge
            .dispatch(
                "update_task_status",
                &json!({"task_id": task["id"], "done": true}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Precondition);
        assert!(err.retriable);

        bridge
            .dispatch(
                "update_test_result",
                &json!({"test_id": test["id"], "outcome": "pass", "verification_note": "seen in browser"}),
            )
            .await
            .unwrap();
        let closed = bridge
            .dispatch(
                "update_task_status",
                &json!({"task_id": task["id"], "done": true}),
            )
            .await
            .unwrap();
        assert_eq!(closed["status"], WorkStatus::Done.as_str());
    }

    #[tokio::test]
    async fn exec_runs_in_the_project_workspace() {
        let (bridge, _store, _pid, dir) = bridge_fixture(SessionKind::Coding).await;
        let out = bridge
            .dispatch("exec", &json!({"command": "echo bridged > out.txt"}))
            .await
            .unwrap();
        assert_eq!(out["exit_code"], 0);
        assert!(dir.path().join("out.txt").exists());
    }

    #[tokio::test]
    async fn exec_on_host_is_gated() {
        let (bridge, _store, _pid, _dir) = bridge_fixture(SessionKind::Coding).await;
        let err = bridge
            .dispatch("exec", &json!({"command": "sudo id"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SecurityDenied);
    }

    #[tokio::test]
    async fn oversized_input_is_rejected_with_a_bounded_error() {
        let (bridge, _store, _pid, _dir) = bridge_fixture(SessionKind::Coding).await;
        let huge = "x".repeat(INPUT_CAP + 1);
        let err = bridge
            .dispatch("log_session", &json!({"note": huge}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Precondition);
        assert!(err.message.len() < 200);
    }

    #[tokio::test]
    async fn malformed_input_is_a_precondition_error() {
        let (bridge, _store, _pid, _dir) = bridge_fixture(SessionKind::Coding).await;
        let err = bridge
            .dispatch("get_task", &json!({"task": "not-an-id"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Precondition);
    }

    #[tokio::test]
    async fn wrapup_marker_is_acknowledged() {
        let (bridge, _store, _pid, _dir) = bridge_fixture(SessionKind::Coding).await;
        assert!(bridge.knows(WRAPUP_TOOL));
        let out = bridge.dispatch(WRAPUP_TOOL, &json!({})).await.unwrap();
        assert_eq!(out["acknowledged"], true);
    }

    #[tokio::test]
    async fn unknown_entities_are_not_found() {
        let (bridge, _store, _pid, _dir) = bridge_fixture(SessionKind::Coding).await;
        let err = bridge
            .dispatch("get_task", &json!({"task_id": 424242}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
