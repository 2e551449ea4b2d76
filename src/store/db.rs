//! SQLite-backed task store.
//!
//! Owns the relational schema for projects, epics, tasks, tests, sessions
//! and quality checks. All multi-statement updates run inside a transaction
//! on the single connection; the `StoreHandle` wrapper serializes access, so
//! `unchecked_transaction` is safe here.

use std::path::Path;
use std::str::FromStr;

use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;
use crate::errors::StoreError;
use crate::events::TokenUsage;
use crate::sandbox::SandboxKind;

pub type StoreResult<T> = Result<T, StoreError>;

pub struct TaskStore {
    conn: Connection,
}

fn now_utc() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl TaskStore {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> StoreResult<()> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.run_migrations()
    }

    fn run_migrations(&self) -> StoreResult<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                workspace TEXT NOT NULL,
                spec_path TEXT,
                sandbox_kind TEXT NOT NULL DEFAULT 'container',
                sandbox_image TEXT NOT NULL DEFAULT '',
                completed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS epics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                ordinal INTEGER NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                epic_id INTEGER NOT NULL REFERENCES epics(id) ON DELETE CASCADE,
                ordinal INTEGER NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                started_at TEXT,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS tests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                description TEXT NOT NULL,
                outcome TEXT NOT NULL DEFAULT 'unknown',
                verification_note TEXT
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                session_number INTEGER NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                model TEXT NOT NULL,
                prompt_version TEXT NOT NULL DEFAULT '',
                started_at TEXT NOT NULL,
                ended_at TEXT,
                error_message TEXT,
                notes TEXT NOT NULL DEFAULT '',
                tool_uses INTEGER NOT NULL DEFAULT 0,
                errors INTEGER NOT NULL DEFAULT 0,
                duration_seconds REAL NOT NULL DEFAULT 0,
                tokens_input INTEGER NOT NULL DEFAULT 0,
                tokens_output INTEGER NOT NULL DEFAULT 0,
                tokens_cache_creation INTEGER NOT NULL DEFAULT 0,
                tokens_cache_read INTEGER NOT NULL DEFAULT 0,
                metrics TEXT NOT NULL DEFAULT '{}',
                UNIQUE(project_id, session_number)
            );

            CREATE TABLE IF NOT EXISTS quality_checks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                check_type TEXT NOT NULL,
                rating INTEGER NOT NULL,
                tool_uses INTEGER NOT NULL DEFAULT 0,
                errors INTEGER NOT NULL DEFAULT 0,
                browser_verifications INTEGER NOT NULL DEFAULT 0,
                critical_issues TEXT NOT NULL DEFAULT '[]',
                warnings TEXT NOT NULL DEFAULT '[]',
                review_text TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(session_id, check_type)
            );

            CREATE INDEX IF NOT EXISTS idx_epics_project ON epics(project_id, ordinal);
            CREATE INDEX IF NOT EXISTS idx_tasks_epic ON tasks(epic_id, ordinal);
            CREATE INDEX IF NOT EXISTS idx_tests_task ON tests(task_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_id, session_number);
            ",
        )?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(
        &self,
        name: &str,
        workspace: &str,
        spec_path: Option<&str>,
        sandbox_kind: SandboxKind,
        sandbox_image: &str,
    ) -> StoreResult<Project> {
        let id = uuid::Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO projects (id, name, workspace, spec_path, sandbox_kind, sandbox_image, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    name,
                    workspace,
                    spec_path,
                    sandbox_kind.as_str(),
                    sandbox_image,
                    now_utc()
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(f, _)
                    if f.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::Precondition(format!("project '{}' already exists", name))
                }
                other => StoreError::Sqlite(other),
            })?;
        self.get_project(&id)?
            .ok_or_else(|| StoreError::not_found("project", &id))
    }

    pub fn get_project(&self, id: &str) -> StoreResult<Option<Project>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, workspace, spec_path, sandbox_kind, sandbox_image, completed, created_at
                 FROM projects WHERE id = ?1",
                params![id],
                Self::decode_project,
            )
            .optional()?;
        row.transpose()
    }

    pub fn get_project_by_name(&self, name: &str) -> StoreResult<Option<Project>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, workspace, spec_path, sandbox_kind, sandbox_image, completed, created_at
                 FROM projects WHERE name = ?1",
                params![name],
                Self::decode_project,
            )
            .optional()?;
        row.transpose()
    }

    pub fn list_projects(&self) -> StoreResult<Vec<Project>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, workspace, spec_path, sandbox_kind, sandbox_image, completed, created_at
             FROM projects ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([], Self::decode_project)?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row??);
        }
        Ok(projects)
    }

    /// Delete the project row; cascades remove the whole hierarchy, the
    /// session history and attached quality checks. The workspace directory
    /// and any sandbox are the caller's to clean up.
    pub fn delete_project(&self, id: &str) -> StoreResult<bool> {
        let count = self
            .conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])?;
        Ok(count > 0)
    }

    pub fn mark_project_complete(&self, id: &str) -> StoreResult<()> {
        self.conn
            .execute("UPDATE projects SET completed = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Wipe the hierarchy and session history so the project can run a fresh
    /// initializer session. Dense numbering restarts at 0.
    pub fn reset_project(&self, id: &str) -> StoreResult<()> {
        if self.get_project(id)?.is_none() {
            return Err(StoreError::not_found("project", id));
        }
        if self.active_session(id)?.is_some() {
            return Err(StoreError::Precondition(
                "cannot reset while a session is running".into(),
            ));
        }
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM epics WHERE project_id = ?1", params![id])?;
        tx.execute("DELETE FROM sessions WHERE project_id = ?1", params![id])?;
        tx.execute("UPDATE projects SET completed = 0 WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    fn decode_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreResult<Project>> {
        let kind_str: String = row.get(4)?;
        let completed: i64 = row.get(6)?;
        Ok(match SandboxKind::from_str(&kind_str) {
            Ok(kind) => Ok(Project {
                id: row.get(0)?,
                name: row.get(1)?,
                workspace: row.get(2)?,
                spec_path: row.get(3)?,
                sandbox_kind: kind,
                sandbox_image: row.get(5)?,
                completed: completed != 0,
                created_at: row.get(7)?,
            }),
            Err(e) => Err(StoreError::Precondition(format!(
                "corrupt sandbox_kind in database: {}",
                e
            ))),
        })
    }

    // ── Epics ─────────────────────────────────────────────────────────

    pub fn create_epic(
        &self,
        project_id: &str,
        ordinal: i64,
        title: &str,
        description: &str,
    ) -> StoreResult<Epic> {
        if self.get_project(project_id)?.is_none() {
            return Err(StoreError::not_found("project", project_id));
        }
        self.conn.execute(
            "INSERT INTO epics (project_id, ordinal, title, description) VALUES (?1, ?2, ?3, ?4)",
            params![project_id, ordinal, title, description],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_epic(id)?
            .ok_or_else(|| StoreError::not_found("epic", id))
    }

    pub fn get_epic(&self, id: i64) -> StoreResult<Option<Epic>> {
        let base = self
            .conn
            .query_row(
                "SELECT id, project_id, ordinal, title, description FROM epics WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, project_id, ordinal, title, description)) = base else {
            return Ok(None);
        };
        let status = self.epic_status(id)?;
        Ok(Some(Epic {
            id,
            project_id,
            ordinal,
            title,
            description,
            status,
        }))
    }

    pub fn list_epics(&self, project_id: &str) -> StoreResult<Vec<Epic>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, ordinal, title, description
             FROM epics WHERE project_id = ?1 ORDER BY ordinal, id",
        )?;
        let rows = stmt.query_map(params![project_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut epics = Vec::new();
        for row in rows {
            let (id, project_id, ordinal, title, description) = row?;
            let status = self.epic_status(id)?;
            epics.push(Epic {
                id,
                project_id,
                ordinal,
                title,
                description,
                status,
            });
        }
        Ok(epics)
    }

    /// Epic status is derived, never stored: done iff every child task is
    /// done (and at least one exists), in_progress once any task has moved.
    fn epic_status(&self, epic_id: i64) -> StoreResult<WorkStatus> {
        let (total, done, moved): (i64, i64, i64) = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(status = 'done'), 0),
                    COALESCE(SUM(status != 'pending'), 0)
             FROM tasks WHERE epic_id = ?1",
            params![epic_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(if total > 0 && done == total {
            WorkStatus::Done
        } else if moved > 0 {
            WorkStatus::InProgress
        } else {
            WorkStatus::Pending
        })
    }

    pub fn project_of_epic(&self, epic_id: i64) -> StoreResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT project_id FROM epics WHERE id = ?1",
                params![epic_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub fn create_task(
        &self,
        epic_id: i64,
        ordinal: i64,
        title: &str,
        description: &str,
    ) -> StoreResult<Task> {
        if self.project_of_epic(epic_id)?.is_none() {
            return Err(StoreError::not_found("epic", epic_id));
        }
        self.conn.execute(
            "INSERT INTO tasks (epic_id, ordinal, title, description) VALUES (?1, ?2, ?3, ?4)",
            params![epic_id, ordinal, title, description],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_task(id)?
            .ok_or_else(|| StoreError::not_found("task", id))
    }

    pub fn get_task(&self, id: i64) -> StoreResult<Option<Task>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, epic_id, ordinal, title, description, status, started_at, completed_at
                 FROM tasks WHERE id = ?1",
                params![id],
                Self::decode_task,
            )
            .optional()?;
        row.transpose()
    }

    pub fn list_tasks(&self, epic_id: i64) -> StoreResult<Vec<Task>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, epic_id, ordinal, title, description, status, started_at, completed_at
             FROM tasks WHERE epic_id = ?1 ORDER BY ordinal, id",
        )?;
        let rows = stmt.query_map(params![epic_id], Self::decode_task)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row??);
        }
        Ok(tasks)
    }

    fn decode_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreResult<Task>> {
        let status_str: String = row.get(5)?;
        Ok(match WorkStatus::from_str(&status_str) {
            Ok(status) => Ok(Task {
                id: row.get(0)?,
                epic_id: row.get(1)?,
                ordinal: row.get(2)?,
                title: row.get(3)?,
                description: row.get(4)?,
                status,
                started_at: row.get(6)?,
                completed_at: row.get(7)?,
            }),
            Err(e) => Err(StoreError::Precondition(format!(
                "corrupt task status in database: {}",
                e
            ))),
        })
    }

    pub fn project_of_task(&self, task_id: i64) -> StoreResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT e.project_id FROM tasks t JOIN epics e ON t.epic_id = e.id WHERE t.id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Mark a pending task in_progress and stamp `started_at`. Idempotent
    /// for tasks already started; closed tasks are left untouched.
    pub fn start_task(&self, task_id: i64) -> StoreResult<Task> {
        let task = self
            .get_task(task_id)?
            .ok_or_else(|| StoreError::not_found("task", task_id))?;
        if task.status == WorkStatus::Pending {
            self.conn.execute(
                "UPDATE tasks SET status = 'in_progress', started_at = ?1 WHERE id = ?2",
                params![now_utc(), task_id],
            )?;
        }
        self.get_task(task_id)?
            .ok_or_else(|| StoreError::not_found("task", task_id))
    }

    /// Close or re-open a task. Closing requires every child test to be
    /// passing; callers that try otherwise get a precondition error.
    pub fn update_task_status(&self, task_id: i64, done: bool) -> StoreResult<Task> {
        let task = self
            .get_task(task_id)?
            .ok_or_else(|| StoreError::not_found("task", task_id))?;

        let tx = self.conn.unchecked_transaction()?;
        if done {
            let (total, passing): (i64, i64) = tx.query_row(
                "SELECT COUNT(*), COALESCE(SUM(outcome = 'pass'), 0)
                 FROM tests WHERE task_id = ?1",
                params![task_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            if passing < total {
                return Err(StoreError::Precondition(format!(
                    "task {} has {} of {} tests not passing",
                    task_id,
                    total - passing,
                    total
                )));
            }
            tx.execute(
                "UPDATE tasks SET status = 'done',
                        started_at = COALESCE(started_at, ?1),
                        completed_at = ?1
                 WHERE id = ?2",
                params![now_utc(), task_id],
            )?;
        } else {
            let reopened = if task.started_at.is_some() {
                WorkStatus::InProgress
            } else {
                WorkStatus::Pending
            };
            tx.execute(
                "UPDATE tasks SET status = ?1, completed_at = NULL WHERE id = ?2",
                params![reopened.as_str(), task_id],
            )?;
        }
        tx.commit()?;
        self.get_task(task_id)?
            .ok_or_else(|| StoreError::not_found("task", task_id))
    }

    /// The lowest-ordinal non-done task from the lowest-ordinal epic that
    /// still has open work; ties broken by creation order.
    pub fn get_next_task(&self, project_id: &str) -> StoreResult<Option<Task>> {
        let row = self
            .conn
            .query_row(
                "SELECT t.id, t.epic_id, t.ordinal, t.title, t.description, t.status, t.started_at, t.completed_at
                 FROM tasks t
                 JOIN epics e ON t.epic_id = e.id
                 WHERE e.project_id = ?1 AND t.status != 'done'
                 ORDER BY e.ordinal, e.id, t.ordinal, t.id
                 LIMIT 1",
                params![project_id],
                Self::decode_task,
            )
            .optional()?;
        row.transpose()
    }

    // ── Tests ─────────────────────────────────────────────────────────

    pub fn create_test(&self, task_id: i64, description: &str) -> StoreResult<TestCase> {
        if self.project_of_task(task_id)?.is_none() {
            return Err(StoreError::not_found("task", task_id));
        }
        self.conn.execute(
            "INSERT INTO tests (task_id, description) VALUES (?1, ?2)",
            params![task_id, description],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_test(id)?
            .ok_or_else(|| StoreError::not_found("test", id))
    }

    pub fn get_test(&self, id: i64) -> StoreResult<Option<TestCase>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, task_id, description, outcome, verification_note FROM tests WHERE id = ?1",
                params![id],
                Self::decode_test,
            )
            .optional()?;
        row.transpose()
    }

    pub fn list_tests(&self, task_id: i64) -> StoreResult<Vec<TestCase>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, task_id, description, outcome, verification_note
             FROM tests WHERE task_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![task_id], Self::decode_test)?;
        let mut tests = Vec::new();
        for row in rows {
            tests.push(row??);
        }
        Ok(tests)
    }

    fn decode_test(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreResult<TestCase>> {
        let outcome_str: String = row.get(3)?;
        Ok(match TestOutcome::from_str(&outcome_str) {
            Ok(outcome) => Ok(TestCase {
                id: row.get(0)?,
                task_id: row.get(1)?,
                description: row.get(2)?,
                outcome,
                verification_note: row.get(4)?,
            }),
            Err(e) => Err(StoreError::Precondition(format!(
                "corrupt test outcome in database: {}",
                e
            ))),
        })
    }

    pub fn project_of_test(&self, test_id: i64) -> StoreResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT e.project_id FROM tests x
                 JOIN tasks t ON x.task_id = t.id
                 JOIN epics e ON t.epic_id = e.id
                 WHERE x.id = ?1",
                params![test_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Record a test outcome. When the outcome leaves `pass` and the parent
    /// task was closed, the task re-opens in the same transaction.
    pub fn update_test_result(
        &self,
        test_id: i64,
        outcome: TestOutcome,
        note: Option<&str>,
    ) -> StoreResult<TestCase> {
        let test = self
            .get_test(test_id)?
            .ok_or_else(|| StoreError::not_found("test", test_id))?;

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE tests SET outcome = ?1,
                    verification_note = COALESCE(?2, verification_note)
             WHERE id = ?3",
            params![outcome.as_str(), note, test_id],
        )?;
        if outcome != TestOutcome::Pass {
            let (status_str, started_at): (String, Option<String>) = tx.query_row(
                "SELECT status, started_at FROM tasks WHERE id = ?1",
                params![test.task_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            if status_str == "done" {
                let reopened = if started_at.is_some() {
                    WorkStatus::InProgress
                } else {
                    WorkStatus::Pending
                };
                tx.execute(
                    "UPDATE tasks SET status = ?1, completed_at = NULL WHERE id = ?2",
                    params![reopened.as_str(), test.task_id],
                )?;
            }
        }
        tx.commit()?;
        self.get_test(test_id)?
            .ok_or_else(|| StoreError::not_found("test", test_id))
    }

    // ── Progress view ─────────────────────────────────────────────────

    pub fn progress(&self, project_id: &str) -> StoreResult<Progress> {
        let total_epics: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM epics WHERE project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )?;
        let completed_epics: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM epics e
             WHERE e.project_id = ?1
               AND EXISTS (SELECT 1 FROM tasks t WHERE t.epic_id = e.id)
               AND NOT EXISTS (SELECT 1 FROM tasks t WHERE t.epic_id = e.id AND t.status != 'done')",
            params![project_id],
            |row| row.get(0),
        )?;
        let (total_tasks, completed_tasks): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(t.status = 'done'), 0)
             FROM tasks t JOIN epics e ON t.epic_id = e.id
             WHERE e.project_id = ?1",
            params![project_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let (total_tests, passed_tests): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(x.outcome = 'pass'), 0)
             FROM tests x
             JOIN tasks t ON x.task_id = t.id
             JOIN epics e ON t.epic_id = e.id
             WHERE e.project_id = ?1",
            params![project_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(Progress {
            total_epics: total_epics as u64,
            completed_epics: completed_epics as u64,
            total_tasks: total_tasks as u64,
            completed_tasks: completed_tasks as u64,
            total_tests: total_tests as u64,
            passed_tests: passed_tests as u64,
        })
    }

    /// Per-epic (title, total tasks, tasks with at least one test), for the
    /// post-initialization coverage report.
    pub fn epic_coverage(&self, project_id: &str) -> StoreResult<Vec<(String, u64, u64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT e.title,
                    COUNT(t.id),
                    COALESCE(SUM(EXISTS (SELECT 1 FROM tests x WHERE x.task_id = t.id)), 0)
             FROM epics e LEFT JOIN tasks t ON t.epic_id = e.id
             WHERE e.project_id = ?1
             GROUP BY e.id
             ORDER BY e.ordinal, e.id",
        )?;
        let rows = stmt.query_map(params![project_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)? as u64,
                row.get::<_, i64>(2)? as u64,
            ))
        })?;
        let mut coverage = Vec::new();
        for row in rows {
            coverage.push(row?);
        }
        Ok(coverage)
    }

    // ── Sessions ──────────────────────────────────────────────────────

    /// Allocate the next dense session number and open the session.
    ///
    /// Session 0 must be (and only session 0 may be) the initializer; at
    /// most one session per project may be running.
    pub fn create_session(
        &self,
        project_id: &str,
        kind: SessionKind,
        model: &str,
        prompt_version: &str,
    ) -> StoreResult<Session> {
        if self.get_project(project_id)?.is_none() {
            return Err(StoreError::not_found("project", project_id));
        }
        let tx = self.conn.unchecked_transaction()?;
        if let Some(active) = Self::active_session_tx(&tx, project_id)? {
            return Err(StoreError::Precondition(format!(
                "session {} is already running for this project",
                active
            )));
        }
        let next: i64 = tx.query_row(
            "SELECT COALESCE(MAX(session_number), -1) + 1 FROM sessions WHERE project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )?;
        if next == 0 && kind != SessionKind::Initializer {
            return Err(StoreError::Precondition(
                "session 0 must be the initializer".into(),
            ));
        }
        if next > 0 && kind == SessionKind::Initializer {
            return Err(StoreError::Precondition(format!(
                "project already initialized; session {} cannot be an initializer",
                next
            )));
        }
        tx.execute(
            "INSERT INTO sessions (project_id, session_number, kind, model, prompt_version, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                project_id,
                next,
                kind.as_str(),
                model,
                prompt_version,
                now_utc()
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        self.get_session(id)?
            .ok_or_else(|| StoreError::not_found("session", id))
    }

    fn active_session_tx(
        conn: &rusqlite::Connection,
        project_id: &str,
    ) -> rusqlite::Result<Option<i64>> {
        conn.query_row(
            "SELECT session_number FROM sessions WHERE project_id = ?1 AND status = 'running'",
            params![project_id],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn get_session(&self, id: i64) -> StoreResult<Option<Session>> {
        let row = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", Self::SESSION_SELECT),
                params![id],
                Self::decode_session,
            )
            .optional()?;
        row.transpose()
    }

    pub fn active_session(&self, project_id: &str) -> StoreResult<Option<Session>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "{} WHERE project_id = ?1 AND status = 'running'",
                    Self::SESSION_SELECT
                ),
                params![project_id],
                Self::decode_session,
            )
            .optional()?;
        row.transpose()
    }

    pub fn session_history(&self, project_id: &str) -> StoreResult<Vec<Session>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE project_id = ?1 ORDER BY session_number",
            Self::SESSION_SELECT
        ))?;
        let rows = stmt.query_map(params![project_id], Self::decode_session)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row??);
        }
        Ok(sessions)
    }

    const SESSION_SELECT: &'static str = "SELECT id, project_id, session_number, kind, status, model, prompt_version,
                started_at, ended_at, error_message, tool_uses, errors, duration_seconds,
                tokens_input, tokens_output, tokens_cache_creation, tokens_cache_read, metrics
         FROM sessions";

    fn decode_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreResult<Session>> {
        let kind_str: String = row.get(3)?;
        let status_str: String = row.get(4)?;
        let metrics_str: String = row.get(17)?;
        Ok((|| {
            let kind = SessionKind::from_str(&kind_str)
                .map_err(|e| StoreError::Precondition(format!("corrupt session kind: {}", e)))?;
            let status = SessionStatus::from_str(&status_str)
                .map_err(|e| StoreError::Precondition(format!("corrupt session status: {}", e)))?;
            let metrics = serde_json::from_str(&metrics_str)
                .map_err(|e| StoreError::Other(anyhow::anyhow!("corrupt metrics JSON: {}", e)))?;
            Ok(Session {
                id: row.get(0)?,
                project_id: row.get(1)?,
                session_number: row.get(2)?,
                kind,
                status,
                model: row.get(5)?,
                prompt_version: row.get(6)?,
                started_at: row.get(7)?,
                ended_at: row.get(8)?,
                error_message: row.get(9)?,
                counters: SessionCounters {
                    tool_uses: row.get::<_, i64>(10)? as u64,
                    errors: row.get::<_, i64>(11)? as u64,
                    duration_seconds: row.get(12)?,
                },
                tokens: TokenUsage {
                    input: row.get::<_, i64>(13)? as u64,
                    output: row.get::<_, i64>(14)? as u64,
                    cache_creation: row.get::<_, i64>(15)? as u64,
                    cache_read: row.get::<_, i64>(16)? as u64,
                },
                metrics,
            })
        })())
    }

    /// Terminal transition. A session can be finalized exactly once; any
    /// further mutation attempt fails with a precondition error.
    pub fn finalize_session(
        &self,
        session_id: i64,
        status: SessionStatus,
        counters: SessionCounters,
        tokens: TokenUsage,
        error_message: Option<&str>,
        metrics: &serde_json::Value,
    ) -> StoreResult<Session> {
        if !status.is_terminal() {
            return Err(StoreError::Precondition(format!(
                "'{}' is not a terminal session status",
                status
            )));
        }
        let updated = self.conn.execute(
            "UPDATE sessions SET status = ?1, ended_at = ?2, error_message = ?3,
                    tool_uses = ?4, errors = ?5, duration_seconds = ?6,
                    tokens_input = ?7, tokens_output = ?8,
                    tokens_cache_creation = ?9, tokens_cache_read = ?10,
                    metrics = ?11
             WHERE id = ?12 AND status = 'running'",
            params![
                status.as_str(),
                now_utc(),
                error_message,
                counters.tool_uses as i64,
                counters.errors as i64,
                counters.duration_seconds,
                tokens.input as i64,
                tokens.output as i64,
                tokens.cache_creation as i64,
                tokens.cache_read as i64,
                serde_json::to_string(metrics)
                    .map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?,
                session_id
            ],
        )?;
        if updated == 0 {
            return match self.get_session(session_id)? {
                None => Err(StoreError::not_found("session", session_id)),
                Some(s) => Err(StoreError::Precondition(format!(
                    "session {} already finalized as {}",
                    session_id, s.status
                ))),
            };
        }
        self.get_session(session_id)?
            .ok_or_else(|| StoreError::not_found("session", session_id))
    }

    /// Append an agent note to a running session.
    pub fn append_session_note(&self, session_id: i64, note: &str) -> StoreResult<()> {
        let updated = self.conn.execute(
            "UPDATE sessions SET notes = notes || ?1 || char(10)
             WHERE id = ?2 AND status = 'running'",
            params![note, session_id],
        )?;
        if updated == 0 {
            return match self.get_session(session_id)? {
                None => Err(StoreError::not_found("session", session_id)),
                Some(_) => Err(StoreError::Precondition(
                    "cannot add notes to a finalized session".into(),
                )),
            };
        }
        Ok(())
    }

    /// Startup reconciliation: any session still marked running belongs to
    /// a dead orchestrator and is closed as cancelled.
    pub fn cleanup_stale_sessions(&self) -> StoreResult<usize> {
        let count = self.conn.execute(
            "UPDATE sessions SET status = 'cancelled', ended_at = ?1,
                    error_message = 'reconciled at startup'
             WHERE status = 'running'",
            params![now_utc()],
        )?;
        Ok(count)
    }

    // ── Quality checks ────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn attach_quality_check(
        &self,
        session_id: i64,
        check_type: CheckType,
        rating: i64,
        tool_uses: u64,
        errors: u64,
        browser_verifications: u64,
        critical_issues: &[QualityIssue],
        warnings: &[QualityIssue],
        review_text: Option<&str>,
    ) -> StoreResult<QualityCheck> {
        if self.get_session(session_id)?.is_none() {
            return Err(StoreError::not_found("session", session_id));
        }
        if !(1..=10).contains(&rating) {
            return Err(StoreError::Precondition(format!(
                "rating {} outside 1..=10",
                rating
            )));
        }
        let critical_json =
            serde_json::to_string(critical_issues).map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?;
        let warnings_json =
            serde_json::to_string(warnings).map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?;
        self.conn.execute(
            "INSERT INTO quality_checks
                (session_id, check_type, rating, tool_uses, errors, browser_verifications,
                 critical_issues, warnings, review_text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(session_id, check_type) DO UPDATE SET
                rating = excluded.rating,
                tool_uses = excluded.tool_uses,
                errors = excluded.errors,
                browser_verifications = excluded.browser_verifications,
                critical_issues = excluded.critical_issues,
                warnings = excluded.warnings,
                review_text = excluded.review_text",
            params![
                session_id,
                check_type.as_str(),
                rating,
                tool_uses as i64,
                errors as i64,
                browser_verifications as i64,
                critical_json,
                warnings_json,
                review_text,
                now_utc()
            ],
        )?;
        self.get_quality_check(session_id, check_type)?
            .ok_or_else(|| StoreError::not_found("quality_check", session_id))
    }

    pub fn get_quality_check(
        &self,
        session_id: i64,
        check_type: CheckType,
    ) -> StoreResult<Option<QualityCheck>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, session_id, check_type, rating, tool_uses, errors, browser_verifications,
                        critical_issues, warnings, review_text, created_at
                 FROM quality_checks WHERE session_id = ?1 AND check_type = ?2",
                params![session_id, check_type.as_str()],
                Self::decode_quality_check,
            )
            .optional()?;
        row.transpose()
    }

    fn decode_quality_check(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreResult<QualityCheck>> {
        let check_type_str: String = row.get(2)?;
        let critical_str: String = row.get(7)?;
        let warnings_str: String = row.get(8)?;
        Ok((|| {
            let check_type = CheckType::from_str(&check_type_str)
                .map_err(|e| StoreError::Precondition(format!("corrupt check type: {}", e)))?;
            let critical_issues: Vec<QualityIssue> = serde_json::from_str(&critical_str)
                .map_err(|e| StoreError::Other(anyhow::anyhow!("corrupt issue JSON: {}", e)))?;
            let warnings: Vec<QualityIssue> = serde_json::from_str(&warnings_str)
                .map_err(|e| StoreError::Other(anyhow::anyhow!("corrupt issue JSON: {}", e)))?;
            Ok(QualityCheck {
                id: row.get(0)?,
                session_id: row.get(1)?,
                check_type,
                rating: row.get(3)?,
                tool_uses: row.get::<_, i64>(4)? as u64,
                errors: row.get::<_, i64>(5)? as u64,
                browser_verifications: row.get::<_, i64>(6)? as u64,
                critical_issues,
                warnings,
                review_text: row.get(9)?,
                created_at: row.get(10)?,
            })
        })())
    }

    /// (session_number, quick rating) pairs ordered by session number.
    pub fn quality_trend(&self, project_id: &str) -> StoreResult<Vec<(i64, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.session_number, q.rating
             FROM quality_checks q JOIN sessions s ON q.session_id = s.id
             WHERE s.project_id = ?1 AND q.check_type = 'quick'
             ORDER BY s.session_number",
        )?;
        let rows = stmt.query_map(params![project_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut trend = Vec::new();
        for row in rows {
            trend.push(row?);
        }
        Ok(trend)
    }

    /// Highest session number with a deep review, if any.
    pub fn last_deep_review(&self, project_id: &str) -> StoreResult<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT MAX(s.session_number)
                 FROM quality_checks q JOIN sessions s ON q.session_id = s.id
                 WHERE s.project_id = ?1 AND q.check_type = 'deep'",
                params![project_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten())
    }
}
