//! Durable hierarchical task state.
//!
//! `TaskStore` is the synchronous SQLite layer; `StoreHandle` is the
//! async-safe wrapper used everywhere else. All access runs on tokio's
//! blocking pool so SQLite I/O never ties up async worker threads, and the
//! single mutex serializes every state-changing operation — a superset of
//! the per-project serialization the consistency rules require.

pub mod db;
pub mod models;

use std::sync::Arc;

use crate::errors::StoreError;
pub use db::{StoreResult, TaskStore};
pub use models::*;

/// Async-safe handle to the task store.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<TaskStore>>,
}

impl StoreHandle {
    pub fn new(store: TaskStore) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure against the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&TaskStore) -> StoreResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| StoreError::Other(anyhow::anyhow!("store lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Other(anyhow::anyhow!("store task panicked: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxKind;

    #[tokio::test]
    async fn handle_runs_closures_on_blocking_pool() {
        let handle = StoreHandle::new(TaskStore::open_in_memory().unwrap());
        let project = handle
            .call(|db| db.create_project("demo", "/tmp/demo", None, SandboxKind::None, ""))
            .await
            .unwrap();
        let found = handle
            .call(move |db| db.get_project_by_name("demo"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, project.id);
    }
}
