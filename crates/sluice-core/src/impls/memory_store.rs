//! In-memory task store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{StoreError, Task, TaskId};
use crate::ports::{TaskFilter, TaskStore, scheduling_order};

/// `TaskStore` backed by a `HashMap`.
///
/// Cloning shares the underlying rows. Selection is a full scan plus sort,
/// which is fine for tests and the demo binary.
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    rows: Arc<Mutex<HashMap<TaskId, Task>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows regardless of status.
    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: Task) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&task.id) {
            return Err(StoreError::Duplicate(task.id.to_string()));
        }
        rows.insert(task.id, task);
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.rows.lock().await.get(&id).cloned())
    }

    async fn select(&self, filter: &TaskFilter, limit: usize) -> Result<Vec<Task>, StoreError> {
        let rows = self.rows.lock().await;
        let mut selected: Vec<Task> = rows.values().filter(|t| filter.matches(t)).cloned().collect();
        selected.sort_by(scheduling_order);
        selected.truncate(limit);
        Ok(selected)
    }

    async fn update(&self, task: Task) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        match rows.get_mut(&task.id) {
            Some(row) => {
                *row = task;
                Ok(())
            }
            None => Err(StoreError::NotFound(task.id.to_string())),
        }
    }

    async fn delete(&self, filter: &TaskFilter) -> Result<usize, StoreError> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|_, t| !filter.matches(t));
        Ok(before - rows.len())
    }

    async fn count(&self, filter: &TaskFilter) -> Result<usize, StoreError> {
        Ok(self.rows.lock().await.values().filter(|t| filter.matches(t)).count())
    }
}
