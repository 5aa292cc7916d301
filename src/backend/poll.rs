//! File-polling backend: tasks live in the [`TaskStore`] until a periodic
//! `run-due` trigger fires them.

use async_trait::async_trait;

use super::{SchedulerBackend, SchedulingFailed};
use crate::config::BackendKind;
use crate::store::{StorageError, TaskStore};
use crate::task::{Task, TaskId};

pub struct PollBackend {
    store: TaskStore,
}

impl PollBackend {
    pub fn new(store: TaskStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SchedulerBackend for PollBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Poll
    }

    async fn submit(&self, task: Task) -> Result<Task, SchedulingFailed> {
        self.store.add(&task).await?;
        Ok(task)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, StorageError> {
        self.store.get(id).await
    }

    async fn list(&self) -> Result<Vec<Task>, StorageError> {
        self.store.list_all().await
    }

    async fn due(&self, now: i64) -> Result<Vec<Task>, StorageError> {
        self.store.list_due(now).await
    }

    async fn complete(&self, id: &TaskId) -> Result<bool, StorageError> {
        self.store.remove(id).await
    }

    async fn cancel(&self, id: &TaskId) -> Result<bool, StorageError> {
        self.store.remove(id).await
    }

    async fn clear_expired(&self, now: i64) -> Result<usize, StorageError> {
        self.store.clear_expired(now).await
    }
}
