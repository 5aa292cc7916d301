use std::sync::Arc;

use super::{AtBackend, AtQueue, PollBackend, SchedulerBackend};
use crate::config::{BackendKind, Config};
use crate::store::{StorageError, TaskStore};
use crate::task::{Task, TaskId};

/// Every backend that may hold tasks, plus the one new tasks go to.
///
/// Lookups search all registered backends so tasks queued before a
/// `SCHEDULER_BACKEND` change can still fire, be listed and be cancelled.
pub struct BackendRegistry {
    backends: Vec<Arc<dyn SchedulerBackend>>,
    default_backend: BackendKind,
}

impl BackendRegistry {
    pub fn new(default_backend: BackendKind) -> Self {
        Self {
            backends: Vec::new(),
            default_backend,
        }
    }

    /// Both stock backends, defaulting to the configured one.
    pub fn from_config(config: &Config) -> Self {
        let program = std::env::current_exe()
            .unwrap_or_else(|_| std::path::PathBuf::from("tmux-orchestrator"));
        let mut registry = Self::new(config.backend);
        registry.register(Arc::new(PollBackend::new(TaskStore::new(config))));
        registry.register(Arc::new(AtBackend::new(
            config,
            Arc::new(AtQueue::new(config.process_timeout)),
            program,
        )));
        registry
    }

    /// Add a backend, replacing any registered backend of the same kind.
    pub fn register(&mut self, backend: Arc<dyn SchedulerBackend>) {
        self.backends.retain(|b| b.kind() != backend.kind());
        self.backends.push(backend);
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn SchedulerBackend>> {
        self.backends.iter().find(|b| b.kind() == kind).cloned()
    }

    pub fn default_backend(&self) -> Option<Arc<dyn SchedulerBackend>> {
        self.get(self.default_backend)
            .or_else(|| self.backends.first().cloned())
    }

    /// The backend holding `id`, with the task.
    pub async fn locate(
        &self,
        id: &TaskId,
    ) -> Result<Option<(Arc<dyn SchedulerBackend>, Task)>, StorageError> {
        for backend in &self.backends {
            if let Some(task) = backend.get(id).await? {
                return Ok(Some((backend.clone(), task)));
            }
        }
        Ok(None)
    }

    /// Tasks from every backend, soonest first.
    pub async fn list(&self) -> Result<Vec<(BackendKind, Task)>, StorageError> {
        let mut all = Vec::new();
        for backend in &self.backends {
            all.extend(backend.list().await?.into_iter().map(|t| (backend.kind(), t)));
        }
        all.sort_by_key(|(_, t)| t.due_at());
        Ok(all)
    }

    /// Due tasks the caller must fire, with the backend that owns each.
    pub async fn due(
        &self,
        now: i64,
    ) -> Result<Vec<(Arc<dyn SchedulerBackend>, Task)>, StorageError> {
        let mut due = Vec::new();
        for backend in &self.backends {
            due.extend(backend.due(now).await?.into_iter().map(|t| (backend.clone(), t)));
        }
        due.sort_by_key(|(_, t)| t.due_at());
        Ok(due)
    }

    pub async fn clear_expired(&self, now: i64) -> Result<usize, StorageError> {
        let mut removed = 0;
        for backend in &self.backends {
            removed += backend.clear_expired(now).await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::at::testing::FakeQueue;
    use crate::task::TaskKind;

    fn registry(dir: &std::path::Path, default: BackendKind) -> BackendRegistry {
        let mut config = Config::with_home(dir);
        config.backend = default;
        let mut registry = BackendRegistry::new(default);
        registry.register(Arc::new(PollBackend::new(TaskStore::new(&config))));
        registry.register(Arc::new(AtBackend::new(
            &config,
            Arc::new(FakeQueue::default()),
            "/bin/true",
        )));
        registry
    }

    #[tokio::test]
    async fn lookups_span_all_backends() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = registry(temp.path(), BackendKind::At);
        assert_eq!(registry.default_backend().expect("default").kind(), BackendKind::At);

        let now = 1_736_937_000;
        let queued = registry
            .get(BackendKind::At)
            .expect("at")
            .submit(Task::new("queued", TaskKind::Log, now, now + 600, None).expect("task"))
            .await
            .expect("submit");
        let polled = registry
            .get(BackendKind::Poll)
            .expect("poll")
            .submit(Task::new("polled", TaskKind::Log, now, now + 60, None).expect("task"))
            .await
            .expect("submit");

        let listed: Vec<_> = registry
            .list()
            .await
            .expect("list")
            .into_iter()
            .map(|(kind, t)| (kind, t.note().to_string()))
            .collect();
        assert_eq!(
            listed,
            vec![
                (BackendKind::Poll, "polled".to_string()),
                (BackendKind::At, "queued".to_string())
            ]
        );

        let (owner, found) = registry.locate(queued.id()).await.expect("locate").expect("found");
        assert_eq!(owner.kind(), BackendKind::At);
        assert_eq!(found, queued);

        // Only the polling backend hands out due work.
        let due = registry.due(now + 3600).await.expect("due");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1, polled);
    }

    #[test]
    fn register_replaces_same_kind() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = Config::with_home(temp.path());
        let mut registry = BackendRegistry::new(BackendKind::Poll);
        registry.register(Arc::new(PollBackend::new(TaskStore::new(&config))));
        registry.register(Arc::new(PollBackend::new(TaskStore::new(&config))));
        assert_eq!(registry.backends.len(), 1);
        assert!(registry.get(BackendKind::At).is_none());
    }
}
