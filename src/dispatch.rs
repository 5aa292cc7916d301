//! Performs a task's side effect when it fires.
//!
//! Every fire ends with the task's durable record removed, whether or not the
//! action succeeded, so a failing task cannot re-fire forever. Failures are
//! audited as `error` instead of `fired`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::audit::{AuditEvent, AuditLog};
use crate::backend::SchedulerBackend;
use crate::config::Config;
use crate::store::StorageError;
use crate::task::{format_local, Task, TaskKind};
use crate::tmux::{Multiplexer, MuxError};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to deliver note: {0}")]
    Delivery(#[from] MuxError),

    #[error("Failed to remove fired task: {0}")]
    Cleanup(#[from] StorageError),
}

/// A user-visible notification mechanism.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, body: &str) -> Result<(), String>;
}

/// Desktop notifications through `notify-send`.
#[derive(Debug, Clone)]
pub struct DesktopNotifier {
    timeout: Duration,
}

impl DesktopNotifier {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Notifier for DesktopNotifier {
    async fn notify(&self, title: &str, body: &str) -> Result<(), String> {
        let status = tokio::time::timeout(
            self.timeout,
            Command::new("notify-send")
                .arg(title)
                .arg(body)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status(),
        )
        .await;
        match status {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(format!("notify-send exited with {}", status)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err("no notification mechanism available".to_string())
            }
            Ok(Err(e)) => Err(format!("failed to run notify-send: {}", e)),
            Err(_) => Err(format!(
                "notify-send timed out after {} seconds",
                self.timeout.as_secs()
            )),
        }
    }
}

pub struct Dispatcher {
    notes_dir: PathBuf,
    log_path: PathBuf,
    audit: AuditLog,
    notifier: Arc<dyn Notifier>,
    mux: Arc<dyn Multiplexer>,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        audit: AuditLog,
        notifier: Arc<dyn Notifier>,
        mux: Arc<dyn Multiplexer>,
    ) -> Self {
        Self {
            notes_dir: config.notes_dir(),
            log_path: config.dispatch_log_path(),
            audit,
            notifier,
            mux,
        }
    }

    /// Run the action for `task`, then remove it from `backend`.
    pub async fn fire(
        &self,
        task: &Task,
        backend: &dyn SchedulerBackend,
    ) -> Result<(), DispatchError> {
        let mut outcome = self.perform(task).await;
        if outcome.is_ok() {
            if let Some(target) = task.target() {
                outcome = self.deliver(target, task.note()).await;
            }
        }

        // The record goes regardless of the outcome.
        if let Err(e) = backend.complete(task.id()).await {
            self.audit
                .record(
                    AuditEvent::Error,
                    task.kind().as_str(),
                    format!("task {} fired but its record was not removed: {}", task.id(), e),
                )
                .await;
            return Err(e.into());
        }

        match outcome {
            Ok(()) => {
                self.audit
                    .record(
                        AuditEvent::Fired,
                        task.kind().as_str(),
                        format!("task {}: {}", task.id(), task.note()),
                    )
                    .await;
                Ok(())
            }
            Err(e) => {
                self.audit
                    .record(
                        AuditEvent::Error,
                        task.kind().as_str(),
                        format!("task {} failed to fire: {}", task.id(), e),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn perform(&self, task: &Task) -> Result<(), DispatchError> {
        match task.kind() {
            TaskKind::File => {
                tokio::fs::create_dir_all(&self.notes_dir)
                    .await
                    .map_err(|e| write_error(&self.notes_dir, e))?;
                let path = self.notes_dir.join(format!("{}.txt", task.id()));
                let body = format!(
                    "Reminder: {}\nScheduled: {}\nDue: {}\nFired: {}\n",
                    task.note(),
                    format_local(task.created_at()),
                    task.due_at_human(),
                    Local::now().format("%Y-%m-%d %H:%M:%S"),
                );
                tokio::fs::write(&path, body)
                    .await
                    .map_err(|e| write_error(&path, e))?;
                self.append_log(task).await
            }
            TaskKind::Log => self.append_log(task).await,
            TaskKind::Display => {
                if let Err(reason) = self.notifier.notify("Reminder", task.note()).await {
                    tracing::warn!(task = %task.id(), %reason, "Notification failed, logging instead");
                    return self.append_log(task).await;
                }
                Ok(())
            }
        }
    }

    async fn deliver(&self, target: &str, note: &str) -> Result<(), DispatchError> {
        self.mux.send(target, note).await?;
        self.mux.submit(target).await?;
        Ok(())
    }

    async fn append_log(&self, task: &Task) -> Result<(), DispatchError> {
        let line = format!(
            "[{}] REMINDER {} ({}): {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            task.id(),
            task.kind(),
            task.note()
        );
        if let Some(parent) = self.log_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| write_error(parent, e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await
            .map_err(|e| write_error(&self.log_path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| write_error(&self.log_path, e))
    }
}

fn write_error(path: &Path, source: std::io::Error) -> DispatchError {
    DispatchError::Write {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    pub struct FakeNotifier {
        pub shown: Mutex<Vec<String>>,
        pub unavailable: bool,
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn notify(&self, _title: &str, body: &str) -> Result<(), String> {
            if self.unavailable {
                return Err("no notification mechanism available".to_string());
            }
            self.shown.lock().expect("lock").push(body.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeNotifier;
    use super::*;
    use crate::backend::PollBackend;
    use crate::store::TaskStore;
    use crate::tmux::testing::FakeMux;

    struct Harness {
        config: Config,
        backend: PollBackend,
        audit: AuditLog,
    }

    fn harness(dir: &Path) -> Harness {
        let config = Config::with_home(dir);
        Harness {
            backend: PollBackend::new(TaskStore::new(&config)),
            audit: AuditLog::new(&config),
            config,
        }
    }

    fn dispatcher(h: &Harness, notifier: Arc<FakeNotifier>, mux: Arc<FakeMux>) -> Dispatcher {
        Dispatcher::new(&h.config, h.audit.clone(), notifier, mux)
    }

    async fn stored(h: &Harness, note: &str, kind: TaskKind, target: Option<&str>) -> Task {
        let task = Task::new(note, kind, 1_000, 1_060, target.map(str::to_string)).expect("task");
        h.backend.submit(task).await.expect("submit")
    }

    #[tokio::test]
    async fn file_kind_writes_note_file_and_removes_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let h = harness(temp.path());
        let d = dispatcher(&h, Arc::default(), Arc::default());
        let task = stored(&h, "Check deployment status", TaskKind::File, None).await;

        d.fire(&task, &h.backend).await.expect("fire");

        let note = std::fs::read_to_string(h.config.notes_dir().join(format!("{}.txt", task.id())))
            .expect("note file");
        assert!(note.contains("Check deployment status"));
        let log = std::fs::read_to_string(h.config.dispatch_log_path()).expect("log");
        assert!(log.contains("Check deployment status"));
        assert!(h.backend.get(task.id()).await.expect("get").is_none());

        let records = h.audit.records().await;
        assert_eq!(records.last().map(|r| r.event_type), Some(AuditEvent::Fired));
    }

    #[tokio::test]
    async fn display_falls_back_to_log_when_notifier_unavailable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let h = harness(temp.path());
        let notifier = Arc::new(FakeNotifier {
            unavailable: true,
            ..Default::default()
        });
        let d = dispatcher(&h, notifier, Arc::default());
        let task = stored(&h, "stretch", TaskKind::Display, None).await;

        d.fire(&task, &h.backend).await.expect("display failure is swallowed");
        let log = std::fs::read_to_string(h.config.dispatch_log_path()).expect("log");
        assert!(log.contains("stretch"));
    }

    #[tokio::test]
    async fn display_does_not_log_when_shown() {
        let temp = tempfile::tempdir().expect("tempdir");
        let h = harness(temp.path());
        let notifier = Arc::new(FakeNotifier::default());
        let d = dispatcher(&h, notifier.clone(), Arc::default());
        let task = stored(&h, "stand up", TaskKind::Display, None).await;

        d.fire(&task, &h.backend).await.expect("fire");
        assert_eq!(notifier.shown.lock().expect("lock").clone(), vec!["stand up"]);
        assert!(!h.config.dispatch_log_path().exists());
    }

    #[tokio::test]
    async fn target_receives_note_then_enter() {
        let temp = tempfile::tempdir().expect("tempdir");
        let h = harness(temp.path());
        let mux = Arc::new(FakeMux::with_sessions(&["agents"]));
        let d = dispatcher(&h, Arc::default(), mux.clone());
        let task = stored(&h, "rebase onto main", TaskKind::Log, Some("agents:1")).await;

        d.fire(&task, &h.backend).await.expect("fire");
        assert_eq!(
            mux.sent(),
            vec![
                ("agents:1".to_string(), "rebase onto main".to_string()),
                ("agents:1".to_string(), "<Enter>".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn failed_delivery_is_audited_and_record_still_removed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let h = harness(temp.path());
        let mux = Arc::new(FakeMux {
            fail_delivery: true,
            ..Default::default()
        });
        let d = dispatcher(&h, Arc::default(), mux);
        let task = stored(&h, "ping", TaskKind::Log, Some("agents:1")).await;

        let err = d.fire(&task, &h.backend).await.unwrap_err();
        assert!(matches!(err, DispatchError::Delivery(_)));
        assert!(h.backend.get(task.id()).await.expect("get").is_none());

        let records = h.audit.records().await;
        let last = records.last().expect("record");
        assert_eq!(last.event_type, AuditEvent::Error);
        assert!(last.detail.contains(task.id().as_str()));
    }
}
