//! Host job-queue backend built on `at(1)`.
//!
//! Each task is kept as a JSON sidecar `<id>.json` next to a generated
//! `<id>.sh` script. The script only re-invokes this binary with
//! `fire <id>`; the note itself never appears in it, so no user text is ever
//! interpreted by a shell. The script deletes itself as its last step.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{SchedulerBackend, SchedulingFailed};
use crate::config::{BackendKind, Config};
use crate::store::StorageError;
use crate::task::{Task, TaskId};
use crate::util::shell_escape;

/// A host facility that runs a script after a delay.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Queue `script` to run in `delay_minutes`; returns the job reference.
    async fn submit(&self, script: &Path, delay_minutes: i64) -> Result<String, SchedulingFailed>;

    /// Withdraw a queued job.
    async fn remove(&self, job: &str) -> Result<(), SchedulingFailed>;
}

fn job_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"job\s+(\S+)\s+at").expect("valid regex"))
}

/// The system `at` daemon.
#[derive(Debug, Clone)]
pub struct AtQueue {
    timeout: Duration,
}

impl AtQueue {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<std::process::Output, SchedulingFailed> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(
                SchedulingFailed::Unavailable(format!("'{}' is not installed", program)),
            ),
            Ok(Err(e)) => Err(SchedulingFailed::Unavailable(format!(
                "failed to run {}: {}",
                program, e
            ))),
            Err(_) => Err(SchedulingFailed::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl JobQueue for AtQueue {
    async fn submit(&self, script: &Path, delay_minutes: i64) -> Result<String, SchedulingFailed> {
        let script = script.to_string_lossy();
        let delay = delay_minutes.to_string();
        let output = self
            .run("at", &["-f", &script, "now", "+", &delay, "minutes"])
            .await?;

        // at reports the job on stderr, after any shell warning.
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(SchedulingFailed::Rejected(stderr.trim().to_string()));
        }
        job_pattern()
            .captures(&stderr)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| {
                SchedulingFailed::Rejected(format!(
                    "could not read job id from at output: {}",
                    stderr.trim()
                ))
            })
    }

    async fn remove(&self, job: &str) -> Result<(), SchedulingFailed> {
        let output = self.run("atrm", &[job]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SchedulingFailed::Rejected(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

pub struct AtBackend {
    dir: PathBuf,
    home: PathBuf,
    program: PathBuf,
    queue: Arc<dyn JobQueue>,
    expiry: chrono::Duration,
}

impl AtBackend {
    /// `program` is the binary the generated scripts invoke with `fire <id>`.
    pub fn new(config: &Config, queue: Arc<dyn JobQueue>, program: impl Into<PathBuf>) -> Self {
        Self {
            dir: config.reminders_dir(),
            home: config.home.clone(),
            program: program.into(),
            queue,
            expiry: config.task_expiry,
        }
    }

    fn sidecar_path(&self, id: &TaskId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn script_path(&self, id: &TaskId) -> PathBuf {
        self.dir.join(format!("{}.sh", id))
    }

    fn script(&self, task: &Task) -> String {
        format!(
            "#!/bin/sh\n\
             export TMUX_ORCHESTRATOR_HOME={home}\n\
             {program} fire {id}\n\
             rm -f {script}\n",
            home = shell_escape(&self.home.to_string_lossy()),
            program = shell_escape(&self.program.to_string_lossy()),
            id = shell_escape(task.id().as_str()),
            script = shell_escape(&self.script_path(task.id()).to_string_lossy()),
        )
    }

    async fn write_sidecar(&self, task: &Task) -> Result<(), StorageError> {
        let path = self.sidecar_path(task.id());
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(task)?;
        tokio::fs::write(&tmp_path, json)
            .await
            .map_err(|e| StorageError::io(&tmp_path, e))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| StorageError::io(&path, e))
    }

    async fn write_script(&self, task: &Task) -> Result<PathBuf, StorageError> {
        let path = self.script_path(task.id());
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o700);
        let mut file = options
            .open(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        file.write_all(self.script(task).as_bytes())
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        Ok(path)
    }

    /// Delete both files for `id`. Returns whether the sidecar existed.
    async fn discard(&self, id: &TaskId) -> Result<bool, StorageError> {
        remove_script(&self.script_path(id)).await;
        let path = self.sidecar_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }

    /// Undo a partial submission.
    async fn rollback(&self, id: &TaskId) {
        if let Err(e) = self.discard(id).await {
            tracing::warn!(task = %id, error = %e, "Failed to roll back task files");
        }
    }

    async fn withdraw(&self, task: &Task) {
        if let Some(job) = task.backend_ref() {
            if let Err(e) = self.queue.remove(job).await {
                tracing::warn!(task = %task.id(), job = %job, error = %e, "Failed to remove queued job");
            }
        }
    }

    /// Every sidecar in the directory: parsed tasks and unreadable paths.
    async fn scan(&self) -> Result<(Vec<Task>, Vec<PathBuf>), StorageError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((Vec::new(), Vec::new()))
            }
            Err(e) => return Err(StorageError::io(&self.dir, e)),
        };

        let mut tasks = Vec::new();
        let mut corrupt = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read(&path)
                .await
                .map_err(|e| e.to_string())
                .and_then(|bytes| serde_json::from_slice::<Task>(&bytes).map_err(|e| e.to_string()));
            match parsed {
                Ok(task) => tasks.push(task),
                Err(reason) => {
                    tracing::warn!(path = %path.display(), %reason, "Skipping unreadable task sidecar");
                    corrupt.push(path);
                }
            }
        }
        tasks.sort_by_key(|t| t.due_at());
        Ok((tasks, corrupt))
    }
}

/// Best-effort removal of a generated script; a leftover is reported.
async fn remove_script(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove generated script")
        }
    }
}

#[async_trait]
impl SchedulerBackend for AtBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::At
    }

    async fn submit(&self, mut task: Task) -> Result<Task, SchedulingFailed> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StorageError::io(&self.dir, e))?;
        self.write_sidecar(&task).await?;
        let script = match self.write_script(&task).await {
            Ok(script) => script,
            Err(e) => {
                self.rollback(task.id()).await;
                return Err(e.into());
            }
        };

        let delay_minutes = ((task.due_at() - task.created_at() + 59) / 60).max(1);
        let job = match self.queue.submit(&script, delay_minutes).await {
            Ok(job) => job,
            Err(e) => {
                self.rollback(task.id()).await;
                return Err(e);
            }
        };

        task.set_backend_ref(job);
        if let Err(e) = self.write_sidecar(&task).await {
            self.withdraw(&task).await;
            self.rollback(task.id()).await;
            return Err(e.into());
        }
        tracing::debug!(task = %task.id(), job = ?task.backend_ref(), delay_minutes, "Queued with at");
        Ok(task)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, StorageError> {
        let path = self.sidecar_path(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(&path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                path,
                line: e.line(),
                reason: e.to_string(),
            })
    }

    async fn list(&self) -> Result<Vec<Task>, StorageError> {
        Ok(self.scan().await?.0)
    }

    async fn complete(&self, id: &TaskId) -> Result<bool, StorageError> {
        self.discard(id).await
    }

    async fn cancel(&self, id: &TaskId) -> Result<bool, StorageError> {
        let Some(task) = self.get(id).await? else {
            return Ok(false);
        };
        self.withdraw(&task).await;
        self.discard(id).await
    }

    async fn clear_expired(&self, now: i64) -> Result<usize, StorageError> {
        let horizon = self.expiry.num_seconds();
        let (tasks, corrupt) = self.scan().await?;
        let mut removed = 0;
        for task in tasks {
            if task.due_at().saturating_add(horizon) > now {
                continue;
            }
            tracing::info!(task = %task.id(), due = %task.due_at_human(), "Expired without firing");
            self.withdraw(&task).await;
            if self.discard(task.id()).await? {
                removed += 1;
            }
        }
        for path in corrupt {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::io(&path, e)),
            }
            remove_script(&path.with_extension("sh")).await;
        }
        Ok(removed)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeQueue;
    use super::*;
    use crate::task::TaskKind;

    fn backend(dir: &Path, queue: Arc<FakeQueue>) -> AtBackend {
        AtBackend::new(
            &Config::with_home(dir),
            queue,
            "/usr/local/bin/tmux-orchestrator",
        )
    }

    fn task(now: i64, delay: i64, note: &str) -> Task {
        Task::new(note, TaskKind::Log, now, now + delay, None).expect("task")
    }

    #[tokio::test]
    async fn submit_writes_sidecar_and_script_then_queues() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queue = Arc::new(FakeQueue::default());
        let backend = backend(temp.path(), queue.clone());
        let now = 1_736_937_000;

        let stored = backend
            .submit(task(now, 90, "it's time"))
            .await
            .expect("submit");
        assert_eq!(stored.backend_ref(), Some("41"));

        let submitted = queue.submitted.lock().expect("lock").clone();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].1, 2);

        let script = std::fs::read_to_string(&submitted[0].0).expect("script");
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains(&format!("'/usr/local/bin/tmux-orchestrator' fire '{}'", stored.id())));
        assert!(script.trim_end().ends_with(&format!("{}.sh'", stored.id())));
        assert!(!script.contains("it's time"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&submitted[0].0).expect("meta").permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }

        assert_eq!(backend.get(stored.id()).await.expect("get"), Some(stored.clone()));
        assert_eq!(backend.list().await.expect("list"), vec![stored.clone()]);
        // The OS fires at tasks itself.
        assert!(backend.due(now + 3600).await.expect("due").is_empty());

        assert!(backend.complete(stored.id()).await.expect("complete"));
        assert!(!backend.complete(stored.id()).await.expect("complete again"));
        assert!(!submitted[0].0.exists());
    }

    #[tokio::test]
    async fn failed_submission_leaves_nothing_behind() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queue = Arc::new(FakeQueue {
            reject: true,
            ..Default::default()
        });
        let backend = backend(temp.path(), queue);

        let err = backend
            .submit(task(1_000, 60, "never queued"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulingFailed::Unavailable(_)));
        let leftovers: Vec<_> = std::fs::read_dir(temp.path().join("reminders"))
            .expect("read dir")
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn undeletable_script_does_not_block_completion() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backend = backend(temp.path(), Arc::new(FakeQueue::default()));
        let stored = backend.submit(task(1_000, 60, "stuck")).await.expect("submit");

        // A non-empty directory in place of the script cannot be unlinked.
        let script = temp.path().join(format!("reminders/{}.sh", stored.id()));
        std::fs::remove_file(&script).expect("remove script");
        std::fs::create_dir_all(script.join("inner")).expect("mkdir");

        assert!(backend.complete(stored.id()).await.expect("complete"));
        assert!(backend.get(stored.id()).await.expect("get").is_none());
        assert!(script.exists());
    }

    #[tokio::test]
    async fn cancel_removes_queued_job_and_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queue = Arc::new(FakeQueue::default());
        let backend = backend(temp.path(), queue.clone());

        let stored = backend.submit(task(1_000, 600, "cancel me")).await.expect("submit");
        assert!(backend.cancel(stored.id()).await.expect("cancel"));
        assert_eq!(queue.removed.lock().expect("lock").clone(), vec!["41".to_string()]);
        assert!(backend.get(stored.id()).await.expect("get").is_none());
        assert!(!backend.cancel(stored.id()).await.expect("cancel again"));
    }

    #[tokio::test]
    async fn clear_expired_drops_stale_and_unreadable_sidecars() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queue = Arc::new(FakeQueue::default());
        let backend = backend(temp.path(), queue);
        let now = 1_736_937_000;
        let day = 24 * 3600;

        let stale = backend.submit(task(now - 2 * day, 60, "stale")).await.expect("submit");
        let fresh = backend.submit(task(now, 60, "fresh")).await.expect("submit");
        std::fs::write(temp.path().join("reminders/1-2-3.json"), "{not json").expect("write");

        assert_eq!(backend.clear_expired(now).await.expect("clear"), 2);
        assert_eq!(backend.clear_expired(now).await.expect("clear again"), 0);
        assert!(backend.get(stale.id()).await.expect("get").is_none());
        assert_eq!(backend.list().await.expect("list"), vec![fresh]);
    }
}
