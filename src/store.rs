//! Line-record task store used by the polling backend.
//!
//! Each task is one line:
//!
//! ```text
//! due_epoch|human_due|note|kind|id|created_epoch|target
//! ```
//!
//! Lines with only the first three fields are read as `log` tasks. Writers
//! serialize through an exclusive lock on a sibling `.lock` file and rewrite
//! the store copy-on-write (temp file in the same directory, then rename), so
//! readers never see a half-written file and need no lock at all.
//!
//! The store never executes anything; it only answers "what is due".

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use crate::config::Config;
use crate::lock::{FileLock, LockError};
use crate::task::{Task, TaskId, TaskKind};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Task store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Corrupt record at {path}:{line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Failed to encode task metadata: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StorageError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One parsed line: a task, or the raw text of a record we could not read.
#[derive(Debug)]
enum Entry {
    Task(Task),
    Corrupt(String),
}

#[derive(Debug, Clone)]
pub struct TaskStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    expiry: chrono::Duration,
}

impl TaskStore {
    pub fn new(config: &Config) -> Self {
        let path = config.task_store_path();
        Self {
            lock_path: path.with_extension("lock"),
            path,
            lock_timeout: config.lock_timeout,
            expiry: config.task_expiry,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a task. The task is durable once this returns.
    pub async fn add(&self, task: &Task) -> Result<(), StorageError> {
        let _lock = FileLock::acquire(&self.lock_path, self.lock_timeout).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StorageError::io(&self.path, e))?;
        file.write_all(encode(task).as_bytes())
            .await
            .map_err(|e| StorageError::io(&self.path, e))?;
        file.sync_data()
            .await
            .map_err(|e| StorageError::io(&self.path, e))?;
        tracing::debug!(task = %task.id(), path = %self.path.display(), "Task stored");
        Ok(())
    }

    /// Tasks not yet due at `now`, soonest first.
    pub async fn list_pending(&self, now: i64) -> Result<Vec<Task>, StorageError> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|t| !t.is_due(now))
            .collect())
    }

    /// Tasks due at `now`, left in place.
    pub async fn list_due(&self, now: i64) -> Result<Vec<Task>, StorageError> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|t| t.is_due(now))
            .collect())
    }

    /// Every readable task, soonest first.
    pub async fn list_all(&self) -> Result<Vec<Task>, StorageError> {
        let mut tasks: Vec<Task> = self
            .read_entries()
            .await?
            .into_iter()
            .filter_map(|e| match e {
                Entry::Task(t) => Some(t),
                Entry::Corrupt(_) => None,
            })
            .collect();
        tasks.sort_by_key(|t| t.due_at());
        Ok(tasks)
    }

    /// Find a task by id.
    pub async fn get(&self, id: &TaskId) -> Result<Option<Task>, StorageError> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .find(|t| t.id() == id))
    }

    /// Remove and return every task due at `now`.
    pub async fn pop_due(&self, now: i64) -> Result<Vec<Task>, StorageError> {
        let (due, _) = self
            .reconcile(|entry| match entry {
                Entry::Task(t) => t.is_due(now),
                Entry::Corrupt(_) => false,
            })
            .await?;
        Ok(due)
    }

    /// Remove one task. Returns whether it was present.
    pub async fn remove(&self, id: &TaskId) -> Result<bool, StorageError> {
        let (removed, _) = self
            .reconcile(|entry| matches!(entry, Entry::Task(t) if t.id() == id))
            .await?;
        Ok(!removed.is_empty())
    }

    /// Drop tasks more than the expiry horizon past due, plus unreadable lines.
    ///
    /// Due tasks still inside the horizon are kept so they can fire.
    pub async fn clear_expired(&self, now: i64) -> Result<usize, StorageError> {
        let horizon = self.expiry.num_seconds();
        let (expired, corrupt) = self
            .reconcile(|entry| match entry {
                Entry::Task(t) => t.due_at().saturating_add(horizon) <= now,
                Entry::Corrupt(_) => true,
            })
            .await?;
        for task in &expired {
            tracing::info!(task = %task.id(), due = %task.due_at_human(), "Expired without firing");
        }
        Ok(expired.len() + corrupt)
    }

    /// Rewrite the store without the entries matching `remove_if`.
    ///
    /// Returns the dropped tasks and the number of dropped corrupt lines.
    async fn reconcile<F>(&self, remove_if: F) -> Result<(Vec<Task>, usize), StorageError>
    where
        F: Fn(&Entry) -> bool,
    {
        let _lock = FileLock::acquire(&self.lock_path, self.lock_timeout).await?;
        let entries = self.read_entries().await?;

        let mut kept = String::new();
        let mut dropped = Vec::new();
        let mut dropped_corrupt = 0;
        for entry in entries {
            if remove_if(&entry) {
                match entry {
                    Entry::Task(t) => dropped.push(t),
                    Entry::Corrupt(_) => dropped_corrupt += 1,
                }
                continue;
            }
            match &entry {
                Entry::Task(t) => kept.push_str(&encode(t)),
                Entry::Corrupt(raw) => {
                    kept.push_str(raw);
                    kept.push('\n');
                }
            }
        }

        if dropped.is_empty() && dropped_corrupt == 0 {
            return Ok((dropped, 0));
        }
        self.replace(kept).await?;
        Ok((dropped, dropped_corrupt))
    }

    async fn replace(&self, contents: String) -> Result<(), StorageError> {
        let tmp_path = self
            .path
            .with_extension(format!("db.tmp.{}", std::process::id()));
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| StorageError::io(&tmp_path, e))?;
        file.write_all(contents.as_bytes())
            .await
            .map_err(|e| StorageError::io(&tmp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::io(&tmp_path, e))?;
        drop(file);
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| StorageError::io(&self.path, e))?;
        Ok(())
    }

    async fn read_entries(&self) -> Result<Vec<Entry>, StorageError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::io(&self.path, err)),
        };

        let mut entries = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match decode(line, idx) {
                Ok(task) => entries.push(Entry::Task(task)),
                Err(reason) => {
                    let err = StorageError::Corrupt {
                        path: self.path.clone(),
                        line: idx + 1,
                        reason,
                    };
                    tracing::warn!("Skipping record: {}", err);
                    entries.push(Entry::Corrupt(line.to_string()));
                }
            }
        }
        Ok(entries)
    }
}

fn encode(task: &Task) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}|{}\n",
        task.due_at(),
        task.due_at_human(),
        task.note(),
        task.kind(),
        task.id(),
        task.created_at(),
        task.target().unwrap_or("")
    )
}

fn decode(line: &str, idx: usize) -> Result<Task, String> {
    let fields: Vec<&str> = line.split('|').collect();
    let due_at: i64 = fields[0]
        .trim()
        .parse()
        .map_err(|_| format!("bad due timestamp '{}'", fields[0]))?;

    match fields.len() {
        3 => {
            let id = TaskId::parse(&format!("{}-0-{}", due_at, idx)).map_err(|e| e.to_string())?;
            Task::restore(id, fields[2], TaskKind::Log, due_at - 1, due_at, None)
                .map_err(|e| e.to_string())
        }
        7 => {
            let kind: TaskKind = fields[3].parse().map_err(|e: crate::task::TaskError| e.to_string())?;
            let id = TaskId::parse(fields[4]).map_err(|e| e.to_string())?;
            let created_at: i64 = fields[5]
                .trim()
                .parse()
                .map_err(|_| format!("bad creation timestamp '{}'", fields[5]))?;
            let target = Some(fields[6].trim())
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            Task::restore(id, fields[2], kind, created_at, due_at, target)
                .map_err(|e| e.to_string())
        }
        n => Err(format!("expected 3 or 7 fields, found {}", n)),
    }
}
