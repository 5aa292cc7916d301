//! Core Task type for deferred note actions.
//!
//! # Invariants
//! - `due_at > created_at`
//! - `note` is non-empty and single-line with no `|` (it must fit one store record)
//! - `id` is unique per (creation second, process, sequence)

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use chrono::{Local, TimeZone};
use regex::Regex;
use serde::{Deserialize, Serialize};

static NEXT_SEQ: AtomicU32 = AtomicU32::new(0);

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[0-9]{1,19}-[0-9]{1,10}-[0-9]{1,10}$").expect("valid regex"))
}

/// Unique identifier for a task.
///
/// # Properties
/// - Shaped `<created_epoch>-<pid>-<seq>`
/// - Safe to use as a file stem (digits and hyphens only)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    /// Create a fresh ID for a task created at `created_at`.
    ///
    /// # Postcondition
    /// Never returns the same ID twice within one process.
    pub fn generate(created_at: i64) -> Self {
        let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
        Self(format!("{}-{}-{}", created_at, std::process::id(), seq))
    }

    /// Parse an ID supplied from outside (CLI argument, store record).
    pub fn parse(raw: &str) -> Result<Self, TaskError> {
        let raw = raw.trim();
        if id_pattern().is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(TaskError::InvalidId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TaskId {
    type Error = TaskError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the Dispatcher does when a task fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Write a per-task note file and append to the shared log
    File,
    /// Append one line to the shared log
    Log,
    /// Best-effort user-visible notification, falling back to `Log`
    Display,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::File => "file",
            TaskKind::Log => "log",
            TaskKind::Display => "display",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "file" => Ok(TaskKind::File),
            "log" => Ok(TaskKind::Log),
            "display" => Ok(TaskKind::Display),
            other => Err(TaskError::InvalidKind(other.to_string())),
        }
    }
}

/// A durable record describing a note action and when it becomes due.
///
/// # Lifecycle
/// ```text
/// Requested -> Validated -> Persisted -> Submitted -> Fired
///                                                \-> Cancelled
///                                                \-> Expired (never fired)
/// ```
/// Only `Persisted` onwards exists as a `Task`; earlier states are checks
/// performed by the scheduler before construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    due_at: i64,
    note: String,
    kind: TaskKind,
    /// External job identifier, only set by the host job-queue backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backend_ref: Option<String>,
    created_at: i64,
    /// Validated `session:window` to receive the note when it fires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
}

impl Task {
    /// Create a new task with a fresh ID.
    ///
    /// # Preconditions
    /// - `due_at > created_at`
    /// - `note` already passed the validator
    ///
    /// # Errors
    /// Returns `Err` if the structural invariants are violated.
    pub fn new(
        note: impl Into<String>,
        kind: TaskKind,
        created_at: i64,
        due_at: i64,
        target: Option<String>,
    ) -> Result<Self, TaskError> {
        Self::restore(
            TaskId::generate(created_at),
            note,
            kind,
            created_at,
            due_at,
            target,
        )
    }

    /// Rebuild a task from persisted fields, re-checking invariants.
    pub fn restore(
        id: TaskId,
        note: impl Into<String>,
        kind: TaskKind,
        created_at: i64,
        due_at: i64,
        target: Option<String>,
    ) -> Result<Self, TaskError> {
        let note = note.into();
        if note.is_empty() {
            return Err(TaskError::EmptyNote);
        }
        if note.contains(&['|', '\n', '\r'][..]) {
            return Err(TaskError::UnstorableNote);
        }
        if due_at <= created_at {
            return Err(TaskError::NotInFuture {
                created_at,
                due_at,
            });
        }
        Ok(Self {
            id,
            due_at,
            note,
            kind,
            backend_ref: None,
            created_at,
            target,
        })
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn due_at(&self) -> i64 {
        self.due_at
    }

    pub fn note(&self) -> &str {
        &self.note
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn backend_ref(&self) -> Option<&str> {
        self.backend_ref.as_deref()
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// Attach the job reference returned by the host job queue.
    pub fn set_backend_ref(&mut self, job: impl Into<String>) {
        self.backend_ref = Some(job.into());
    }

    /// Whether the task may fire at `now` (epoch seconds).
    pub fn is_due(&self, now: i64) -> bool {
        self.due_at <= now
    }

    /// Due time rendered for humans in local time.
    pub fn due_at_human(&self) -> String {
        format_local(self.due_at)
    }
}

/// Render epoch seconds as local `YYYY-MM-DD HH:MM:SS`.
pub fn format_local(epoch: i64) -> String {
    match Local.timestamp_opt(epoch, 0).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => epoch.to_string(),
    }
}

/// Errors that can occur during task construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Task note cannot be empty")]
    EmptyNote,

    #[error("Task note must be a single line without '|'")]
    UnstorableNote,

    #[error("Task due time {due_at} is not after its creation time {created_at}")]
    NotInFuture { created_at: i64, due_at: i64 },

    #[error("Invalid task id '{0}' (expected <epoch>-<pid>-<seq>)")]
    InvalidId(String),

    #[error("Invalid task kind '{0}' (expected file, log or display)")]
    InvalidKind(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_parseable() {
        let a = TaskId::generate(1_700_000_000);
        let b = TaskId::generate(1_700_000_000);
        assert_ne!(a, b);
        assert_eq!(TaskId::parse(a.as_str()).expect("parse"), a);
    }

    #[test]
    fn parse_rejects_path_like_ids() {
        assert!(TaskId::parse("../etc/passwd").is_err());
        assert!(TaskId::parse("1-2").is_err());
        assert!(TaskId::parse("1-2-3; rm").is_err());
        assert!(TaskId::parse(" 1700000000-42-0 ").is_ok());
    }

    #[test]
    fn new_enforces_due_after_creation() {
        let err = Task::new("note", TaskKind::Log, 100, 100, None).unwrap_err();
        assert_eq!(
            err,
            TaskError::NotInFuture {
                created_at: 100,
                due_at: 100
            }
        );
        let task = Task::new("note", TaskKind::Log, 100, 160, None).expect("task");
        assert!(!task.is_due(159));
        assert!(task.is_due(160));
    }

    #[test]
    fn new_rejects_notes_that_break_records() {
        assert_eq!(
            Task::new("", TaskKind::Log, 1, 2, None).unwrap_err(),
            TaskError::EmptyNote
        );
        assert_eq!(
            Task::new("a|b", TaskKind::Log, 1, 2, None).unwrap_err(),
            TaskError::UnstorableNote
        );
        assert_eq!(
            Task::new("a\nb", TaskKind::Log, 1, 2, None).unwrap_err(),
            TaskError::UnstorableNote
        );
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("FILE".parse::<TaskKind>().expect("kind"), TaskKind::File);
        assert_eq!("display".parse::<TaskKind>().expect("kind"), TaskKind::Display);
        assert!("email".parse::<TaskKind>().is_err());
    }

    #[test]
    fn sidecar_json_round_trips_backend_ref() {
        let mut task = Task::new("check", TaskKind::File, 10, 70, Some("main:0".into()))
            .expect("task");
        task.set_backend_ref("17");
        let json = serde_json::to_string(&task).expect("serialize");
        let back: Task = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, task);
        assert_eq!(back.backend_ref(), Some("17"));
    }
}
