//! Deferred-execution backends.
//!
//! Both backends satisfy the same task lifecycle: a task is durable before
//! `submit` returns, stays listed until the dispatcher calls `complete`, and
//! can be withdrawn with `cancel` or swept by `clear_expired`.

pub mod at;
pub mod poll;
pub mod registry;

use std::time::Duration;

use async_trait::async_trait;

use crate::config::BackendKind;
use crate::store::StorageError;
use crate::task::{Task, TaskId};

pub use at::{AtBackend, AtQueue, JobQueue};
pub use poll::PollBackend;
pub use registry::BackendRegistry;

/// The host could not take the task. Nothing stays registered.
#[derive(Debug, thiserror::Error)]
pub enum SchedulingFailed {
    #[error("Deferred execution facility unavailable: {0}")]
    Unavailable(String),

    #[error("Job submission rejected: {0}")]
    Rejected(String),

    #[error("Job submission timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("Failed to persist task: {0}")]
    Storage(#[from] StorageError),
}

#[async_trait]
pub trait SchedulerBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Persist `task` and hand it to the execution facility.
    ///
    /// Returns the task as stored (with `backend_ref` set when the facility
    /// issued one).
    async fn submit(&self, task: Task) -> Result<Task, SchedulingFailed>;

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, StorageError>;

    /// Every task still held, soonest first.
    async fn list(&self) -> Result<Vec<Task>, StorageError>;

    /// Tasks this backend expects the caller to fire now.
    ///
    /// Backends whose facility fires tasks on its own return nothing.
    async fn due(&self, _now: i64) -> Result<Vec<Task>, StorageError> {
        Ok(Vec::new())
    }

    /// Delete the durable record after the task fired.
    async fn complete(&self, id: &TaskId) -> Result<bool, StorageError>;

    /// Withdraw a task before it fires.
    async fn cancel(&self, id: &TaskId) -> Result<bool, StorageError>;

    /// Remove tasks past the expiry horizon; returns how many were dropped.
    async fn clear_expired(&self, now: i64) -> Result<usize, StorageError>;
}
