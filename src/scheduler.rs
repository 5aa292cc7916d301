//! Entry point for deferred tasks.
//!
//! `schedule` runs the full admission pipeline before anything is written:
//!
//! ```text
//! delay -> note -> kind -> target -> rate limit -> Task -> backend.submit
//! ```
//!
//! Each rejection is audited and returned; nothing is persisted for a
//! rejected request.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::audit::{AuditEvent, AuditLog};
use crate::backend::{BackendRegistry, SchedulerBackend, SchedulingFailed};
use crate::config::{BackendKind, Config};
use crate::dispatch::{DesktopNotifier, Dispatcher};
use crate::error::Error;
use crate::rate_limit::{RateLimitError, RateLimiter};
use crate::task::{Task, TaskId, TaskKind};
use crate::tmux::TmuxDriver;
use crate::validation::{ValidationError, Validator};

/// Outcome of one `run-due` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub fired: usize,
    pub failed: usize,
}

pub struct Scheduler {
    validator: Validator,
    limiter: RateLimiter,
    audit: AuditLog,
    backends: BackendRegistry,
    dispatcher: Dispatcher,
}

impl Scheduler {
    pub fn new(config: &Config, backends: BackendRegistry, dispatcher: Dispatcher) -> Self {
        Self {
            validator: Validator::new(config),
            limiter: RateLimiter::new(config),
            audit: AuditLog::new(config),
            backends,
            dispatcher,
        }
    }

    /// Scheduler wired to the host: `at`, tmux and desktop notifications.
    pub fn from_config(config: Arc<Config>) -> Self {
        let dispatcher = Dispatcher::new(
            &config,
            AuditLog::new(&config),
            Arc::new(DesktopNotifier::new(config.process_timeout)),
            Arc::new(TmuxDriver::new(config.process_timeout)),
        );
        Self::new(&config, BackendRegistry::from_config(&config), dispatcher)
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Schedule `note` to fire in `minutes`.
    pub async fn schedule(
        &self,
        minutes: i64,
        note: &str,
        kind: &str,
        target: Option<&str>,
    ) -> Result<Task, Error> {
        self.schedule_at(minutes, note, kind, target, Utc::now()).await
    }

    pub async fn schedule_at(
        &self,
        minutes: i64,
        note: &str,
        kind: &str,
        target: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Task, Error> {
        let (kind, target) = match self.check(minutes, note, kind, target) {
            Ok(checked) => checked,
            Err(e) => {
                self.audit
                    .record(AuditEvent::ValidationFailure, "schedule", e.to_string())
                    .await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.limiter.admit_at(now).await {
            let event = match e {
                RateLimitError::Exceeded { .. } => AuditEvent::RateLimited,
                _ => AuditEvent::Error,
            };
            self.audit.record(event, "schedule", e.to_string()).await;
            return Err(e.into());
        }

        let created_at = now.timestamp();
        let task = Task::new(note, kind, created_at, created_at + minutes * 60, target)?;
        let backend = self
            .backends
            .default_backend()
            .ok_or_else(|| SchedulingFailed::Unavailable("no scheduler backend registered".to_string()))?;

        match backend.submit(task).await {
            Ok(task) => {
                self.audit
                    .record(
                        AuditEvent::Scheduled,
                        kind.as_str(),
                        format!(
                            "task {} due {} via {}{}",
                            task.id(),
                            task.due_at_human(),
                            backend.kind().as_str(),
                            task.backend_ref()
                                .map(|job| format!(" (job {})", job))
                                .unwrap_or_default()
                        ),
                    )
                    .await;
                Ok(task)
            }
            Err(e) => {
                self.audit
                    .record(AuditEvent::Error, kind.as_str(), format!("scheduling failed: {}", e))
                    .await;
                Err(e.into())
            }
        }
    }

    fn check(
        &self,
        minutes: i64,
        note: &str,
        kind: &str,
        target: Option<&str>,
    ) -> Result<(TaskKind, Option<String>), ValidationError> {
        self.validator.validate_delay(minutes)?;
        self.validator.validate_note(note)?;
        let kind: TaskKind = kind.parse()?;
        let target = target
            .map(|t| self.validator.validate_target(t).map(|t| t.to_string()))
            .transpose()?;
        Ok((kind, target))
    }

    /// Fire one task by id, as invoked by a queued job.
    ///
    /// Returns `false` when no backend holds the task (already fired or
    /// cancelled).
    pub async fn fire(&self, id: &str) -> Result<bool, Error> {
        let id = self.parse_id(id, "fire").await?;
        let Some((backend, task)) = self.backends.locate(&id).await? else {
            tracing::warn!(task = %id, "Nothing to fire");
            return Ok(false);
        };
        self.dispatcher.fire(&task, backend.as_ref()).await?;
        Ok(true)
    }

    /// Fire every due task held by a polling backend.
    pub async fn run_due(&self) -> Result<RunSummary, Error> {
        self.run_due_at(Utc::now().timestamp()).await
    }

    pub async fn run_due_at(&self, now: i64) -> Result<RunSummary, Error> {
        let mut summary = RunSummary::default();
        for (backend, task) in self.backends.due(now).await? {
            match self.dispatcher.fire(&task, backend.as_ref()).await {
                Ok(()) => summary.fired += 1,
                Err(e) => {
                    tracing::warn!(task = %task.id(), error = %e, "Dispatch failed");
                    summary.failed += 1;
                }
            }
        }
        if summary.fired + summary.failed > 0 {
            tracing::info!(fired = summary.fired, failed = summary.failed, "Processed due tasks");
        }
        Ok(summary)
    }

    /// Withdraw a pending task. Returns whether it was found.
    pub async fn cancel(&self, id: &str) -> Result<bool, Error> {
        let id = self.parse_id(id, "cancel").await?;
        let Some((backend, task)) = self.backends.locate(&id).await? else {
            return Ok(false);
        };
        let cancelled = backend.cancel(&id).await?;
        if cancelled {
            self.audit
                .record(
                    AuditEvent::Cancelled,
                    task.kind().as_str(),
                    format!("task {}: {}", id, task.note()),
                )
                .await;
        }
        Ok(cancelled)
    }

    /// Every task held, soonest first, with the backend holding it.
    pub async fn list(&self) -> Result<Vec<(BackendKind, Task)>, Error> {
        Ok(self.backends.list().await?)
    }

    pub async fn clear_expired(&self) -> Result<usize, Error> {
        self.clear_expired_at(Utc::now().timestamp()).await
    }

    pub async fn clear_expired_at(&self, now: i64) -> Result<usize, Error> {
        let removed = self.backends.clear_expired(now).await?;
        if removed > 0 {
            self.audit
                .record(
                    AuditEvent::Expired,
                    "expiry",
                    format!("removed {} expired or unreadable tasks", removed),
                )
                .await;
        }
        Ok(removed)
    }

    /// Apply audit log retention.
    pub async fn sweep_logs(&self) -> Result<usize, Error> {
        Ok(self.audit.sweep(Utc::now()).await?)
    }

    async fn parse_id(&self, raw: &str, action: &str) -> Result<TaskId, Error> {
        match TaskId::parse(raw) {
            Ok(id) => Ok(id),
            Err(e) => {
                self.audit
                    .record(AuditEvent::ValidationFailure, action, e.to_string())
                    .await;
                Err(e.into())
            }
        }
    }
}
