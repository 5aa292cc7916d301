//! Append-only audit trail of validation decisions and executions.
//!
//! Records are NDJSON, one per line, appended with `O_APPEND` so concurrent
//! writers in different processes never truncate each other. Each line is
//! written with a single `write` call; ordering between processes is not
//! guaranteed.
//!
//! Recording never fails the caller. If the audit log cannot be written the
//! record goes to the error log instead, and if that fails too it is emitted
//! through `tracing` only.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::config::Config;

/// Coarse category tag carried by every line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Category {
    Info,
    Warn,
    Error,
    Command,
    Reminder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    ValidationFailure,
    RateLimited,
    Scheduled,
    Fired,
    Error,
    Cancelled,
    Expired,
    Sent,
    Maintenance,
}

impl AuditEvent {
    pub fn category(&self) -> Category {
        match self {
            AuditEvent::ValidationFailure | AuditEvent::RateLimited => Category::Warn,
            AuditEvent::Scheduled
            | AuditEvent::Fired
            | AuditEvent::Cancelled
            | AuditEvent::Expired => Category::Reminder,
            AuditEvent::Error => Category::Error,
            AuditEvent::Sent => Category::Command,
            AuditEvent::Maintenance => Category::Info,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub category: Category,
    pub actor: String,
    pub event_type: AuditEvent,
    pub target_or_kind: String,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    audit_path: PathBuf,
    error_path: PathBuf,
    actor: String,
    retention_days: u32,
}

impl AuditLog {
    pub fn new(config: &Config) -> Self {
        Self {
            audit_path: config.audit_log_path(),
            error_path: config.error_log_path(),
            actor: config.actor.clone(),
            retention_days: config.log_retention_days,
        }
    }

    pub fn audit_path(&self) -> &Path {
        &self.audit_path
    }

    pub fn error_path(&self) -> &Path {
        &self.error_path
    }

    /// Append one record. Never returns an error.
    pub async fn record(&self, event: AuditEvent, target_or_kind: &str, detail: impl Into<String>) {
        let record = AuditRecord {
            timestamp: Utc::now(),
            category: event.category(),
            actor: self.actor.clone(),
            event_type: event,
            target_or_kind: target_or_kind.to_string(),
            detail: detail.into(),
        };
        self.append(&record).await;
    }

    async fn append(&self, record: &AuditRecord) {
        match record.category {
            Category::Error => {
                tracing::error!(event = ?record.event_type, subject = %record.target_or_kind, "{}", record.detail)
            }
            Category::Warn => {
                tracing::warn!(event = ?record.event_type, subject = %record.target_or_kind, "{}", record.detail)
            }
            _ => {
                tracing::info!(event = ?record.event_type, subject = %record.target_or_kind, "{}", record.detail)
            }
        }

        let line = match serde_json::to_string(record) {
            Ok(mut line) => {
                line.push('\n');
                line
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to serialize audit record");
                return;
            }
        };

        if let Err(err) = append_line(&self.audit_path, &line).await {
            self.secondary(&format!(
                "audit log {} unwritable ({}); record: {}",
                self.audit_path.display(),
                err,
                line.trim_end()
            ))
            .await;
            return;
        }

        if record.category == Category::Error {
            if let Err(err) = append_line(&self.error_path, &line).await {
                tracing::error!(path = %self.error_path.display(), error = %err, "Failed to mirror error record");
            }
        }
    }

    /// Write straight to the error channel.
    async fn secondary(&self, message: &str) {
        let record = AuditRecord {
            timestamp: Utc::now(),
            category: Category::Error,
            actor: self.actor.clone(),
            event_type: AuditEvent::Error,
            target_or_kind: "audit".to_string(),
            detail: message.to_string(),
        };
        let written = match serde_json::to_string(&record) {
            Ok(line) => append_line(&self.error_path, &format!("{}\n", line)).await,
            Err(err) => Err(std::io::Error::other(err)),
        };
        if let Err(err) = written {
            tracing::error!(path = %self.error_path.display(), error = %err, "{}", message);
        }
    }

    /// All parseable records currently in the audit log.
    pub async fn records(&self) -> Vec<AuditRecord> {
        read_records(&self.audit_path).await
    }

    /// Drop records older than the retention horizon from both logs.
    ///
    /// Returns the number of records removed. A retention of 0 disables the
    /// sweep. Lines that cannot be parsed are kept.
    pub async fn sweep(&self, now: DateTime<Utc>) -> std::io::Result<usize> {
        if self.retention_days == 0 {
            return Ok(0);
        }
        // A horizon reaching past the representable range keeps everything.
        let Some(cutoff) = chrono::Duration::try_days(i64::from(self.retention_days))
            .and_then(|horizon| now.checked_sub_signed(horizon))
        else {
            tracing::debug!(days = self.retention_days, "Retention horizon out of range, nothing to sweep");
            return Ok(0);
        };
        let mut removed = 0;
        for path in [&self.audit_path, &self.error_path] {
            removed += sweep_file(path, cutoff).await?;
        }
        if removed > 0 {
            self.record(
                AuditEvent::Maintenance,
                "retention",
                format!(
                    "removed {} records older than {} days",
                    removed, self.retention_days
                ),
            )
            .await;
        }
        Ok(removed)
    }
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

async fn read_records(path: &Path) -> Vec<AuditRecord> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "Failed to read audit log");
            return Vec::new();
        }
    };
    contents
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

async fn sweep_file(path: &Path, cutoff: DateTime<Utc>) -> std::io::Result<usize> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };

    let mut kept = String::with_capacity(contents.len());
    let mut removed = 0;
    for line in contents.lines() {
        let expired = serde_json::from_str::<AuditRecord>(line)
            .map(|r| r.timestamp < cutoff)
            .unwrap_or(false);
        if expired {
            removed += 1;
        } else {
            kept.push_str(line);
            kept.push('\n');
        }
    }
    if removed == 0 {
        return Ok(0);
    }

    let tmp_path = path.with_extension("log.tmp");
    tokio::fs::write(&tmp_path, kept).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(removed)
}
