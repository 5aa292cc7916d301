//! Read-only views of the tmux server: sessions, windows and pane output.
//!
//! Every window address is checked by the [`Validator`] before any pane is
//! read, so the session allow-list bounds what can be observed as well as
//! what can be typed into. Capture sizes are clamped to
//! `Config::max_capture_lines`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::audit::{AuditEvent, AuditLog};
use crate::config::Config;
use crate::error::Error;
use crate::tmux::{Multiplexer, MuxError, TmuxDriver, TmuxSession, TmuxWindow, WindowInfo};
use crate::validation::{Target, Validator};

/// Lines captured by `window` when no count is given.
pub const DEFAULT_CAPTURE_LINES: usize = 50;

/// Non-empty lines of recent output kept per window in a status report.
const RECENT_LINES: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct WindowDetails {
    pub target: String,
    #[serde(flatten)]
    pub info: WindowInfo,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowStatus {
    pub index: u32,
    pub name: String,
    pub active: bool,
    pub panes: u32,
    pub layout: String,
    pub recent: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub name: String,
    pub attached: bool,
    pub windows: Vec<WindowStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub timestamp: DateTime<Utc>,
    pub sessions: Vec<SessionStatus>,
}

impl StatusReport {
    /// Plain-text rendering for a human watching several agents.
    pub fn render(&self) -> String {
        let mut out = format!(
            "Tmux Monitoring Snapshot - {}\n{}\n\n",
            self.timestamp.to_rfc3339(),
            "=".repeat(50)
        );
        for session in &self.sessions {
            out.push_str(&format!(
                "Session: {} ({})\n{}\n",
                session.name,
                if session.attached { "ATTACHED" } else { "DETACHED" },
                "-".repeat(30)
            ));
            for window in &session.windows {
                out.push_str(&format!(
                    "  Window {}: {}{}\n",
                    window.index,
                    window.name,
                    if window.active { " (ACTIVE)" } else { "" }
                ));
                if !window.recent.is_empty() {
                    out.push_str("    Recent output:\n");
                    for line in &window.recent {
                        out.push_str(&format!("    | {}\n", line));
                    }
                }
                out.push('\n');
            }
        }
        out
    }
}

pub struct Monitor {
    validator: Validator,
    audit: AuditLog,
    mux: Arc<dyn Multiplexer>,
    allowed_sessions: Vec<String>,
    max_capture_lines: usize,
}

impl Monitor {
    pub fn new(config: &Config, mux: Arc<dyn Multiplexer>) -> Self {
        Self {
            validator: Validator::new(config),
            audit: AuditLog::new(config),
            mux,
            allowed_sessions: config.allowed_sessions.clone(),
            max_capture_lines: config.max_capture_lines,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config, Arc::new(TmuxDriver::new(config.process_timeout)))
    }

    /// Sessions and their windows, limited to the allow-list when one is set.
    pub async fn sessions(&self) -> Result<Vec<TmuxSession>, Error> {
        let mut sessions = self.mux.list_sessions().await?;
        if !self.allowed_sessions.is_empty() {
            sessions.retain(|s| self.allowed_sessions.contains(&s.name));
        }
        Ok(sessions)
    }

    /// The last `lines` lines of `target`, clamped to `1..=max_capture_lines`.
    pub async fn capture(&self, target: &str, lines: usize) -> Result<String, Error> {
        let checked = self.check(target).await?;
        let lines = lines.clamp(1, self.max_capture_lines);
        Ok(self.mux.capture(&checked.to_string(), lines).await?)
    }

    /// Layout details of `target` with its last `lines` lines of output.
    pub async fn window(&self, target: &str, lines: usize) -> Result<WindowDetails, Error> {
        let checked = self.check(target).await?;
        let address = checked.to_string();
        let info = self.mux.window_info(&address).await?;
        let content = self
            .mux
            .capture(&address, lines.clamp(1, self.max_capture_lines))
            .await?;
        Ok(WindowDetails {
            target: address,
            info,
            content,
        })
    }

    /// Windows whose name contains `name`, ignoring case.
    pub async fn find_windows(&self, name: &str) -> Result<Vec<TmuxWindow>, Error> {
        let needle = name.to_lowercase();
        Ok(self
            .sessions()
            .await?
            .into_iter()
            .flat_map(|s| s.windows)
            .filter(|w| w.name.to_lowercase().contains(&needle))
            .collect())
    }

    /// Every visible window with its layout and recent output.
    ///
    /// Windows whose address does not pass validation, or that close while
    /// the report is being built, are left out.
    pub async fn status(&self) -> Result<StatusReport, Error> {
        let mut report = StatusReport {
            timestamp: Utc::now(),
            sessions: Vec::new(),
        };
        for session in self.sessions().await? {
            let mut windows = Vec::with_capacity(session.windows.len());
            for window in &session.windows {
                let address = window.target();
                if let Err(e) = self.validator.validate_target(&address) {
                    tracing::debug!(window = %address, error = %e, "Skipping window");
                    continue;
                }
                match self.window_status(window, &address).await {
                    Ok(status) => windows.push(status),
                    Err(MuxError::TargetNotFound(_)) => {
                        tracing::debug!(window = %address, "Window closed during status");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            report.sessions.push(SessionStatus {
                name: session.name,
                attached: session.attached,
                windows,
            });
        }
        Ok(report)
    }

    /// Text rendering of [`Monitor::status`].
    pub async fn snapshot(&self) -> Result<String, Error> {
        Ok(self.status().await?.render())
    }

    async fn window_status(&self, window: &TmuxWindow, address: &str) -> Result<WindowStatus, MuxError> {
        let info = self.mux.window_info(address).await?;
        let content = self
            .mux
            .capture(address, DEFAULT_CAPTURE_LINES.min(self.max_capture_lines))
            .await?;
        let lines: Vec<String> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect();
        let recent = lines[lines.len().saturating_sub(RECENT_LINES)..].to_vec();
        Ok(WindowStatus {
            index: window.index,
            name: info.name,
            active: info.active,
            panes: info.panes,
            layout: info.layout,
            recent,
        })
    }

    async fn check(&self, target: &str) -> Result<Target, Error> {
        match self.validator.validate_target(target) {
            Ok(checked) => Ok(checked),
            Err(e) => {
                self.audit
                    .record(AuditEvent::ValidationFailure, target, e.to_string())
                    .await;
                Err(e.into())
            }
        }
    }
}
