//! Terminal multiplexer driver.
//!
//! The core never builds multiplexer command lines from free text: it hands a
//! validated target and literal text to a [`Multiplexer`], and the tmux
//! implementation passes them as separate argv entries (`send-keys -l`).
//!
//! Read operations (session listing, pane capture, window details) go through
//! the same timeout-bounded process call. Session and window listings are
//! fetched with two batched queries rather than one call per session.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;

const SESSIONS_FORMAT: &str = "#{session_name}:#{session_attached}";
// Window names may contain ':', so the name goes last.
const WINDOWS_FORMAT: &str = "#{session_name}:#{window_index}:#{window_active}:#{window_name}";
const WINDOW_INFO_FORMAT: &str = "#{window_active}:#{window_panes}:#{window_layout}:#{window_name}";

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("Target {0} not found")]
    TargetNotFound(String),

    #[error("tmux failed on {target}: {reason}")]
    CommandFailed { target: String, reason: String },

    #[error("Unexpected tmux output: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TmuxWindow {
    pub session: String,
    pub index: u32,
    pub name: String,
    pub active: bool,
}

impl TmuxWindow {
    /// `session:index` address of this window.
    pub fn target(&self) -> String {
        format!("{}:{}", self.session, self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TmuxSession {
    pub name: String,
    pub attached: bool,
    pub windows: Vec<TmuxWindow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowInfo {
    pub name: String,
    pub active: bool,
    pub panes: u32,
    pub layout: String,
}

#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Type `text` literally into `target`.
    async fn send(&self, target: &str, text: &str) -> Result<(), MuxError>;

    /// Press Enter in `target`.
    async fn submit(&self, target: &str) -> Result<(), MuxError>;

    async fn session_exists(&self, name: &str) -> bool;

    /// Every session with its windows. No server means no sessions.
    async fn list_sessions(&self) -> Result<Vec<TmuxSession>, MuxError>;

    /// The last `lines` lines of the active pane in `target`.
    async fn capture(&self, target: &str, lines: usize) -> Result<String, MuxError>;

    async fn window_info(&self, target: &str) -> Result<WindowInfo, MuxError>;
}

/// Drives a local tmux server.
#[derive(Debug, Clone)]
pub struct TmuxDriver {
    timeout: Duration,
}

impl TmuxDriver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run tmux and return its stdout.
    async fn run(&self, target: &str, args: &[&str]) -> Result<String, MuxError> {
        let output = match tokio::time::timeout(
            self.timeout,
            Command::new("tmux")
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(MuxError::CommandFailed {
                    target: target.to_string(),
                    reason: format!("failed to run tmux: {}", e),
                })
            }
            Err(_) => {
                return Err(MuxError::CommandFailed {
                    target: target.to_string(),
                    reason: format!("tmux timed out after {} seconds", self.timeout.as_secs()),
                })
            }
        };

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("can't find") || stderr.contains("no server running") {
            return Err(MuxError::TargetNotFound(target.to_string()));
        }
        Err(MuxError::CommandFailed {
            target: target.to_string(),
            reason: if stderr.is_empty() {
                format!("tmux exited with {}", output.status)
            } else {
                stderr
            },
        })
    }
}

#[async_trait]
impl Multiplexer for TmuxDriver {
    async fn send(&self, target: &str, text: &str) -> Result<(), MuxError> {
        self.run(target, &["send-keys", "-l", "-t", target, text])
            .await
            .map(drop)
    }

    async fn submit(&self, target: &str) -> Result<(), MuxError> {
        self.run(target, &["send-keys", "-t", target, "C-m"])
            .await
            .map(drop)
    }

    async fn session_exists(&self, name: &str) -> bool {
        let target = format!("={}", name);
        self.run(name, &["has-session", "-t", &target]).await.is_ok()
    }

    async fn list_sessions(&self) -> Result<Vec<TmuxSession>, MuxError> {
        let sessions = match self
            .run("server", &["list-sessions", "-F", SESSIONS_FORMAT])
            .await
        {
            Ok(out) => out,
            Err(MuxError::TargetNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let windows = self
            .run("server", &["list-windows", "-a", "-F", WINDOWS_FORMAT])
            .await?;
        parse_sessions(&sessions, &windows)
    }

    async fn capture(&self, target: &str, lines: usize) -> Result<String, MuxError> {
        let start = format!("-{}", lines);
        self.run(target, &["capture-pane", "-p", "-t", target, "-S", &start])
            .await
    }

    async fn window_info(&self, target: &str) -> Result<WindowInfo, MuxError> {
        let out = self
            .run(target, &["display-message", "-p", "-t", target, WINDOW_INFO_FORMAT])
            .await?;
        parse_window_info(&out)
    }
}

fn flag(value: &str) -> bool {
    value != "0" && !value.is_empty()
}

/// Join `list-sessions` and `list-windows -a` output into sessions.
fn parse_sessions(sessions: &str, windows: &str) -> Result<Vec<TmuxSession>, MuxError> {
    let mut parsed = Vec::new();
    for line in sessions.lines().filter(|l| !l.trim().is_empty()) {
        let (name, attached) = line
            .rsplit_once(':')
            .ok_or_else(|| MuxError::Malformed(line.to_string()))?;
        parsed.push(TmuxSession {
            name: name.to_string(),
            attached: flag(attached),
            windows: Vec::new(),
        });
    }

    for line in windows.lines().filter(|l| !l.trim().is_empty()) {
        let mut parts = line.splitn(4, ':');
        let (Some(session), Some(index), Some(active), Some(name)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(MuxError::Malformed(line.to_string()));
        };
        let index = index
            .parse()
            .map_err(|_| MuxError::Malformed(line.to_string()))?;
        if let Some(owner) = parsed.iter_mut().find(|s| s.name == session) {
            owner.windows.push(TmuxWindow {
                session: session.to_string(),
                index,
                name: name.to_string(),
                active: flag(active),
            });
        }
    }
    Ok(parsed)
}

fn parse_window_info(out: &str) -> Result<WindowInfo, MuxError> {
    let line = out.trim_end_matches('\n');
    let mut parts = line.splitn(4, ':');
    let (Some(active), Some(panes), Some(layout), Some(name)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(MuxError::Malformed(line.to_string()));
    };
    Ok(WindowInfo {
        name: name.to_string(),
        active: flag(active),
        panes: panes
            .parse()
            .map_err(|_| MuxError::Malformed(line.to_string()))?,
        layout: layout.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording multiplexer for tests.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    pub struct FakeMux {
        pub sessions: Vec<String>,
        pub windows: Vec<TmuxWindow>,
        pub panes: HashMap<String, String>,
        pub sent: Mutex<Vec<(String, String)>>,
        pub captures: Mutex<Vec<(String, usize)>>,
        pub fail_delivery: bool,
    }

    impl FakeMux {
        pub fn with_sessions(sessions: &[&str]) -> Self {
            Self {
                sessions: sessions.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }
        }

        /// Add a window showing `content`; its session is created if needed.
        pub fn with_window(mut self, session: &str, index: u32, name: &str, content: &str) -> Self {
            if !self.sessions.iter().any(|s| s == session) {
                self.sessions.push(session.to_string());
            }
            let window = TmuxWindow {
                session: session.to_string(),
                index,
                name: name.to_string(),
                active: index == 0,
            };
            self.panes.insert(window.target(), content.to_string());
            self.windows.push(window);
            self
        }

        pub fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().expect("lock").clone()
        }

        pub fn captures(&self) -> Vec<(String, usize)> {
            self.captures.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl Multiplexer for FakeMux {
        async fn send(&self, target: &str, text: &str) -> Result<(), MuxError> {
            if self.fail_delivery {
                return Err(MuxError::CommandFailed {
                    target: target.to_string(),
                    reason: "pane is dead".to_string(),
                });
            }
            self.sent
                .lock()
                .expect("lock")
                .push((target.to_string(), text.to_string()));
            Ok(())
        }

        async fn submit(&self, target: &str) -> Result<(), MuxError> {
            self.send(target, "<Enter>").await
        }

        async fn session_exists(&self, name: &str) -> bool {
            self.sessions.iter().any(|s| s == name)
        }

        async fn list_sessions(&self) -> Result<Vec<TmuxSession>, MuxError> {
            Ok(self
                .sessions
                .iter()
                .map(|name| TmuxSession {
                    name: name.clone(),
                    attached: false,
                    windows: self
                        .windows
                        .iter()
                        .filter(|w| &w.session == name)
                        .cloned()
                        .collect(),
                })
                .collect())
        }

        async fn capture(&self, target: &str, lines: usize) -> Result<String, MuxError> {
            self.captures
                .lock()
                .expect("lock")
                .push((target.to_string(), lines));
            let content = self
                .panes
                .get(target)
                .ok_or_else(|| MuxError::TargetNotFound(target.to_string()))?;
            let all: Vec<&str> = content.lines().collect();
            let tail = &all[all.len().saturating_sub(lines)..];
            Ok(tail.join("\n"))
        }

        async fn window_info(&self, target: &str) -> Result<WindowInfo, MuxError> {
            let window = self
                .windows
                .iter()
                .find(|w| w.target() == target)
                .ok_or_else(|| MuxError::TargetNotFound(target.to_string()))?;
            Ok(WindowInfo {
                name: window.name.clone(),
                active: window.active,
                panes: 1,
                layout: "b25d,80x24,0,0,1".to_string(),
            })
        }
    }
}
