//! Configuration management for the orchestrator.
//!
//! Configuration is resolved once at startup and then shared read-only with
//! every component. Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. A shell-style `KEY=value` file (`TMUX_ORCHESTRATOR_CONFIG`, or
//!    `<home>/security.conf` when present)
//! 3. Process environment variables
//!
//! Recognised keys:
//! - `TMUX_ORCHESTRATOR_HOME` - State root. Defaults to `$HOME/.tmux-orchestrator`.
//! - `MAX_COMMANDS_PER_MINUTE` - Admission limit per calendar minute. Defaults to `30`.
//! - `MAX_MESSAGE_LENGTH` - Maximum note/message length in characters. Defaults to `500`.
//! - `ALLOWED_SESSIONS` - Session allow-list. Empty means unrestricted.
//! - `ALLOWED_COMMANDS` - Ordered command prefixes accepted by `command`.
//! - `ENABLE_SANITIZATION` - Reject `;`, `|`, `&` in commands. Defaults to `true`.
//! - `PROCESS_TIMEOUT` - Seconds allowed for any external process. Defaults to `10`.
//! - `LOG_RETENTION_DAYS` - Audit retention horizon, `0` disables. Defaults to `30`.
//! - `SCHEDULER_BACKEND` - `at` or `poll`. Defaults to `poll`.
//! - `MAX_DELAY_MINUTES` - Longest accepted scheduling delay. Defaults to `1440`.
//! - `TASK_EXPIRY_HOURS` - Age past due after which a task is expired. Defaults to `24`.
//! - `LOCK_TIMEOUT` - Seconds to wait for a state file lock. Defaults to `5`.
//! - `AUDIT_ACTOR` - Identity written to audit records. Defaults to `$USER`.
//! - `MAX_LINES_CAPTURE` - Upper bound on lines read from a pane. Defaults to `1000`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::util::{home_dir, parse_bool, split_list, split_prefix_list, strip_quotes};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Which deferred-execution backend holds scheduled tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Host job queue (`at`); the OS invokes `fire <id>` at the due time.
    At,
    /// Line-record file answered by a periodic `run-due` trigger.
    Poll,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::At => "at",
            BackendKind::Poll => "poll",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "at" | "os" => Ok(BackendKind::At),
            "poll" | "file" => Ok(BackendKind::Poll),
            other => Err(format!("expected 'at' or 'poll', got '{}'", other)),
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of all persisted state
    pub home: PathBuf,

    /// Admissions allowed per calendar minute
    pub max_commands_per_minute: u32,

    /// Maximum length of notes and messages, in characters
    pub max_message_length: usize,

    /// Sessions that may be targeted; empty means any session
    pub allowed_sessions: Vec<String>,

    /// Command prefixes accepted for delivery, in priority order
    pub allowed_commands: Vec<String>,

    /// Reject shell chaining characters in commands
    pub enable_sanitization: bool,

    /// Upper bound on any external process call
    pub process_timeout: Duration,

    /// Audit log retention in days (0 = keep forever)
    pub log_retention_days: u32,

    /// Backend used for new tasks
    pub backend: BackendKind,

    /// Longest accepted scheduling delay
    pub max_delay_minutes: u32,

    /// How long past due a task may sit before it is expired
    pub task_expiry: chrono::Duration,

    /// Upper bound on waiting for a state file lock
    pub lock_timeout: Duration,

    /// Identity recorded in audit records
    pub actor: String,

    /// Most lines a single pane capture may return
    pub max_capture_lines: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::with_home(PathBuf::from(home_dir()).join(".tmux-orchestrator"))
    }
}

impl Config {
    /// Default configuration rooted at `home` (useful for testing).
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            max_commands_per_minute: 30,
            max_message_length: 500,
            allowed_sessions: Vec::new(),
            allowed_commands: [
                "git status",
                "git log",
                "git diff",
                "ls",
                "pwd",
                "cat",
                "echo",
                "cargo check",
                "cargo test",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            enable_sanitization: true,
            process_timeout: Duration::from_secs(10),
            log_retention_days: 30,
            backend: BackendKind::Poll,
            max_delay_minutes: 1440,
            task_expiry: chrono::Duration::hours(24),
            lock_timeout: Duration::from_secs(5),
            actor: std::env::var("USER").unwrap_or_else(|_| "orchestrator".to_string()),
            max_capture_lines: 1000,
        }
    }

    /// Load configuration from the config file (if any) and the environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if any recognised key fails to parse.
    pub fn load() -> Result<Self, ConfigError> {
        let env: HashMap<String, String> = std::env::vars().collect();

        let home = env
            .get("TMUX_ORCHESTRATOR_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(home_dir()).join(".tmux-orchestrator"));

        let file_path = env
            .get("TMUX_ORCHESTRATOR_CONFIG")
            .map(PathBuf::from)
            .or_else(|| Some(home.join("security.conf")).filter(|p| p.exists()));

        let mut values = match file_path {
            Some(path) => {
                let values = read_conf_file(&path)?;
                tracing::debug!(path = %path.display(), keys = values.len(), "Loaded config file");
                values
            }
            None => HashMap::new(),
        };
        values.extend(env);

        let mut config = Self::with_home(home);
        config.apply(&values)?;
        Ok(config)
    }

    /// Overlay recognised keys from `values` onto this configuration.
    pub fn apply(&mut self, values: &HashMap<String, String>) -> Result<(), ConfigError> {
        if let Some(v) = values.get("MAX_COMMANDS_PER_MINUTE") {
            self.max_commands_per_minute = parse_positive("MAX_COMMANDS_PER_MINUTE", v)?;
        }
        if let Some(v) = values.get("MAX_MESSAGE_LENGTH") {
            self.max_message_length = parse_positive::<usize>("MAX_MESSAGE_LENGTH", v)?;
        }
        if let Some(v) = values.get("ALLOWED_SESSIONS") {
            self.allowed_sessions = split_list(v);
        }
        if let Some(v) = values.get("ALLOWED_COMMANDS") {
            self.allowed_commands = split_prefix_list(v);
        }
        if let Some(v) = values.get("ENABLE_SANITIZATION") {
            self.enable_sanitization = parse_bool(v).ok_or_else(|| {
                ConfigError::InvalidValue("ENABLE_SANITIZATION".to_string(), v.clone())
            })?;
        }
        if let Some(v) = values.get("PROCESS_TIMEOUT") {
            self.process_timeout = Duration::from_secs(parse_positive("PROCESS_TIMEOUT", v)?);
        }
        if let Some(v) = values.get("LOG_RETENTION_DAYS") {
            self.log_retention_days = parse_num("LOG_RETENTION_DAYS", v)?;
        }
        if let Some(v) = values.get("SCHEDULER_BACKEND") {
            self.backend = v
                .parse()
                .map_err(|e| ConfigError::InvalidValue("SCHEDULER_BACKEND".to_string(), e))?;
        }
        if let Some(v) = values.get("MAX_DELAY_MINUTES") {
            self.max_delay_minutes = parse_positive("MAX_DELAY_MINUTES", v)?;
        }
        if let Some(v) = values.get("TASK_EXPIRY_HOURS") {
            let hours: i64 = parse_positive("TASK_EXPIRY_HOURS", v)?;
            self.task_expiry = chrono::Duration::try_hours(hours).ok_or_else(|| {
                ConfigError::InvalidValue(
                    "TASK_EXPIRY_HOURS".to_string(),
                    format!("{} hours is out of range", hours),
                )
            })?;
        }
        if let Some(v) = values.get("LOCK_TIMEOUT") {
            self.lock_timeout = Duration::from_secs(parse_positive("LOCK_TIMEOUT", v)?);
        }
        if let Some(v) = values.get("MAX_LINES_CAPTURE") {
            self.max_capture_lines = parse_positive("MAX_LINES_CAPTURE", v)?;
        }
        if let Some(v) = values.get("AUDIT_ACTOR") {
            if !v.trim().is_empty() {
                self.actor = v.trim().to_string();
            }
        }
        Ok(())
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn reminders_dir(&self) -> PathBuf {
        self.home.join("reminders")
    }

    pub fn notes_dir(&self) -> PathBuf {
        self.reminders_dir().join("notes")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.home.join("state")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.logs_dir().join("audit.log")
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.logs_dir().join("errors.log")
    }

    pub fn dispatch_log_path(&self) -> PathBuf {
        self.logs_dir().join("reminders.log")
    }

    pub fn task_store_path(&self) -> PathBuf {
        self.reminders_dir().join("tasks.db")
    }

    pub fn rate_limit_path(&self) -> PathBuf {
        self.state_dir().join("rate_limit")
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue(key.to_string(), format!("{}", e)))
}

fn parse_positive<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let parsed: T = parse_num(key, value)?;
    if parsed <= T::default() {
        return Err(ConfigError::InvalidValue(
            key.to_string(),
            format!("must be greater than zero, got '{}'", value.trim()),
        ));
    }
    Ok(parsed)
}

/// Parse a shell-style `KEY=value` file.
///
/// Blank lines, `#` comments and an optional `export ` prefix are ignored.
fn read_conf_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
    Ok(parse_conf(&contents))
}

fn parse_conf(contents: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        // Only quoted values may contain a trailing comment marker.
        let value = if value.starts_with('"') || value.starts_with('\'') || value.starts_with('(')
        {
            value
        } else {
            value.split(" #").next().unwrap_or(value).trim()
        };
        values.insert(key.trim().to_string(), strip_quotes(value).to_string());
    }
    values
}
