//! Input validation for targets, notes and commands.
//!
//! Every value that eventually reaches the multiplexer, a generated script or
//! a task record passes through here first. Checks are pure: callers decide
//! what to audit.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::config::Config;

/// Shell metacharacters never accepted in notes or messages.
pub const DISALLOWED_NOTE_CHARS: &[char] =
    &['`', '$', '(', ')', '{', '}', '[', ']', '<', '>', '|'];

/// Command chaining characters rejected while sanitization is enabled.
pub const DANGEROUS_COMMAND_CHARS: &[char] = &[';', '|', '&'];

fn target_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<session>[A-Za-z0-9_-]+):(?P<window>[0-9]+)$").expect("valid regex")
    })
}

/// A validated `session:window` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub session: String,
    pub window: String,
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.session, self.window)
    }
}

/// Rejections produced by the validator.
///
/// Messages name what was rejected and what would have been accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid target '{0}': expected session:window (letters, digits, '-', '_' then a window number)")]
    InvalidFormat(String),

    #[error("Unknown target session '{session}': allowed sessions are {allowed}")]
    UnknownTarget { session: String, allowed: String },

    #[error("Target session '{0}' does not exist")]
    SessionNotFound(String),

    #[error("{0} cannot be empty")]
    Empty(&'static str),

    #[error("{field} is too long: {len} characters (maximum {max})")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{field} contains disallowed character {found:?}; remove any of ` $ ( ) {{ }} [ ] < > | and control characters")]
    DisallowedChars { field: &'static str, found: char },

    #[error("{field} contains control character {found:?}; commands must be a single line of printable text")]
    ControlChar { field: &'static str, found: char },

    #[error("Command '{0}' is not whitelisted; it must start with one of the configured ALLOWED_COMMANDS")]
    NotWhitelisted(String),

    #[error("Command contains dangerous character {found:?}; ';', '|' and '&' are rejected while sanitization is enabled")]
    DangerousChars { found: char },

    #[error("Delay of {minutes} minutes is out of range (accepted: 1 to {max})")]
    DelayOutOfRange { minutes: i64, max: u32 },

    #[error("{0}")]
    Task(#[from] crate::task::TaskError),
}

/// Format, allow-list and character checks.
#[derive(Debug, Clone)]
pub struct Validator {
    max_message_length: usize,
    allowed_sessions: Vec<String>,
    allowed_commands: Vec<String>,
    sanitize: bool,
    max_delay_minutes: u32,
}

impl Validator {
    pub fn new(config: &Config) -> Self {
        Self {
            max_message_length: config.max_message_length,
            allowed_sessions: config.allowed_sessions.clone(),
            allowed_commands: config.allowed_commands.clone(),
            sanitize: config.enable_sanitization,
            max_delay_minutes: config.max_delay_minutes,
        }
    }

    /// Check a `session:window` target.
    ///
    /// The session must be in the allow-list when one is configured.
    pub fn validate_target(&self, target: &str) -> Result<Target, ValidationError> {
        let caps = target_pattern()
            .captures(target)
            .ok_or_else(|| ValidationError::InvalidFormat(target.to_string()))?;
        let session = caps["session"].to_string();
        let window = caps["window"].to_string();

        if !self.allowed_sessions.is_empty() && !self.allowed_sessions.contains(&session) {
            return Err(ValidationError::UnknownTarget {
                session,
                allowed: self.allowed_sessions.join(", "),
            });
        }
        Ok(Target { session, window })
    }

    /// Check free text destined for a task note or a window.
    pub fn validate_note(&self, note: &str) -> Result<(), ValidationError> {
        check_text("Note", note, self.max_message_length)
    }

    /// Check a message sent verbatim to a window.
    pub fn validate_message(&self, message: &str) -> Result<(), ValidationError> {
        check_text("Message", message, self.max_message_length)
    }

    /// Check a command against the configured whitelist and length limit.
    pub fn validate_command(&self, command: &str) -> Result<(), ValidationError> {
        let len = command.chars().count();
        if len > self.max_message_length {
            return Err(ValidationError::TooLong {
                field: "Command",
                len,
                max: self.max_message_length,
            });
        }
        validate_command(command, &self.allowed_commands, self.sanitize)
    }

    /// Check a scheduling delay in minutes.
    pub fn validate_delay(&self, minutes: i64) -> Result<(), ValidationError> {
        if minutes < 1 || minutes > i64::from(self.max_delay_minutes) {
            return Err(ValidationError::DelayOutOfRange {
                minutes,
                max: self.max_delay_minutes,
            });
        }
        Ok(())
    }
}

fn check_text(field: &'static str, text: &str, max: usize) -> Result<(), ValidationError> {
    if text.is_empty() {
        return Err(ValidationError::Empty(field));
    }
    let len = text.chars().count();
    if len > max {
        return Err(ValidationError::TooLong { field, len, max });
    }
    if let Some(found) = text
        .chars()
        .find(|c| DISALLOWED_NOTE_CHARS.contains(c) || c.is_control())
    {
        return Err(ValidationError::DisallowedChars { field, found });
    }
    Ok(())
}

/// Accept `command` only if it starts with a whitelist entry (case-sensitive).
///
/// Control characters are always rejected: a line feed typed into a pane
/// submits whatever precedes it, so `ls\nrm` would run two commands. With
/// `sanitize` set, `;`, `|` and `&` are rejected too.
pub fn validate_command(
    command: &str,
    whitelist: &[String],
    sanitize: bool,
) -> Result<(), ValidationError> {
    if command.trim().is_empty() {
        return Err(ValidationError::Empty("Command"));
    }
    if !whitelist
        .iter()
        .any(|prefix| !prefix.is_empty() && command.starts_with(prefix.as_str()))
    {
        return Err(ValidationError::NotWhitelisted(command.to_string()));
    }
    if let Some(found) = command.chars().find(|c| c.is_control()) {
        return Err(ValidationError::ControlChar {
            field: "Command",
            found,
        });
    }
    if sanitize {
        if let Some(found) = command.chars().find(|c| DANGEROUS_COMMAND_CHARS.contains(c)) {
            return Err(ValidationError::DangerousChars { found });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> Validator {
        Validator::new(&Config::with_home("/tmp/unused"))
    }

    fn restricted() -> Validator {
        let mut config = Config::with_home("/tmp/unused");
        config.allowed_sessions = vec!["main".to_string(), "agent-2".to_string()];
        Validator::new(&config)
    }

    #[test]
    fn target_accepts_session_colon_window() {
        let v = validator();
        let target = v.validate_target("my_proj-1:12").expect("valid");
        assert_eq!(target.session, "my_proj-1");
        assert_eq!(target.window, "12");
        assert_eq!(target.to_string(), "my_proj-1:12");
    }

    #[test]
    fn target_rejects_malformed_input() {
        let v = validator();
        for bad in [
            "", "main", "main:", ":0", "main:-1", "main:1.2", "ma in:0", "main:0;ls", "a:b",
            "main:0:1", "../x:0",
        ] {
            assert_eq!(
                v.validate_target(bad),
                Err(ValidationError::InvalidFormat(bad.to_string())),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn target_honours_allow_list() {
        let v = restricted();
        assert!(v.validate_target("agent-2:0").is_ok());
        match v.validate_target("other:0") {
            Err(ValidationError::UnknownTarget { session, .. }) => assert_eq!(session, "other"),
            other => panic!("expected UnknownTarget, got {other:?}"),
        }
        // Membership is verbatim, not prefix or case-insensitive.
        assert!(v.validate_target("Main:0").is_err());
        assert!(v.validate_target("mai:0").is_err());
    }

    #[test]
    fn note_rejects_empty_long_and_metacharacters() {
        let v = validator();
        assert!(v.validate_note("Check deployment status").is_ok());
        assert_eq!(v.validate_note(""), Err(ValidationError::Empty("Note")));

        let long = "x".repeat(501);
        assert_eq!(
            v.validate_note(&long),
            Err(ValidationError::TooLong {
                field: "Note",
                len: 501,
                max: 500
            })
        );
        assert!(v.validate_note(&"x".repeat(500)).is_ok());

        for c in DISALLOWED_NOTE_CHARS {
            let note = format!("before {c} after");
            assert_eq!(
                v.validate_note(&note),
                Err(ValidationError::DisallowedChars {
                    field: "Note",
                    found: *c
                })
            );
        }
        assert!(matches!(
            v.validate_note("test $(rm -rf /)"),
            Err(ValidationError::DisallowedChars { found: '$', .. })
        ));
        assert!(v.validate_note("line\nbreak").is_err());
    }

    #[test]
    fn note_length_counts_characters_not_bytes() {
        let v = validator();
        assert!(v.validate_note(&"é".repeat(500)).is_ok());
    }

    #[test]
    fn note_length_follows_configuration() {
        let mut config = Config::with_home("/tmp/unused");
        config.max_message_length = 5;
        let v = Validator::new(&config);
        assert!(v.validate_note("12345").is_ok());
        assert!(v.validate_note("123456").is_err());
    }

    #[test]
    fn command_requires_whitelisted_prefix() {
        let whitelist = vec!["git status".to_string(), "ls".to_string()];
        assert!(validate_command("git status --short", &whitelist, true).is_ok());
        assert!(validate_command("ls -la", &whitelist, true).is_ok());
        assert_eq!(
            validate_command("Git status", &whitelist, true),
            Err(ValidationError::NotWhitelisted("Git status".to_string()))
        );
        assert!(validate_command("rm -rf /", &whitelist, true).is_err());
        assert!(validate_command("anything", &[], true).is_err());
    }

    #[test]
    fn command_chaining_rejected_unless_sanitization_disabled() {
        let whitelist = vec!["ls".to_string()];
        for cmd in ["ls; rm -rf /", "ls | sh", "ls && reboot"] {
            assert!(matches!(
                validate_command(cmd, &whitelist, true),
                Err(ValidationError::DangerousChars { .. })
            ));
            assert!(validate_command(cmd, &whitelist, false).is_ok());
        }
    }

    #[test]
    fn command_control_characters_rejected_even_without_sanitization() {
        let whitelist = vec!["ls".to_string()];
        for (cmd, found) in [("ls\nrm -rf ~", '\n'), ("ls\rrm", '\r'), ("ls\x03", '\x03')] {
            for sanitize in [true, false] {
                assert_eq!(
                    validate_command(cmd, &whitelist, sanitize),
                    Err(ValidationError::ControlChar {
                        field: "Command",
                        found
                    }),
                    "{cmd:?} sanitize={sanitize}"
                );
            }
        }
    }

    #[test]
    fn command_length_follows_configuration() {
        let mut config = Config::with_home("/tmp/unused");
        config.max_message_length = 10;
        config.allowed_commands = vec!["ls".to_string()];
        let v = Validator::new(&config);
        assert!(v.validate_command("ls -la /tm").is_ok());
        assert_eq!(
            v.validate_command("ls -la /tmp"),
            Err(ValidationError::TooLong {
                field: "Command",
                len: 11,
                max: 10
            })
        );
    }

    #[test]
    fn delay_bounds() {
        let v = validator();
        assert!(v.validate_delay(1).is_ok());
        assert!(v.validate_delay(1440).is_ok());
        assert!(v.validate_delay(0).is_err());
        assert!(v.validate_delay(-5).is_err());
        assert_eq!(
            v.validate_delay(20000),
            Err(ValidationError::DelayOutOfRange {
                minutes: 20000,
                max: 1440
            })
        );
    }
}
