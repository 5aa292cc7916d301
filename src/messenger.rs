//! Validated delivery of messages and whitelisted commands to a window.

use std::sync::Arc;

use crate::audit::{AuditEvent, AuditLog};
use crate::config::Config;
use crate::error::Error;
use crate::rate_limit::{RateLimitError, RateLimiter};
use crate::tmux::{Multiplexer, TmuxDriver};
use crate::validation::{Target, ValidationError, Validator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Payload {
    Message,
    Command,
}

impl Payload {
    fn as_str(&self) -> &'static str {
        match self {
            Payload::Message => "message",
            Payload::Command => "command",
        }
    }
}

pub struct Messenger {
    validator: Validator,
    limiter: RateLimiter,
    audit: AuditLog,
    mux: Arc<dyn Multiplexer>,
}

impl Messenger {
    pub fn new(config: &Config, mux: Arc<dyn Multiplexer>) -> Self {
        Self {
            validator: Validator::new(config),
            limiter: RateLimiter::new(config),
            audit: AuditLog::new(config),
            mux,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config, Arc::new(TmuxDriver::new(config.process_timeout)))
    }

    /// Type `message` into `target` and press Enter.
    pub async fn send_message(&self, target: &str, message: &str) -> Result<Target, Error> {
        self.deliver(target, message, Payload::Message).await
    }

    /// Type a whitelisted `command` into `target` and press Enter.
    pub async fn send_command(&self, target: &str, command: &str) -> Result<Target, Error> {
        self.deliver(target, command, Payload::Command).await
    }

    async fn deliver(&self, target: &str, text: &str, payload: Payload) -> Result<Target, Error> {
        let checked = match self.check(target, text, payload).await {
            Ok(checked) => checked,
            Err(e) => {
                self.audit
                    .record(AuditEvent::ValidationFailure, target, e.to_string())
                    .await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.limiter.admit().await {
            let event = match e {
                RateLimitError::Exceeded { .. } => AuditEvent::RateLimited,
                _ => AuditEvent::Error,
            };
            self.audit.record(event, target, e.to_string()).await;
            return Err(e.into());
        }

        let address = checked.to_string();
        let sent = match self.mux.send(&address, text).await {
            Ok(()) => self.mux.submit(&address).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.audit
                .record(AuditEvent::Error, &address, format!("{} not delivered: {}", payload.as_str(), e))
                .await;
            return Err(e.into());
        }

        self.audit
            .record(
                AuditEvent::Sent,
                &address,
                format!("{}: {}", payload.as_str(), text),
            )
            .await;
        Ok(checked)
    }

    async fn check(&self, target: &str, text: &str, payload: Payload) -> Result<Target, ValidationError> {
        let checked = self.validator.validate_target(target)?;
        if !self.mux.session_exists(&checked.session).await {
            return Err(ValidationError::SessionNotFound(checked.session));
        }
        match payload {
            Payload::Message => self.validator.validate_message(text)?,
            Payload::Command => self.validator.validate_command(text)?,
        }
        Ok(checked)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::audit::Category;
    use crate::tmux::testing::FakeMux;

    fn messenger(dir: &Path, mux: Arc<FakeMux>) -> (Messenger, AuditLog) {
        let mut config = Config::with_home(dir);
        config.allowed_sessions = vec!["agents".to_string(), "main".to_string()];
        (Messenger::new(&config, mux), AuditLog::new(&config))
    }

    #[tokio::test]
    async fn message_is_sent_literally_then_entered() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mux = Arc::new(FakeMux::with_sessions(&["agents"]));
        let (messenger, audit) = messenger(temp.path(), mux.clone());

        let target = messenger
            .send_message("agents:2", "Please run the tests again")
            .await
            .expect("send");
        assert_eq!(target.to_string(), "agents:2");
        assert_eq!(
            mux.sent(),
            vec![
                ("agents:2".to_string(), "Please run the tests again".to_string()),
                ("agents:2".to_string(), "<Enter>".to_string()),
            ]
        );
        let records = audit.records().await;
        assert_eq!(records[0].category, Category::Command);
        assert_eq!(records[0].target_or_kind, "agents:2");
    }

    #[tokio::test]
    async fn rejects_before_touching_the_multiplexer() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mux = Arc::new(FakeMux::with_sessions(&["agents", "other"]));
        let (messenger, audit) = messenger(temp.path(), mux.clone());

        let cases = [
            ("agents", "hi"),
            ("other:1", "hi"),
            ("main:1", "hi"),
            ("agents:1", "echo `whoami`"),
        ];
        for (target, message) in cases {
            let err = messenger.send_message(target, message).await.unwrap_err();
            assert_eq!(err.exit_code(), 2, "{} {}", target, message);
        }
        assert!(mux.sent().is_empty());
        assert_eq!(audit.records().await.len(), cases.len());
    }

    #[tokio::test]
    async fn missing_session_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mux = Arc::new(FakeMux::with_sessions(&["agents"]));
        let (messenger, _) = messenger(temp.path(), mux);

        let err = messenger.send_message("main:0", "hello").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::SessionNotFound(ref s)) if s == "main"
        ));
    }

    #[tokio::test]
    async fn commands_follow_whitelist_and_sanitization() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mux = Arc::new(FakeMux::with_sessions(&["agents"]));
        let (messenger, _) = messenger(temp.path(), mux.clone());

        messenger
            .send_command("agents:0", "git status --short")
            .await
            .expect("whitelisted");
        assert!(matches!(
            messenger.send_command("agents:0", "rm -rf /").await,
            Err(Error::Validation(ValidationError::NotWhitelisted(_)))
        ));
        assert!(matches!(
            messenger.send_command("agents:0", "git status; rm -rf /").await,
            Err(Error::Validation(ValidationError::DangerousChars { found: ';' }))
        ));
        // A line feed would submit the whitelisted prefix and type a second command.
        assert!(matches!(
            messenger.send_command("agents:0", "git status\nrm -rf ~").await,
            Err(Error::Validation(ValidationError::ControlChar { found: '\n', .. }))
        ));
        assert_eq!(mux.sent().len(), 2);
    }

    #[tokio::test]
    async fn delivery_failure_is_audited() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mux = Arc::new(FakeMux {
            sessions: vec!["agents".to_string()],
            fail_delivery: true,
            ..Default::default()
        });
        let (messenger, audit) = messenger(temp.path(), mux);

        let err = messenger.send_message("agents:1", "hello").await.unwrap_err();
        assert!(matches!(err, Error::Multiplexer(_)));
        let records = audit.records().await;
        assert_eq!(records.last().map(|r| r.event_type), Some(AuditEvent::Error));
    }
}
