use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;

use crate::channel::ChannelId;

/// How bad a failed channel read is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Stale but usable; absorbed with a fallback
    Info,
    /// Degraded; absorbed with a fallback
    Warning,
    /// Hard failure; aborts the read
    Error,
}

/// A channel read failed or returned a stale/disabled value
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid value on channel {channel} ({severity}): {reason}")]
pub struct InvalidValueError {
    pub channel: ChannelId,
    pub severity: Severity,
    pub reason: String,
}

impl InvalidValueError {
    pub fn new(channel: ChannelId, severity: Severity, reason: impl Into<String>) -> Self {
        Self {
            channel,
            severity,
            reason: reason.into(),
        }
    }

    /// INFO and WARNING may be replaced by a fallback value
    pub fn is_tolerable(&self) -> bool {
        self.severity != Severity::Error
    }
}

/// Channel store write errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChannelError {
    #[error("write to channel {channel} failed: {reason}")]
    WriteFailed { channel: ChannelId, reason: String },
    #[error("channel {0} is not writable")]
    NotWritable(ChannelId),
}

/// Configuration binding errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("section {section} is missing mandatory fields: {}", fields.join(", "))]
    MissingFields { section: String, fields: Vec<String> },
    #[error("field {section}.{key} is invalid: {reason}")]
    InvalidField {
        section: String,
        key: String,
        reason: String,
    },
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),
}

/// Actuation kinds, used in error and log context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Action {
    Start,
    Stop,
    Set,
    Schedule,
}

/// Errors returned by component actions
#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("component {id} is busy: next write allowed in {remaining_ms}ms")]
    Busy { id: String, remaining_ms: i64 },

    #[error("component {id} cannot {action} yet: {remaining_ms}ms of the minimum interval left")]
    IntervalViolation {
        id: String,
        action: Action,
        remaining_ms: i64,
    },

    #[error("component {id} is in maintenance")]
    MaintenanceActive { id: String },

    #[error("component {id} is disabled")]
    Disabled { id: String },

    #[error(transparent)]
    InvalidValue(#[from] InvalidValueError),

    #[error("component {id} does not support {operation}")]
    Unsupported { id: String, operation: String },

    #[error("component {id} cannot {action}: {reason}")]
    PrerequisiteNotMet {
        id: String,
        action: Action,
        reason: String,
    },

    #[error("component {id}: write not acknowledged within {after_ms}ms")]
    Timeout { id: String, after_ms: u64 },

    #[error("component {id}: write cancelled")]
    Cancelled { id: String },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ComponentError {
    /// Transient conditions that clear by themselves
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ComponentError::Busy { .. }
                | ComponentError::MaintenanceActive { .. }
                | ComponentError::Timeout { .. }
        )
    }

    pub(crate) fn unsupported(id: &str, operation: impl Into<String>) -> Self {
        ComponentError::Unsupported {
            id: id.to_string(),
            operation: operation.into(),
        }
    }
}

/// Orchestrator errors
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("component {0} is already bound")]
    DuplicateComponent(String),
    #[error("component {0} is not bound")]
    UnknownComponent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let e = ComponentError::IntervalViolation {
            id: "hp1".into(),
            action: Action::Stop,
            remaining_ms: 500,
        };
        assert_eq!(
            e.to_string(),
            "component hp1 cannot stop yet: 500ms of the minimum interval left"
        );

        let e = ConfigError::MissingFields {
            section: "rod".into(),
            fields: vec!["state_channel".into(), "min_runtime_s".into()],
        };
        assert_eq!(
            e.to_string(),
            "section rod is missing mandatory fields: state_channel, min_runtime_s"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(ComponentError::Busy { id: "a".into(), remaining_ms: 1 }.is_retryable());
        assert!(!ComponentError::Disabled { id: "a".into() }.is_retryable());
        assert!(!ComponentError::unsupported("a", "island mode").is_retryable());
    }

    #[test]
    fn test_severity_tolerance() {
        let ch = ChannelId::from("x");
        assert!(InvalidValueError::new(ch.clone(), Severity::Info, "stale").is_tolerable());
        assert!(InvalidValueError::new(ch.clone(), Severity::Warning, "stale").is_tolerable());
        assert!(!InvalidValueError::new(ch, Severity::Error, "gone").is_tolerable());
    }
}
