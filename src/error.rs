// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for the session engine.
//!
//! Four categories, each with its own propagation policy:
//!
//! - [`EngineError::Configuration`]: invalid timer relationships. Fatal at
//!   construction; never detected at runtime.
//! - [`EngineError::TransientIo`]: persisted-store or network failures.
//!   Retried with backoff, logged, and never a logout trigger on their own.
//! - [`EngineError::SecurityViolation`]: lockout, multi-session, suspicious
//!   threshold. Always surfaced and typically fatal to the session.
//! - [`EngineError::ProtocolInconsistency`]: malformed cross-tab message.
//!   Logged and dropped; must never crash the message handler.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Convenience alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Security violations that terminate (or refuse to start) a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum SecurityViolation {
    /// Login suppressed until the lockout window ends.
    LockedOut {
        until: DateTime<Utc>,
        reason: String,
    },
    /// More concurrently live sessions than the configured cap.
    TooManySessions { active: usize, limit: usize },
    /// Rolling-window count of medium/high suspicious events crossed the
    /// alert threshold.
    SuspiciousThreshold { events_in_window: usize },
}

impl fmt::Display for SecurityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockedOut { until, reason } => {
                write!(f, "locked out until {} ({})", until.to_rfc3339(), reason)
            }
            Self::TooManySessions { active, limit } => {
                write!(f, "{active} concurrent sessions exceeds limit of {limit}")
            }
            Self::SuspiciousThreshold { events_in_window } => {
                write!(f, "{events_in_window} suspicious events inside the rolling window")
            }
        }
    }
}

/// Top-level engine error.
#[derive(Debug)]
pub enum EngineError {
    /// Invalid configuration, e.g. `idle_warning_lead >= idle_timeout`.
    Configuration(String),
    /// A store or network operation failed. Retryable.
    TransientIo {
        op: &'static str,
        source: std::io::Error,
    },
    /// A security policy fired.
    SecurityViolation(SecurityViolation),
    /// A peer context wrote something we cannot parse.
    ProtocolInconsistency(String),
}

impl EngineError {
    /// Shorthand for a configuration failure.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Wrap an I/O failure with the operation that produced it.
    pub fn transient(op: &'static str, source: std::io::Error) -> Self {
        Self::TransientIo { op, source }
    }

    /// True when retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo { .. })
    }

    /// Stable event code used in audit log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIG_INVALID",
            Self::TransientIo { .. } => "IO_TRANSIENT",
            Self::SecurityViolation(_) => "SECURITY_VIOLATION",
            Self::ProtocolInconsistency(_) => "PROTOCOL_INCONSISTENCY",
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "invalid configuration: {msg}"),
            Self::TransientIo { op, source } => {
                write!(f, "transient I/O failure during {op}: {source}")
            }
            Self::SecurityViolation(v) => write!(f, "security violation: {v}"),
            Self::ProtocolInconsistency(msg) => write!(f, "protocol inconsistency: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::TransientIo { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<SecurityViolation> for EngineError {
    fn from(v: SecurityViolation) -> Self {
        Self::SecurityViolation(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_configuration() {
        let err = EngineError::config("idle warning lead must be shorter than idle timeout");
        let text = err.to_string();
        assert!(text.contains("invalid configuration"));
        assert!(text.contains("idle warning lead"));
    }

    #[test]
    fn test_transient_detection() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = EngineError::transient("store.set", io);
        assert!(err.is_transient());
        assert_eq!(err.code(), "IO_TRANSIENT");
        assert!(!EngineError::config("x").is_transient());
    }

    #[test]
    fn test_violation_display() {
        let v = SecurityViolation::TooManySessions { active: 5, limit: 3 };
        assert!(v.to_string().contains("5 concurrent sessions"));
        let err: EngineError = v.into();
        assert_eq!(err.code(), "SECURITY_VIOLATION");
    }
}
