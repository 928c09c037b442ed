// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Engine configuration.
//!
//! Every recognized option lives here, in milliseconds for the timer-shaped
//! ones so the struct round-trips through JSON without custom serde. Timer
//! relationships are validated once, at construction; the monitors refuse to
//! start from an unvalidated config, so a bad lead/timeout pair can never
//! surface as a runtime failure.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Default idle timeout: 30 minutes.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 1_800_000;

/// Default warning lead before idle logout: 60 seconds.
pub const DEFAULT_IDLE_WARNING_LEAD_MS: u64 = 60_000;

/// Default absolute session cap: 8 hours.
pub const DEFAULT_SESSION_MAX_DURATION_MS: u64 = 28_800_000;

/// Default warning lead before session expiry: 30 minutes.
pub const DEFAULT_SESSION_WARNING_LEAD_MS: u64 = 1_800_000;

/// Default heartbeat interval: 30 seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Default lockout window after repeated failed logins: 15 minutes.
pub const DEFAULT_LOCKOUT_DURATION_MS: u64 = 900_000;

/// All recognized engine options.
///
/// Durations are stored as milliseconds; accessor methods hand out
/// [`Duration`] values for the timer code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum inactivity before forced logout.
    pub idle_timeout_ms: u64,
    /// How long before the idle timeout the warning countdown starts.
    pub idle_warning_lead_ms: u64,
    /// Absolute cap on session lifetime, independent of activity.
    pub session_max_duration_ms: u64,
    /// How long before session expiry the warning countdown starts.
    pub session_warning_lead_ms: u64,
    /// Liveness signal period.
    pub heartbeat_interval_ms: u64,
    /// Consecutive failed logins before lockout.
    pub max_failed_attempts: u32,
    /// Lockout window length.
    pub lockout_duration_ms: u64,
    /// Concurrent same-user sessions tolerated before a force-logout sweep.
    pub max_concurrent_sessions: usize,
    /// Activity pulse throttle window.
    pub throttle_delay_ms: u64,
    /// How often peer contexts poll the shared broadcast slot.
    pub poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            idle_warning_lead_ms: DEFAULT_IDLE_WARNING_LEAD_MS,
            session_max_duration_ms: DEFAULT_SESSION_MAX_DURATION_MS,
            session_warning_lead_ms: DEFAULT_SESSION_WARNING_LEAD_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            max_failed_attempts: 5,
            lockout_duration_ms: DEFAULT_LOCKOUT_DURATION_MS,
            max_concurrent_sessions: 3,
            throttle_delay_ms: 150,
            poll_interval_ms: 1_000,
        }
    }
}

impl EngineConfig {
    /// Validate timer relationships, consuming and returning the config so
    /// construction sites read as `EngineConfig { .. }.validated()?`.
    pub fn validated(self) -> EngineResult<Self> {
        self.validate()?;
        Ok(self)
    }

    /// Check every invariant the monitors rely on.
    pub fn validate(&self) -> EngineResult<()> {
        for (name, value) in [
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("idle_warning_lead_ms", self.idle_warning_lead_ms),
            ("session_max_duration_ms", self.session_max_duration_ms),
            ("session_warning_lead_ms", self.session_warning_lead_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("lockout_duration_ms", self.lockout_duration_ms),
            ("throttle_delay_ms", self.throttle_delay_ms),
            ("poll_interval_ms", self.poll_interval_ms),
        ] {
            if value == 0 {
                return Err(EngineError::config(format!("{name} must be non-zero")));
            }
        }
        if self.idle_warning_lead_ms >= self.idle_timeout_ms {
            return Err(EngineError::config(format!(
                "idle_warning_lead_ms ({}) must be shorter than idle_timeout_ms ({})",
                self.idle_warning_lead_ms, self.idle_timeout_ms
            )));
        }
        if self.session_warning_lead_ms >= self.session_max_duration_ms {
            return Err(EngineError::config(format!(
                "session_warning_lead_ms ({}) must be shorter than session_max_duration_ms ({})",
                self.session_warning_lead_ms, self.session_max_duration_ms
            )));
        }
        if self.max_failed_attempts == 0 {
            return Err(EngineError::config("max_failed_attempts must be at least 1"));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(EngineError::config("max_concurrent_sessions must be at least 1"));
        }
        Ok(())
    }

    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| EngineError::transient("config.read", e))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| EngineError::config(format!("{}: {e}", path.display())))?;
        config.validated()
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn idle_warning_lead(&self) -> Duration {
        Duration::from_millis(self.idle_warning_lead_ms)
    }

    pub fn session_max_duration(&self) -> Duration {
        Duration::from_millis(self.session_max_duration_ms)
    }

    pub fn session_warning_lead(&self) -> Duration {
        Duration::from_millis(self.session_warning_lead_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn lockout_duration(&self) -> Duration {
        Duration::from_millis(self.lockout_duration_ms)
    }

    pub fn throttle_delay(&self) -> Duration {
        Duration::from_millis(self.throttle_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Heartbeat silence past this point means the owning context is frozen
    /// or gone.
    pub fn heartbeat_silence_limit(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms * 3)
    }
}
