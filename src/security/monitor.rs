// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Failed-attempt lockout and suspicious-activity detection.
//!
//! Lockout policy: after `max_failed_attempts` consecutive failures the
//! account is locked for `lockout_duration`; attempts during the lockout are
//! rejected without consuming a new attempt slot. The lockout record is
//! persisted so a page reload cannot wash it away, and its end time only
//! ever moves forward while failures accumulate.
//!
//! Suspicious events land in a bounded ring (not an audit log of record);
//! severity is a static lookup by kind. Critical kinds force logout
//! immediately instead of showing a dismissible warning.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use crate::config::EngineConfig;
use crate::error::{EngineResult, SecurityViolation};
use crate::events::{EngineEvent, EventBus};
use crate::security::locks::{resilient_read, resilient_write};
use crate::session::TerminationReason;
use crate::store::{KeyValueStore, KEY_LOCKOUT};

/// Ring buffer cap. Oldest events are evicted past this.
pub const MAX_SUSPICIOUS_EVENTS: usize = 1000;

/// Medium/high events inside the rolling window before escalation.
pub const DEFAULT_ALERT_THRESHOLD: usize = 10;

/// Rolling window for escalation counting: 1 hour.
const ALERT_WINDOW_SECS: i64 = 3600;

/// Suspicious-activity categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspiciousKind {
    /// More live sessions for one user than the configured cap.
    MultipleSessions,
    /// Two contexts claiming the same session id.
    DuplicateSession,
    /// Navigation rate beyond anything a human produces.
    ExcessiveNavigation,
    /// Environment fingerprint changed mid-session.
    AnomalousEnvironment,
    /// Click cadence automation signature.
    RapidClicking,
    /// The rolling-window count itself crossed the alert threshold.
    ThresholdExceeded,
    /// Lockout engaged after repeated failed logins.
    AccountLocked,
}

impl SuspiciousKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MultipleSessions => "multiple_sessions",
            Self::DuplicateSession => "duplicate_session",
            Self::ExcessiveNavigation => "excessive_navigation",
            Self::AnomalousEnvironment => "anomalous_environment",
            Self::RapidClicking => "rapid_clicking",
            Self::ThresholdExceeded => "threshold_exceeded",
            Self::AccountLocked => "account_locked",
        }
    }

    /// Static severity lookup.
    pub fn severity(&self) -> Severity {
        SEVERITY_TABLE.get(self).copied().unwrap_or(Severity::Low)
    }

    /// Critical kinds force logout immediately rather than presenting a
    /// dismissible warning.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::MultipleSessions | Self::ThresholdExceeded | Self::AccountLocked
        )
    }
}

static SEVERITY_TABLE: Lazy<HashMap<SuspiciousKind, Severity>> = Lazy::new(|| {
    HashMap::from([
        (SuspiciousKind::MultipleSessions, Severity::High),
        (SuspiciousKind::DuplicateSession, Severity::High),
        (SuspiciousKind::ExcessiveNavigation, Severity::Medium),
        (SuspiciousKind::AnomalousEnvironment, Severity::Medium),
        (SuspiciousKind::RapidClicking, Severity::Low),
        (SuspiciousKind::ThresholdExceeded, Severity::High),
        (SuspiciousKind::AccountLocked, Severity::High),
    ])
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// One recorded suspicious event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspiciousEvent {
    pub kind: SuspiciousKind,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub detail: String,
}

/// Persisted lockout record. Survives reloads; `end_time` is monotonically
/// non-decreasing while failures accumulate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockoutRecord {
    pub end_time: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Default)]
struct SecurityState {
    failed_attempts: u32,
    lockout_until: Option<DateTime<Utc>>,
    suspicious: VecDeque<SuspiciousEvent>,
}

/// Tracks failed logins and suspicious behavior across sessions.
pub struct SecurityMonitor {
    max_failed_attempts: u32,
    lockout_duration: ChronoDuration,
    alert_threshold: usize,
    state: RwLock<SecurityState>,
    store: Arc<dyn KeyValueStore>,
    bus: EventBus,
}

impl SecurityMonitor {
    /// Build a monitor, rehydrating any persisted lockout so a reload cannot
    /// clear an active lockout window.
    pub fn new(config: &EngineConfig, store: Arc<dyn KeyValueStore>, bus: EventBus) -> Self {
        let mut state = SecurityState::default();
        match store.get(KEY_LOCKOUT) {
            Ok(Some(raw)) => match serde_json::from_str::<LockoutRecord>(&raw) {
                Ok(record) if record.end_time > Utc::now() => {
                    tracing::warn!(
                        "LOCKOUT_RESTORED | until={} reason={}",
                        record.end_time.to_rfc3339(),
                        record.reason
                    );
                    state.lockout_until = Some(record.end_time);
                }
                Ok(_) => {
                    // expired record: clean it up, best effort
                    let _ = store.remove(KEY_LOCKOUT);
                }
                Err(e) => {
                    tracing::warn!("PROTOCOL_INCONSISTENCY | key={KEY_LOCKOUT} error={e}");
                    let _ = store.remove(KEY_LOCKOUT);
                }
            },
            Ok(None) => {}
            Err(e) => tracing::warn!("IO_TRANSIENT | op=lockout.load error={e}"),
        }

        Self {
            max_failed_attempts: config.max_failed_attempts,
            lockout_duration: ChronoDuration::milliseconds(config.lockout_duration_ms as i64),
            alert_threshold: DEFAULT_ALERT_THRESHOLD,
            state: RwLock::new(state),
            store,
            bus,
        }
    }

    /// Record a failed login attempt. Returns `true` when the account is now
    /// (or already was) locked out.
    pub fn record_failed_attempt(&self) -> bool {
        self.record_failed_attempt_at(Utc::now())
    }

    pub(crate) fn record_failed_attempt_at(&self, now: DateTime<Utc>) -> bool {
        let mut state = resilient_write(&self.state);

        if let Some(until) = state.lockout_until {
            if now < until {
                // rejected without consuming an attempt slot
                tracing::warn!("LOGIN_REJECTED_LOCKED | until={}", until.to_rfc3339());
                return true;
            }
            // lockout elapsed: the failure window starts over
            state.lockout_until = None;
            state.failed_attempts = 0;
        }

        state.failed_attempts += 1;
        tracing::info!(
            "LOGIN_FAILED | attempt={}/{}",
            state.failed_attempts,
            self.max_failed_attempts
        );
        if state.failed_attempts < self.max_failed_attempts {
            return false;
        }

        let reason = format!("{} consecutive failed attempts", state.failed_attempts);
        let mut until = now + self.lockout_duration;
        // end time never moves backward while failures accumulate
        if let Some(previous) = state.lockout_until {
            until = until.max(previous);
        }
        state.lockout_until = Some(until);
        drop(state);

        self.persist_lockout(&LockoutRecord {
            end_time: until,
            reason: reason.clone(),
        });
        tracing::warn!("LOCKOUT_SET | until={} reason={}", until.to_rfc3339(), reason);
        self.bus.emit(EngineEvent::SecurityLockout { until, reason });
        self.record_event_at(now, SuspiciousKind::AccountLocked, "failed-attempt lockout");
        true
    }

    /// Record a successful login: clears the counter and any lockout.
    pub fn record_success(&self) {
        {
            let mut state = resilient_write(&self.state);
            state.failed_attempts = 0;
            state.lockout_until = None;
        }
        if let Err(e) = self.store.remove(KEY_LOCKOUT) {
            tracing::warn!("IO_TRANSIENT | op=lockout.clear error={e}");
        }
        tracing::info!("LOGIN_SUCCESS | lockout_cleared=true");
    }

    /// Current lockout, if one is active.
    pub fn locked_out(&self) -> Option<DateTime<Utc>> {
        self.locked_out_at(Utc::now())
    }

    pub(crate) fn locked_out_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        resilient_read(&self.state)
            .lockout_until
            .filter(|until| *until > now)
    }

    /// Violation form of [`locked_out`](Self::locked_out), for the login gate.
    pub fn check_login_allowed(&self) -> Result<(), SecurityViolation> {
        match self.locked_out() {
            Some(until) => Err(SecurityViolation::LockedOut {
                until,
                reason: "failed-attempt lockout".to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Record a suspicious signal. Returns `true` when the rolling-window
    /// count of medium/high events has reached the alert threshold.
    pub fn detect_suspicious(&self, kind: SuspiciousKind, detail: &str) -> bool {
        self.detect_suspicious_at(Utc::now(), kind, detail)
    }

    pub(crate) fn detect_suspicious_at(
        &self,
        now: DateTime<Utc>,
        kind: SuspiciousKind,
        detail: &str,
    ) -> bool {
        let windowed = self.record_event_at(now, kind, detail);

        if kind.is_critical() {
            self.force_logout(kind);
        }

        let exceeded = windowed >= self.alert_threshold;
        // escalate exactly at the crossing so a noisy hour cannot fire a
        // forced logout per event
        if exceeded && windowed == self.alert_threshold && !kind.is_critical() {
            self.record_event_at(
                now,
                SuspiciousKind::ThresholdExceeded,
                "rolling window alert threshold reached",
            );
            self.force_logout(SuspiciousKind::ThresholdExceeded);
        }
        exceeded
    }

    /// Number of events currently held in the ring.
    pub fn suspicious_event_count(&self) -> usize {
        resilient_read(&self.state).suspicious.len()
    }

    /// Administrative reset: clears attempts, lockout, and the event ring.
    pub fn reset(&self) {
        {
            let mut state = resilient_write(&self.state);
            *state = SecurityState::default();
        }
        if let Err(e) = self.store.remove(KEY_LOCKOUT) {
            tracing::warn!("IO_TRANSIENT | op=lockout.clear error={e}");
        }
        tracing::info!("SECURITY_RESET | by=admin");
    }

    /// Append to the ring and return the medium/high count inside the
    /// rolling window (including this event).
    fn record_event_at(&self, now: DateTime<Utc>, kind: SuspiciousKind, detail: &str) -> usize {
        let severity = kind.severity();
        let critical = kind.is_critical();
        let mut state = resilient_write(&self.state);
        state.suspicious.push_back(SuspiciousEvent {
            kind,
            timestamp: now,
            severity,
            detail: detail.to_string(),
        });
        while state.suspicious.len() > MAX_SUSPICIOUS_EVENTS {
            state.suspicious.pop_front();
        }
        let window_start = now - ChronoDuration::seconds(ALERT_WINDOW_SECS);
        let windowed = state
            .suspicious
            .iter()
            .filter(|e| e.timestamp > window_start && e.severity >= Severity::Medium)
            .count();
        drop(state);

        tracing::warn!(
            "SUSPICIOUS_EVENT | kind={} severity={:?} windowed={}",
            kind.as_str(),
            severity,
            windowed
        );
        self.bus.emit(EngineEvent::SecurityAlert {
            kind,
            detail: detail.to_string(),
            critical,
        });
        windowed
    }

    fn force_logout(&self, kind: SuspiciousKind) {
        tracing::warn!("SECURITY_FORCED_LOGOUT | kind={}", kind.as_str());
        self.bus.emit(EngineEvent::ForcedLogout {
            reason: TerminationReason::SecurityForced,
            message: TerminationReason::SecurityForced.user_message().to_string(),
        });
    }

    fn persist_lockout(&self, record: &LockoutRecord) {
        let raw = match serde_json::to_string(record) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!("LOCKOUT_PERSIST_FAILED | error={e}");
                return;
            }
        };
        // a transient store failure must not turn into a logout or a panic
        if let Err(e) = self.store.set(KEY_LOCKOUT, &raw) {
            tracing::warn!("IO_TRANSIENT | op=lockout.persist error={e}");
        }
    }
}

/// Rehydrate the persisted lockout record without a monitor. Used by the
/// standalone agent's status command.
pub fn load_lockout(store: &dyn KeyValueStore) -> EngineResult<Option<LockoutRecord>> {
    match store.get(KEY_LOCKOUT)? {
        Some(raw) => Ok(serde_json::from_str(&raw).ok()),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn monitor_with(store: Arc<MemoryStore>) -> (SecurityMonitor, EventBus) {
        let config = EngineConfig {
            max_failed_attempts: 3,
            lockout_duration_ms: 900_000,
            ..EngineConfig::default()
        };
        let bus = EventBus::new();
        (SecurityMonitor::new(&config, store, bus.clone()), bus)
    }

    #[test]
    fn test_lockout_after_max_failures() {
        let (monitor, _bus) = monitor_with(Arc::new(MemoryStore::new()));
        let now = Utc::now();
        assert!(!monitor.record_failed_attempt_at(now));
        assert!(!monitor.record_failed_attempt_at(now));
        assert!(monitor.record_failed_attempt_at(now));
        assert!(monitor.locked_out_at(now).is_some());
    }

    #[test]
    fn test_attempt_during_lockout_does_not_consume_slot() {
        let store = Arc::new(MemoryStore::new());
        let (monitor, _bus) = monitor_with(Arc::clone(&store));
        let now = Utc::now();
        for _ in 0..3 {
            monitor.record_failed_attempt_at(now);
        }
        let until = monitor.locked_out_at(now).unwrap();

        // hammering during the lockout neither extends nor consumes anything
        for _ in 0..10 {
            assert!(monitor.record_failed_attempt_at(now + ChronoDuration::seconds(1)));
        }
        assert_eq!(monitor.locked_out_at(now), Some(until));
    }

    #[test]
    fn test_success_clears_counter_and_lockout() {
        let store = Arc::new(MemoryStore::new());
        let (monitor, _bus) = monitor_with(Arc::clone(&store));
        let now = Utc::now();
        for _ in 0..3 {
            monitor.record_failed_attempt_at(now);
        }
        assert!(store.get(KEY_LOCKOUT).unwrap().is_some());

        monitor.record_success();
        assert!(monitor.locked_out_at(now).is_none());
        assert!(store.get(KEY_LOCKOUT).unwrap().is_none());
        assert!(monitor.check_login_allowed().is_ok());

        // counter restarted: two failures are not enough again
        assert!(!monitor.record_failed_attempt_at(now));
        assert!(!monitor.record_failed_attempt_at(now));
    }

    #[test]
    fn test_lockout_survives_reload() {
        let store = Arc::new(MemoryStore::new());
        {
            let (monitor, _bus) = monitor_with(Arc::clone(&store));
            let now = Utc::now();
            for _ in 0..3 {
                monitor.record_failed_attempt_at(now);
            }
        }
        // fresh monitor over the same store: still locked
        let (reloaded, _bus) = monitor_with(store);
        assert!(reloaded.locked_out().is_some());
        assert!(matches!(
            reloaded.check_login_allowed(),
            Err(SecurityViolation::LockedOut { .. })
        ));
    }

    #[test]
    fn test_failure_window_restarts_after_lockout_elapses() {
        let (monitor, _bus) = monitor_with(Arc::new(MemoryStore::new()));
        let now = Utc::now();
        for _ in 0..3 {
            monitor.record_failed_attempt_at(now);
        }
        let after = now + ChronoDuration::minutes(16);
        assert!(monitor.locked_out_at(after).is_none());
        // first failure after the window is attempt 1 of 3 again
        assert!(!monitor.record_failed_attempt_at(after));
    }

    #[test]
    fn test_ring_buffer_is_bounded() {
        let (monitor, _bus) = monitor_with(Arc::new(MemoryStore::new()));
        let now = Utc::now();
        for i in 0..(MAX_SUSPICIOUS_EVENTS + 25) {
            monitor.record_event_at(now, SuspiciousKind::RapidClicking, &format!("click {i}"));
        }
        assert_eq!(monitor.suspicious_event_count(), MAX_SUSPICIOUS_EVENTS);
    }

    #[test]
    fn test_critical_kind_forces_logout() {
        let (monitor, bus) = monitor_with(Arc::new(MemoryStore::new()));
        let mut events = bus.subscribe();
        monitor.detect_suspicious_at(Utc::now(), SuspiciousKind::MultipleSessions, "4 live");

        let mut saw_alert = false;
        let mut saw_forced = false;
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::SecurityAlert { critical, .. } => saw_alert = saw_alert || critical,
                EngineEvent::ForcedLogout { reason, .. } => {
                    assert_eq!(reason, TerminationReason::SecurityForced);
                    saw_forced = true;
                }
                _ => {}
            }
        }
        assert!(saw_alert && saw_forced);
    }

    #[test]
    fn test_low_severity_never_escalates() {
        let (monitor, bus) = monitor_with(Arc::new(MemoryStore::new()));
        let mut events = bus.subscribe();
        let now = Utc::now();
        for i in 0..50 {
            assert!(!monitor.detect_suspicious_at(now, SuspiciousKind::RapidClicking, &format!("{i}")));
        }
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, EngineEvent::ForcedLogout { .. }));
        }
    }

    #[test]
    fn test_window_threshold_escalates_exactly_once() {
        let (monitor, bus) = monitor_with(Arc::new(MemoryStore::new()));
        let mut events = bus.subscribe();
        let now = Utc::now();
        let mut exceeded = 0;
        for i in 0..(DEFAULT_ALERT_THRESHOLD + 5) {
            let at = now + ChronoDuration::seconds(i as i64);
            if monitor.detect_suspicious_at(at, SuspiciousKind::ExcessiveNavigation, "nav") {
                exceeded += 1;
            }
        }
        assert!(exceeded >= 1);

        let forced = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, EngineEvent::ForcedLogout { .. }))
            .count();
        assert_eq!(forced, 1);
    }

    #[test]
    fn test_events_outside_window_do_not_count() {
        let (monitor, _bus) = monitor_with(Arc::new(MemoryStore::new()));
        let now = Utc::now();
        // old events beyond the 1h window
        for i in 0..(DEFAULT_ALERT_THRESHOLD - 1) {
            let at = now - ChronoDuration::hours(2) + ChronoDuration::seconds(i as i64);
            monitor.detect_suspicious_at(at, SuspiciousKind::ExcessiveNavigation, "old");
        }
        // one fresh event: window count is 1, far below threshold
        assert!(!monitor.detect_suspicious_at(now, SuspiciousKind::ExcessiveNavigation, "new"));
    }
}
