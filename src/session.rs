// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session lifecycle.
//!
//! Owns the absolute session envelope: start time, maximum duration, warning
//! threshold, heartbeat. Deliberately independent of activity: a session
//! expires at `max_duration` even while the user is typing. `touch()` only
//! refreshes the diagnostic `last_activity` stamp; the key contrast with the
//! idle monitor is that nothing here resets on input.
//!
//! Two cooperative timers per session: a warning timer at
//! `max_duration - warning_lead` and an expiration timer at `max_duration`.
//! `extend()` cancels and reschedules both relative to the moment of
//! extension, so an extension can never immediately re-fire a stale deadline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::events::{EngineEvent, EventBus};

/// Session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Session is live and inside the warning-free zone.
    Active,
    /// Expiry warning fired; session still usable.
    Warning,
    /// Absolute duration exceeded.
    Expired,
    /// Explicitly ended.
    Terminated,
}

impl SessionStatus {
    /// True while the session can still be used.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Warning)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Warning => "WARNING",
            Self::Expired => "EXPIRED",
            Self::Terminated => "TERMINATED",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a session ended. Drives both the audit line and the message shown to
/// the user before redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    UserLogout,
    IdleTimeout,
    SessionExpired,
    SecurityForced,
    NoHeartbeat,
    RemoteLogout,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserLogout => "user_logout",
            Self::IdleTimeout => "idle_timeout",
            Self::SessionExpired => "session_expired",
            Self::SecurityForced => "security_forced",
            Self::NoHeartbeat => "no_heartbeat",
            Self::RemoteLogout => "remote_logout",
        }
    }

    /// Reason-appropriate message presented before redirect.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::UserLogout => "You have been signed out.",
            Self::IdleTimeout => "You were signed out after a period of inactivity.",
            Self::SessionExpired => "Your session reached its maximum duration. Please sign in again.",
            Self::SecurityForced => "Your session was ended for security reasons. Please sign in again.",
            Self::NoHeartbeat => "Your session stopped responding and was closed. Please sign in again.",
            Self::RemoteLogout => "You signed out in another window.",
        }
    }

    /// True for terminations the user did not ask for.
    pub fn is_forced(&self) -> bool {
        !matches!(self, Self::UserLogout)
    }
}

/// Immutable session metadata, fixed at login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub max_duration_ms: u64,
    pub warning_lead_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Session {
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }
}

/// Point-in-time view of the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub status: SessionStatus,
    pub elapsed: Duration,
    pub remaining: Duration,
    pub is_expired: bool,
}

/// Signals the engine routes to the coordinator and the background agent.
#[derive(Debug, Clone)]
pub enum SessionSignal {
    /// Expiry warning fired with this much time left.
    Warning { remaining: Duration },
    /// Absolute duration exceeded.
    Expired,
    /// Periodic liveness signal.
    Heartbeat {
        session_id: String,
        at: DateTime<Utc>,
    },
    /// Terminal.
    Ended { reason: TerminationReason },
}

enum Command {
    Touch,
    Extend(Duration),
    End(TerminationReason),
}

/// Dynamic state shared with the handle through a watch channel.
#[derive(Debug, Clone, Copy)]
struct Clock {
    status: SessionStatus,
    started: Instant,
    expire_at: Instant,
    last_activity_at: Instant,
}

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a unique session id.
pub fn generate_session_id() -> String {
    let counter = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
    let timestamp = Utc::now().timestamp_millis();
    let random: u32 = rand::random();
    format!("sess_{timestamp}_{counter}_{random:08x}")
}

/// Handle to one running session.
///
/// All mutation goes through the timer task by message; the handle itself is
/// cheap and the control methods are safe to call after the session ended
/// (they become no-ops, which keeps duplicate logout deliveries harmless).
pub struct SessionLifecycle {
    session: Session,
    ctl: mpsc::UnboundedSender<Command>,
    clock_rx: watch::Receiver<Clock>,
    task: JoinHandle<()>,
}

impl SessionLifecycle {
    /// Start a session for `user_id` and spawn its timer task.
    pub fn start(
        config: &EngineConfig,
        user_id: &str,
        bus: EventBus,
        signals: mpsc::UnboundedSender<SessionSignal>,
    ) -> EngineResult<Self> {
        config.validate()?;

        let session = Session {
            session_id: generate_session_id(),
            user_id: user_id.to_string(),
            start_time: Utc::now(),
            max_duration_ms: config.session_max_duration_ms,
            warning_lead_ms: config.session_warning_lead_ms,
            heartbeat_interval_ms: config.heartbeat_interval_ms,
        };
        tracing::info!(
            "SESSION_CREATED | session={} user={}",
            session.session_id,
            session.user_id
        );

        let now = Instant::now();
        let clock = Clock {
            status: SessionStatus::Active,
            started: now,
            expire_at: now + config.session_max_duration(),
            last_activity_at: now,
        };
        let (ctl, ctl_rx) = mpsc::unbounded_channel();
        let (clock_tx, clock_rx) = watch::channel(clock);
        let task = tokio::spawn(run(
            session.clone(),
            config.session_warning_lead(),
            config.heartbeat_interval(),
            clock,
            ctl_rx,
            clock_tx,
            bus,
            signals,
        ));

        Ok(Self {
            session,
            ctl,
            clock_rx,
            task,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    /// Record activity for diagnostics. Does NOT move the expiration timers.
    pub fn touch(&self) {
        let _ = self.ctl.send(Command::Touch);
    }

    /// Reschedule both timers so the new expiry is `now + extra`.
    pub fn extend(&self, extra: Duration) {
        let _ = self.ctl.send(Command::Extend(extra));
    }

    /// End the session. Safe to call repeatedly; only the first reason wins.
    pub fn end(&self, reason: TerminationReason) {
        let _ = self.ctl.send(Command::End(reason));
    }

    /// Current envelope view.
    pub fn status(&self) -> SessionReport {
        let clock = *self.clock_rx.borrow();
        let now = Instant::now();
        let remaining = if clock.status.is_live() {
            clock.expire_at.saturating_duration_since(now)
        } else {
            Duration::ZERO
        };
        SessionReport {
            status: clock.status,
            elapsed: now.saturating_duration_since(clock.started),
            remaining,
            is_expired: clock.status == SessionStatus::Expired
                || (clock.status.is_live() && remaining.is_zero()),
        }
    }

    /// Duration since the last recorded activity.
    pub fn inactivity(&self) -> Duration {
        Instant::now().saturating_duration_since(self.clock_rx.borrow().last_activity_at)
    }
}

impl Drop for SessionLifecycle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    session: Session,
    warning_lead: Duration,
    heartbeat_interval: Duration,
    mut clock: Clock,
    mut ctl: mpsc::UnboundedReceiver<Command>,
    clock_tx: watch::Sender<Clock>,
    bus: EventBus,
    signals: mpsc::UnboundedSender<SessionSignal>,
) {
    let mut warn_at = clock.expire_at - warning_lead;
    let mut warned = false;
    let mut heartbeats = time::interval_at(clock.started + heartbeat_interval, heartbeat_interval);

    loop {
        tokio::select! {
            biased;

            cmd = ctl.recv() => {
                match cmd {
                    Some(Command::Touch) => {
                        clock.last_activity_at = Instant::now();
                        let _ = clock_tx.send(clock);
                    }
                    Some(Command::Extend(extra)) => {
                        let now = Instant::now();
                        clock.expire_at = now + extra;
                        warn_at = clock.expire_at - warning_lead.min(extra);
                        warned = false;
                        if clock.status == SessionStatus::Warning {
                            clock.status = SessionStatus::Active;
                        }
                        let _ = clock_tx.send(clock);
                        tracing::info!(
                            "SESSION_EXTENDED | session={} new_remaining_ms={}",
                            session.session_id,
                            extra.as_millis()
                        );
                    }
                    Some(Command::End(reason)) => {
                        clock.status = SessionStatus::Terminated;
                        let _ = clock_tx.send(clock);
                        tracing::info!(
                            "SESSION_TERMINATED | session={} reason={}",
                            session.session_id,
                            reason.as_str()
                        );
                        let _ = signals.send(SessionSignal::Ended { reason });
                        break;
                    }
                    // Handle dropped: nothing can control the session anymore.
                    None => break,
                }
            }

            _ = time::sleep_until(warn_at), if !warned && clock.status == SessionStatus::Active => {
                warned = true;
                clock.status = SessionStatus::Warning;
                let _ = clock_tx.send(clock);
                let remaining = clock.expire_at.saturating_duration_since(Instant::now());
                tracing::warn!(
                    "SESSION_WARNING | session={} remaining_ms={}",
                    session.session_id,
                    remaining.as_millis()
                );
                bus.emit(EngineEvent::SessionWarning {
                    remaining_ms: remaining.as_millis() as u64,
                });
                let _ = signals.send(SessionSignal::Warning { remaining });
            }

            _ = time::sleep_until(clock.expire_at), if clock.status.is_live() => {
                clock.status = SessionStatus::Expired;
                let _ = clock_tx.send(clock);
                tracing::warn!(
                    "SESSION_EXPIRED | session={} duration_ms={}",
                    session.session_id,
                    Instant::now().saturating_duration_since(clock.started).as_millis()
                );
                bus.emit(EngineEvent::SessionExpired);
                let _ = signals.send(SessionSignal::Expired);
                break;
            }

            _ = heartbeats.tick() => {
                let _ = signals.send(SessionSignal::Heartbeat {
                    session_id: session.session_id.clone(),
                    at: Utc::now(),
                });
            }
        }
    }
}
