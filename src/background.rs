// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background monitor.
//!
//! An independently scheduled agent that keeps enforcing the timeout
//! envelope while no foreground context is running. It shares no memory with
//! the foreground: everything arrives as messages, either over an in-process
//! channel or through the persisted store (the `vigil-agent` binary uses only
//! the store). All of its time arithmetic is wall-clock, because it must
//! judge sessions that started before this process did.
//!
//! On a violation it broadcasts `force_logout` so live tabs shut themselves
//! down; if no heartbeat has been seen recently it assumes no tab is alive,
//! invokes the [`WakeForeground`] hook so cleanup still happens, and clears
//! the persisted session state itself.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;

use crate::crosstab::{CrossTabMessage, MessageKind};
use crate::error::EngineResult;
use crate::session::{Session, TerminationReason};
use crate::store::{with_retry, KeyValueStore, KEY_BROADCAST, KEY_SESSION_SNAPSHOT};

/// Session id the agent stamps on its own broadcasts.
pub const AGENT_SESSION_ID: &str = "vigil_agent";

/// Store write attempts for enforcement broadcasts.
const ENFORCE_RETRY_ATTEMPTS: u32 = 5;

/// Minimal persisted session state the agent enforces against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub max_duration_ms: u64,
    pub idle_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// When this snapshot was written. Drives the staleness check.
    pub saved_at: DateTime<Utc>,
}

impl SessionSnapshot {
    /// Capture the persistable view of a live session.
    pub fn capture(session: &Session, idle_timeout_ms: u64, last_activity: DateTime<Utc>) -> Self {
        Self {
            session_id: session.session_id.clone(),
            user_id: session.user_id.clone(),
            start_time: session.start_time,
            last_activity,
            max_duration_ms: session.max_duration_ms,
            idle_timeout_ms,
            heartbeat_interval_ms: session.heartbeat_interval_ms,
            saved_at: Utc::now(),
        }
    }

    /// Snapshots older than the session's own maximum duration are not
    /// trusted after an agent restart.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.saved_at > ChronoDuration::milliseconds(self.max_duration_ms as i64)
    }

    fn silence_limit(&self) -> ChronoDuration {
        ChronoDuration::milliseconds((self.heartbeat_interval_ms * 3) as i64)
    }
}

/// Lifecycle events delivered to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    SessionStart { snapshot: SessionSnapshot },
    ActivityUpdate { at: DateTime<Utc> },
    Heartbeat { session_id: String, at: DateTime<Utc> },
    GoBackground,
    GoForeground,
    SessionEnd { reason: TerminationReason },
}

/// Envelope violations the agent can find on its own schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentViolation {
    SessionExpired,
    IdleTimeout,
    NoHeartbeat,
}

impl AgentViolation {
    pub fn reason(&self) -> TerminationReason {
        match self {
            Self::SessionExpired => TerminationReason::SessionExpired,
            Self::IdleTimeout => TerminationReason::IdleTimeout,
            Self::NoHeartbeat => TerminationReason::NoHeartbeat,
        }
    }
}

/// Hook used when a violation is found and no foreground context is alive to
/// handle it: the host opens (or equivalent) a context so server notification
/// and redirect still happen.
pub trait WakeForeground: Send + Sync {
    fn wake(&self, reason: TerminationReason);
}

/// Default hook: log only. Hosts that can spawn a window install their own.
pub struct LogWake;

impl WakeForeground for LogWake {
    fn wake(&self, reason: TerminationReason) {
        tracing::warn!("AGENT_WAKE_REQUESTED | reason={}", reason.as_str());
    }
}

/// The background agent itself.
pub struct BackgroundMonitor {
    store: Arc<dyn KeyValueStore>,
    wake: Arc<dyn WakeForeground>,
    poll_interval: Duration,
    started: DateTime<Utc>,
    snapshot: Option<SessionSnapshot>,
    last_heartbeat: Option<DateTime<Utc>>,
    backgrounded: bool,
    no_heartbeat_fired: bool,
    last_inbox_fingerprint: Option<String>,
}

impl BackgroundMonitor {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        wake: Arc<dyn WakeForeground>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            wake,
            poll_interval,
            started: Utc::now(),
            snapshot: None,
            last_heartbeat: None,
            backgrounded: false,
            no_heartbeat_fired: false,
            last_inbox_fingerprint: None,
        }
    }

    /// Rebuild state from the persisted snapshot after a restart and check
    /// for violations immediately: a session that expired while the agent
    /// was down must not wait for the first poll tick.
    pub fn restore(&mut self) -> EngineResult<Option<AgentViolation>> {
        let now = Utc::now();
        let Some(raw) = self.store.get(KEY_SESSION_SNAPSHOT)? else {
            return Ok(None);
        };
        let snapshot: SessionSnapshot = match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("PROTOCOL_INCONSISTENCY | key={KEY_SESSION_SNAPSHOT} error={e}");
                self.store.remove(KEY_SESSION_SNAPSHOT)?;
                return Ok(None);
            }
        };
        if snapshot.is_stale(now) {
            tracing::warn!(
                "AGENT_SNAPSHOT_STALE | session={} saved_at={}",
                snapshot.session_id,
                snapshot.saved_at.to_rfc3339()
            );
            self.store.remove(KEY_SESSION_SNAPSHOT)?;
            return Ok(None);
        }
        tracing::info!(
            "AGENT_RESTORED | session={} started={}",
            snapshot.session_id,
            snapshot.start_time.to_rfc3339()
        );
        // the snapshot write counts as the last proof of life
        self.last_heartbeat = Some(snapshot.saved_at.max(snapshot.last_activity));
        self.snapshot = Some(snapshot);
        Ok(self.evaluate(now))
    }

    /// Re-check the envelope. Pure with respect to the clock so tests can
    /// check arbitrary instants.
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> Option<AgentViolation> {
        let snapshot = self.snapshot.as_ref()?;

        let elapsed = now - snapshot.start_time;
        if elapsed > ChronoDuration::milliseconds(snapshot.max_duration_ms as i64) {
            return Some(AgentViolation::SessionExpired);
        }

        if self.backgrounded {
            let inactive = now - snapshot.last_activity;
            if inactive > ChronoDuration::milliseconds(snapshot.idle_timeout_ms as i64) {
                return Some(AgentViolation::IdleTimeout);
            }
        } else if let Some(last) = self.last_heartbeat {
            // a frozen or killed tab stops heartbeating without a clean
            // session_end; flag it exactly once per silence episode
            if now - last > snapshot.silence_limit() && !self.no_heartbeat_fired {
                self.no_heartbeat_fired = true;
                return Some(AgentViolation::NoHeartbeat);
            }
        }
        None
    }

    /// Apply one lifecycle message.
    pub fn handle_message(&mut self, message: AgentMessage) {
        match message {
            AgentMessage::SessionStart { snapshot } => {
                tracing::info!("AGENT_SESSION_START | session={}", snapshot.session_id);
                self.last_heartbeat = Some(snapshot.saved_at);
                self.backgrounded = false;
                self.no_heartbeat_fired = false;
                self.persist_snapshot(&snapshot);
                self.snapshot = Some(snapshot);
            }
            AgentMessage::ActivityUpdate { at } => {
                if let Some(snapshot) = self.snapshot.as_mut() {
                    snapshot.last_activity = at;
                    snapshot.saved_at = Utc::now();
                    let snapshot = snapshot.clone();
                    self.persist_snapshot(&snapshot);
                }
            }
            AgentMessage::Heartbeat { at, .. } => {
                self.last_heartbeat = Some(at);
                self.no_heartbeat_fired = false;
            }
            AgentMessage::GoBackground => {
                self.backgrounded = true;
            }
            AgentMessage::GoForeground => {
                self.backgrounded = false;
                self.no_heartbeat_fired = false;
            }
            AgentMessage::SessionEnd { reason } => {
                tracing::info!("AGENT_SESSION_END | reason={}", reason.as_str());
                self.clear_session();
            }
        }
    }

    /// Broadcast the termination instruction and, when no foreground context
    /// is alive, run cleanup ourselves.
    pub async fn enforce(&mut self, violation: AgentViolation) {
        let reason = violation.reason();
        tracing::warn!("AGENT_VIOLATION | reason={}", reason.as_str());

        let session_id = self
            .snapshot
            .as_ref()
            .map(|s| s.session_id.clone())
            .unwrap_or_default();
        let message = CrossTabMessage::new(MessageKind::ForceLogout, AGENT_SESSION_ID)
            .with_payload(json!({ "reason": reason.as_str(), "session": session_id }));
        let raw = match serde_json::to_string(&message) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!("AGENT_BROADCAST_FAILED | error={e}");
                return;
            }
        };
        let store = Arc::clone(&self.store);
        if let Err(e) = with_retry("agent.enforce", ENFORCE_RETRY_ATTEMPTS, || {
            store.set(KEY_BROADCAST, &raw)
        })
        .await
        {
            tracing::error!("AGENT_BROADCAST_FAILED | error={e}");
        }

        let foreground_alive = match (&self.snapshot, self.last_heartbeat) {
            (Some(snapshot), Some(last)) => Utc::now() - last <= snapshot.silence_limit(),
            _ => false,
        };
        if !foreground_alive {
            self.wake.wake(reason);
        }

        // terminal violations end the session from the agent's point of view
        if violation != AgentViolation::NoHeartbeat || !foreground_alive {
            self.clear_session();
        }
    }

    /// Poll the shared broadcast slot, mapping peer messages into agent
    /// messages. This is the only inbound path for the standalone binary.
    fn drain_store_inbox(&mut self) -> Option<AgentMessage> {
        let raw = match self.store.get(KEY_BROADCAST) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("IO_TRANSIENT | op=agent.poll error={e}");
                return None;
            }
        };
        let message = match CrossTabMessage::parse(&raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("PROTOCOL_INCONSISTENCY | error={e}");
                return None;
            }
        };
        if message.session_id == AGENT_SESSION_ID {
            return None;
        }
        // the slot is never cleared; a logout left over from before this
        // agent started must not touch the current session
        if message.timestamp < self.started {
            return None;
        }
        let fingerprint = format!(
            "{}|{}|{}|{}",
            message.kind.as_str(),
            message.session_id,
            message.timestamp.timestamp_millis(),
            message.nonce
        );
        if self.last_inbox_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            return None;
        }
        self.last_inbox_fingerprint = Some(fingerprint);

        match message.kind {
            MessageKind::Heartbeat => Some(AgentMessage::Heartbeat {
                session_id: message.session_id,
                at: message.timestamp,
            }),
            MessageKind::ActivityUpdate => Some(AgentMessage::ActivityUpdate {
                at: message.timestamp,
            }),
            MessageKind::Logout | MessageKind::ForceLogout => Some(AgentMessage::SessionEnd {
                reason: TerminationReason::RemoteLogout,
            }),
            MessageKind::Warning => None,
        }
    }

    /// Drive the agent: restore, then alternate between inbound messages and
    /// periodic envelope checks until the inbox closes.
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<AgentMessage>) {
        match self.restore() {
            Ok(Some(violation)) => self.enforce(violation).await,
            Ok(None) => {}
            Err(e) => tracing::warn!("IO_TRANSIENT | op=agent.restore error={e}"),
        }

        let mut tick = time::interval(self.poll_interval);
        tick.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                message = inbox.recv() => {
                    match message {
                        Some(message) => self.handle_message(message),
                        None => break,
                    }
                }
                _ = tick.tick() => {
                    if let Some(message) = self.drain_store_inbox() {
                        self.handle_message(message);
                    }
                    // a restarted foreground may have written a fresh
                    // snapshot; anything already in violation is enforced
                    // now, same as the startup path
                    if self.snapshot.is_none() {
                        match self.restore() {
                            Ok(Some(violation)) => self.enforce(violation).await,
                            Ok(None) => {}
                            Err(e) => {
                                tracing::warn!("IO_TRANSIENT | op=agent.reload error={e}");
                            }
                        }
                    }
                    if let Some(violation) = self.evaluate(Utc::now()) {
                        self.enforce(violation).await;
                    }
                }
            }
        }
        tracing::info!("AGENT_STOPPED | clean=true");
    }

    /// Current view of the monitored session, if any.
    pub fn snapshot(&self) -> Option<&SessionSnapshot> {
        self.snapshot.as_ref()
    }

    fn persist_snapshot(&self, snapshot: &SessionSnapshot) {
        let raw = match serde_json::to_string(snapshot) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!("AGENT_PERSIST_FAILED | error={e}");
                return;
            }
        };
        if let Err(e) = self.store.set(KEY_SESSION_SNAPSHOT, &raw) {
            tracing::warn!("IO_TRANSIENT | op=agent.persist error={e}");
        }
    }

    fn clear_session(&mut self) {
        self.snapshot = None;
        self.last_heartbeat = None;
        self.backgrounded = false;
        self.no_heartbeat_fired = false;
        if let Err(e) = self.store.remove(KEY_SESSION_SNAPSHOT) {
            tracing::warn!("IO_TRANSIENT | op=agent.clear error={e}");
        }
    }
}
