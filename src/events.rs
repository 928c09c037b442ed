// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Structured events the engine emits toward the UI shell.
//!
//! The shell subscribes to the [`EventBus`] and renders whatever it wants;
//! the engine never talks to the DOM directly. Event names follow the
//! `area:event` convention (`idle:warning`, `session:expired`, ...).

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::security::SuspiciousKind;
use crate::session::TerminationReason;

/// Default bus capacity. Slow subscribers past this lag lose old events,
/// which is acceptable for UI notifications.
const DEFAULT_BUS_CAPACITY: usize = 64;

/// Everything the shell can observe.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Idle warning countdown should be shown.
    IdleWarning { time_remaining_ms: u64 },
    /// Inactivity exceeded the idle timeout.
    IdleTimeout,
    /// Session expiry warning countdown should be shown.
    SessionWarning { remaining_ms: u64 },
    /// Absolute session duration exceeded.
    SessionExpired,
    /// A suspicious event was recorded.
    SecurityAlert {
        kind: SuspiciousKind,
        detail: String,
        critical: bool,
    },
    /// Failed-login lockout engaged.
    SecurityLockout {
        until: DateTime<Utc>,
        reason: String,
    },
    /// The session was terminated and the shell must redirect. Carries a
    /// reason-appropriate message to present first.
    ForcedLogout {
        reason: TerminationReason,
        message: String,
    },
}

impl EngineEvent {
    /// Shell-facing event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::IdleWarning { .. } => "idle:warning",
            Self::IdleTimeout => "idle:timeout",
            Self::SessionWarning { .. } => "session:warning",
            Self::SessionExpired => "session:expired",
            Self::SecurityAlert { .. } => "security:alert",
            Self::SecurityLockout { .. } => "security:lockout",
            Self::ForcedLogout { .. } => "session:forced-logout",
        }
    }
}

/// Broadcast fan-out for engine events. Cloning is cheap; every component
/// holds one and emits into the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. A bus with no subscribers is fine; the event is simply
    /// not observed.
    pub fn emit(&self, event: EngineEvent) {
        tracing::debug!("EVENT | name={}", event.name());
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(EngineEvent::IdleTimeout);
        assert_eq!(a.recv().await.unwrap(), EngineEvent::IdleTimeout);
        assert_eq!(b.recv().await.unwrap(), EngineEvent::IdleTimeout);
    }

    #[test]
    fn test_emit_without_subscribers_is_harmless() {
        let bus = EventBus::new();
        bus.emit(EngineEvent::SessionExpired);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(
            EngineEvent::IdleWarning {
                time_remaining_ms: 60_000
            }
            .name(),
            "idle:warning"
        );
        assert_eq!(EngineEvent::SessionExpired.name(), "session:expired");
    }
}
