// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Idle monitoring.
//!
//! Two-stage inactivity timer fed by activity pulses:
//!
//! ```text
//! Active --(timeout - lead)--> Warning --(lead)--> Idle
//!    ^                            |                 |
//!    +------- any pulse ----------+-----------------+
//! ```
//!
//! Any pulse returns the machine to `Active` and restarts both stages from
//! zero, so N rapid pulses have exactly the same effect as one. The monitor
//! emits `idle:warning` (carrying the time left until idle logout) and a
//! terminal `idle:timeout`; it never performs the logout itself.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_stream::{Stream, StreamExt};

use crate::activity::Pulse;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};

/// Idle phases. `Warning` and `Idle` both fall back to `Active` on a pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlePhase {
    Active,
    Warning,
    Idle,
}

impl IdlePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Warning => "WARNING",
            Self::Idle => "IDLE",
        }
    }
}

/// Validated idle timer pair. Exists so the relationship check happens at
/// construction, never inside the timer loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TwoStageTimer {
    timeout: Duration,
    warning_lead: Duration,
}

impl TwoStageTimer {
    pub(crate) fn new(timeout: Duration, warning_lead: Duration) -> EngineResult<Self> {
        if warning_lead >= timeout {
            return Err(EngineError::config(format!(
                "warning lead ({warning_lead:?}) must be shorter than timeout ({timeout:?})"
            )));
        }
        if timeout.is_zero() {
            return Err(EngineError::config("timeout must be non-zero"));
        }
        Ok(Self {
            timeout,
            warning_lead,
        })
    }

    fn warning_after(&self) -> Duration {
        self.timeout - self.warning_lead
    }
}

/// Handle to the running idle monitor task.
pub struct IdleMonitor {
    phase_rx: watch::Receiver<IdlePhase>,
    task: JoinHandle<()>,
}

impl IdleMonitor {
    /// Spawn the monitor over a pulse stream. The config must already be
    /// validated; the timer relationship is re-checked here so direct
    /// construction cannot bypass it.
    pub fn spawn<S>(config: &EngineConfig, pulses: S, bus: EventBus) -> EngineResult<Self>
    where
        S: Stream<Item = Pulse> + Send + Unpin + 'static,
    {
        let timers = TwoStageTimer::new(config.idle_timeout(), config.idle_warning_lead())?;
        let (phase_tx, phase_rx) = watch::channel(IdlePhase::Active);
        let task = tokio::spawn(run(timers, pulses, bus, phase_tx));
        Ok(Self { phase_rx, task })
    }

    /// Current phase.
    pub fn phase(&self) -> IdlePhase {
        *self.phase_rx.borrow()
    }

    /// Watch phase transitions.
    pub fn watch_phase(&self) -> watch::Receiver<IdlePhase> {
        self.phase_rx.clone()
    }
}

impl Drop for IdleMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<S>(
    timers: TwoStageTimer,
    mut pulses: S,
    bus: EventBus,
    phase_tx: watch::Sender<IdlePhase>,
) where
    S: Stream<Item = Pulse> + Send + Unpin + 'static,
{
    let mut phase = IdlePhase::Active;
    let mut last_pulse = Instant::now();

    loop {
        let warning_at = last_pulse + timers.warning_after();
        let idle_at = last_pulse + timers.timeout;

        tokio::select! {
            // Pulses win over equal-deadline timers: a user who acts at the
            // last instant stays logged in.
            biased;

            maybe_pulse = pulses.next() => {
                match maybe_pulse {
                    Some(pulse) => {
                        last_pulse = pulse.at;
                        if phase != IdlePhase::Active {
                            tracing::info!(
                                "IDLE_RESET | from={} kind={}",
                                phase.as_str(),
                                pulse.kind.as_str()
                            );
                        }
                        phase = IdlePhase::Active;
                        let _ = phase_tx.send(phase);
                    }
                    // Tracker dropped; nothing further can reset the timers,
                    // so stop instead of idling out a dead stream.
                    None => break,
                }
            }

            _ = time::sleep_until(warning_at), if phase == IdlePhase::Active => {
                phase = IdlePhase::Warning;
                let _ = phase_tx.send(phase);
                let remaining = timers.warning_lead;
                tracing::warn!("IDLE_WARNING | remaining_ms={}", remaining.as_millis());
                bus.emit(EngineEvent::IdleWarning {
                    time_remaining_ms: remaining.as_millis() as u64,
                });
            }

            _ = time::sleep_until(idle_at), if phase != IdlePhase::Idle => {
                phase = IdlePhase::Idle;
                let _ = phase_tx.send(phase);
                tracing::warn!("IDLE_TIMEOUT | inactive_ms={}", timers.timeout.as_millis());
                bus.emit(EngineEvent::IdleTimeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityTracker, InputKind};

    fn test_config() -> EngineConfig {
        EngineConfig {
            idle_timeout_ms: 300_000,
            idle_warning_lead_ms: 60_000,
            throttle_delay_ms: 100,
            ..EngineConfig::default()
        }
    }

    async fn next_event(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> EngineEvent {
        rx.recv().await.unwrap()
    }

    #[test]
    fn test_invalid_lead_fails_at_construction() {
        let err = TwoStageTimer::new(Duration::from_secs(60), Duration::from_secs(60));
        assert!(err.is_err());
        let err = TwoStageTimer::new(Duration::from_secs(60), Duration::from_secs(90));
        assert!(err.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_warning_then_timeout_timeline() {
        // idle_timeout = 300s, lead = 60s: warning at 240s, timeout at 300s
        let config = test_config();
        let tracker = ActivityTracker::all_inputs(config.throttle_delay());
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let _monitor = IdleMonitor::spawn(&config, tracker.observe(), bus.clone()).unwrap();
        tokio::task::yield_now().await;

        // 239s of silence: nothing
        time::advance(Duration::from_secs(239)).await;
        assert!(events.try_recv().is_err());

        // at 240s the warning fires with 60s remaining
        time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            next_event(&mut events).await,
            EngineEvent::IdleWarning {
                time_remaining_ms: 60_000
            }
        );

        // a pulse at 250s cancels the countdown
        time::advance(Duration::from_secs(10)).await;
        assert!(tracker.report(InputKind::Pointer));
        tokio::task::yield_now().await;

        // full silence from the reset: warning at +240s, timeout at +300s
        time::advance(Duration::from_secs(240)).await;
        assert_eq!(
            next_event(&mut events).await,
            EngineEvent::IdleWarning {
                time_remaining_ms: 60_000
            }
        );
        time::advance(Duration::from_secs(60)).await;
        assert_eq!(next_event(&mut events).await, EngineEvent::IdleTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_pulses_are_idempotent() {
        let config = test_config();
        let tracker = ActivityTracker::all_inputs(Duration::from_millis(1));
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let monitor = IdleMonitor::spawn(&config, tracker.observe(), bus.clone()).unwrap();
        tokio::task::yield_now().await;

        // hammer pulses for a while; the monitor must stay Active
        for _ in 0..50 {
            time::advance(Duration::from_secs(4)).await;
            tracker.report(InputKind::Keyboard);
            tokio::task::yield_now().await;
        }
        assert_eq!(monitor.phase(), IdlePhase::Active);
        assert!(events.try_recv().is_err());

        // one full timeout after the last pulse, the warning arrives on time
        time::advance(Duration::from_secs(240)).await;
        assert_eq!(
            next_event(&mut events).await,
            EngineEvent::IdleWarning {
                time_remaining_ms: 60_000
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pulse_recovers_from_idle_phase() {
        let config = test_config();
        let tracker = ActivityTracker::all_inputs(Duration::from_millis(1));
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let monitor = IdleMonitor::spawn(&config, tracker.observe(), bus.clone()).unwrap();
        tokio::task::yield_now().await;

        time::advance(Duration::from_secs(300)).await;
        assert_eq!(
            next_event(&mut events).await,
            EngineEvent::IdleWarning {
                time_remaining_ms: 60_000
            }
        );
        assert_eq!(next_event(&mut events).await, EngineEvent::IdleTimeout);
        assert_eq!(monitor.phase(), IdlePhase::Idle);

        tracker.report(InputKind::Touch);
        tokio::task::yield_now().await;
        assert_eq!(monitor.phase(), IdlePhase::Active);

        // timers restarted from zero after recovery
        time::advance(Duration::from_secs(240)).await;
        assert_eq!(
            next_event(&mut events).await,
            EngineEvent::IdleWarning {
                time_remaining_ms: 60_000
            }
        );
    }
}
