// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Activity tracking.
//!
//! Normalizes heterogeneous input signals (pointer, keyboard, touch, scroll,
//! visibility, focus) into a single throttled "activity pulse" stream. The
//! tracker only emits pulses; it never resets any timer itself, that is the
//! idle monitor's job.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use serde::{Deserialize, Serialize};

/// Capacity of the pulse fan-out channel. Pulses are throttled upstream, so
/// a small buffer is plenty.
const PULSE_CHANNEL_CAPACITY: usize = 16;

/// Input signal categories the host shell can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Pointer,
    Keyboard,
    Touch,
    Scroll,
    Visibility,
    Focus,
}

impl InputKind {
    /// Every kind the tracker understands.
    pub const ALL: [InputKind; 6] = [
        InputKind::Pointer,
        InputKind::Keyboard,
        InputKind::Touch,
        InputKind::Scroll,
        InputKind::Visibility,
        InputKind::Focus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pointer => "pointer",
            Self::Keyboard => "keyboard",
            Self::Touch => "touch",
            Self::Scroll => "scroll",
            Self::Visibility => "visibility",
            Self::Focus => "focus",
        }
    }
}

/// One unit of user presence. Bursts of raw input collapse into one pulse
/// per throttle window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    pub kind: InputKind,
    pub at: Instant,
}

/// Throttled activity source.
///
/// The host shell calls [`report`](Self::report) for every raw input event;
/// consumers subscribe through [`observe`](Self::observe), which hands out a
/// lazy, infinite stream. Dropping the stream simply stops consumption.
pub struct ActivityTracker {
    observed: HashSet<InputKind>,
    throttle: Duration,
    last_emit: Mutex<Option<Instant>>,
    tx: broadcast::Sender<Pulse>,
}

impl ActivityTracker {
    /// Track the given event kinds, collapsing bursts within `throttle`.
    pub fn new(kinds: impl IntoIterator<Item = InputKind>, throttle: Duration) -> Self {
        let (tx, _) = broadcast::channel(PULSE_CHANNEL_CAPACITY);
        Self {
            observed: kinds.into_iter().collect(),
            throttle,
            last_emit: Mutex::new(None),
            tx,
        }
    }

    /// Track all input kinds.
    pub fn all_inputs(throttle: Duration) -> Self {
        Self::new(InputKind::ALL, throttle)
    }

    /// Report one raw input event. Returns `true` when a pulse was emitted,
    /// `false` when the event was filtered or throttled away.
    pub fn report(&self, kind: InputKind) -> bool {
        if !self.observed.contains(&kind) {
            return false;
        }
        let now = Instant::now();
        {
            let mut last = match self.last_emit.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(prev) = *last {
                if now.duration_since(prev) < self.throttle {
                    return false;
                }
            }
            *last = Some(now);
        }
        tracing::trace!("PULSE | kind={}", kind.as_str());
        let _ = self.tx.send(Pulse { kind, at: now });
        true
    }

    /// Subscribe to the pulse stream. Pulses reported before subscription are
    /// not replayed; a lagged subscriber silently skips ahead.
    pub fn observe(&self) -> impl Stream<Item = Pulse> + Send + Unpin + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|result| result.ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_one_pulse() {
        let tracker = ActivityTracker::all_inputs(Duration::from_millis(200));
        let mut pulses = tracker.observe();

        assert!(tracker.report(InputKind::Pointer));
        for _ in 0..20 {
            assert!(!tracker.report(InputKind::Pointer));
        }

        let first = pulses.next().await.unwrap();
        assert_eq!(first.kind, InputKind::Pointer);

        // next window opens after the throttle delay
        time::advance(Duration::from_millis(201)).await;
        assert!(tracker.report(InputKind::Keyboard));
        let second = pulses.next().await.unwrap();
        assert_eq!(second.kind, InputKind::Keyboard);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unobserved_kind_is_ignored() {
        let tracker = ActivityTracker::new([InputKind::Keyboard], Duration::from_millis(100));
        assert!(!tracker.report(InputKind::Pointer));
        assert!(tracker.report(InputKind::Keyboard));
    }

    #[tokio::test(start_paused = true)]
    async fn test_observe_is_lazy_and_independent() {
        let tracker = ActivityTracker::all_inputs(Duration::from_millis(50));

        // emitted before anyone subscribed: dropped on the floor
        tracker.report(InputKind::Scroll);

        let mut a = tracker.observe();
        let mut b = tracker.observe();
        time::advance(Duration::from_millis(51)).await;
        assert!(tracker.report(InputKind::Focus));

        assert_eq!(a.next().await.unwrap().kind, InputKind::Focus);
        assert_eq!(b.next().await.unwrap().kind, InputKind::Focus);
    }
}
